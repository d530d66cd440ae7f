// # KvStore Server
//
// Main entry point for the replicated key-value storage engine.
// Loads configuration, recovers engine state (as primary or secondary),
// and starts the network server.

use kvstore_engine::config::EngineConfig;
use kvstore_engine::engine::{Engine, Role};
use kvstore_engine::error::Result;
use kvstore_engine::network::KvServer;
use kvstore_engine::VERSION;
use std::path::PathBuf;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let install_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_file = install_dir.join("kvstore.toml");
    let mut config = EngineConfig::load(&config_file);
    if !config.data_dir.is_absolute() {
        config.data_dir = install_dir.join(&config.data_dir);
    }

    print_startup_info(&install_dir.display().to_string(), &config_file.display().to_string(), &config);

    info!("Initializing kvstore-engine");
    info!(version = VERSION);

    let role = if config.start_as_primary {
        Role::Primary
    } else {
        Role::Secondary {
            primary_addr: config.secondaries.first().cloned().unwrap_or_default(),
        }
    };

    let mut engine = Engine::new(config.clone(), role.clone());

    match &role {
        Role::Primary => {
            engine.init_primary()?;
            info!("engine initialized as primary");
        }
        Role::Secondary { primary_addr } => {
            info!(%primary_addr, "recovering from primary");
            let stream = tokio::net::TcpStream::connect(primary_addr)
                .await
                .map_err(kvstore_engine::KvError::Transport)?;
            let mut transport = kvstore_engine::replication::transport::Transport::new(stream);
            kvstore_engine::replication::sync::recover_from_primary(&mut engine, &mut transport)
                .await?;
            info!("recovery from primary complete");
        }
    }

    let addr = format!("{}:{}", config.listen_address, config.port);
    info!(%addr, "starting network server");
    println!();
    println!("kvstore-server is ready to accept connections on {addr}");
    println!();

    let server = KvServer::new(config);
    let result = server.run(engine).await;

    if let Err(ref e) = result {
        warn!(error = %e, "server stopped with error");
    } else {
        info!("server stopped gracefully");
    }

    result
}

fn print_banner() {
    println!("================================================================");
    println!("  kvstore-engine - replicated key-value storage engine v{VERSION}");
    println!("================================================================");
    println!();
}

fn print_startup_info(install_dir: &str, config_file: &str, config: &EngineConfig) {
    println!("Installation Directory: {install_dir}");
    println!("Configuration File:     {config_file}");
    println!();
    println!("Storage:");
    println!("  Data Directory:        {}", config.data_dir.display());
    println!("  Chunk Size Limit:      {} bytes", config.chunk_size_limit);
    println!("  Checkpoint Interval:   {} seconds", config.checkpoint_interval.as_secs());
    println!();
    println!("Network:");
    println!("  Listen Address:        {}", config.listen_address);
    println!("  Port:                  {}", config.port);
    println!("  Secondaries:           {:?}", config.secondaries);
    println!("  Sync Read Timeout:     {} seconds", config.sync_read_timeout.as_secs());
    println!();
    println!("Role:");
    println!("  Start as Primary:      {}", config.start_as_primary);
    println!();
}
