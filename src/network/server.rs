// TCP server: a dedicated acceptor task hands each connection off to a
// single command-processing loop that owns the `Engine` exclusively, so one
// command - including any synchronous forwarding to secondaries - is fully
// processed before the next is read. Per-connection tasks only frame and
// forward bytes; they never touch engine state directly.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{KvError, Result};
use crate::replication::protocol::{
    Command, Reply, VERB_ALL, VERB_CKPT, VERB_CLUSTER, VERB_CPUT, VERB_DELE, VERB_GETS, VERB_KILL,
    VERB_PUTS, VERB_RESTART,
};
use crate::replication::sync;
use crate::replication::transport::{Transport, CONTROL_SYNC};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{error, info, warn};

enum Job {
    Request {
        command: Command,
        respond_to: oneshot::Sender<Reply>,
    },
    SyncSession(TcpStream),
}

pub struct KvServer {
    config: EngineConfig,
}

impl KvServer {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Binds the listener and runs until a `KILL` command is processed.
    pub async fn run(self, mut engine: Engine) -> Result<()> {
        let listen_addr = format!("{}:{}", self.config.listen_address, self.config.port);
        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(KvError::Transport)?;
        info!(%listen_addr, "kvstore-server listening");

        let (job_tx, mut job_rx) = mpsc::channel::<Job>(256);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let sync_timeout = self.config.sync_read_timeout;
        let mut secondaries = self.config.secondaries.clone();

        let command_loop = tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                match job {
                    Job::Request { command, respond_to } => {
                        let is_kill = command.com == VERB_KILL;
                        let reply = dispatch(&mut engine, &command, &mut secondaries).await;
                        let _ = respond_to.send(reply);
                        if is_kill {
                            let _ = shutdown_tx.send(true);
                            break;
                        }
                    }
                    Job::SyncSession(stream) => {
                        let mut transport = Transport::new(stream);
                        let outcome =
                            timeout(sync_timeout, sync::sync_secondary(&engine, &mut transport))
                                .await;
                        match outcome {
                            Ok(Ok(())) => info!("sync session completed"),
                            Ok(Err(e)) => warn!(error = %e, "sync session failed"),
                            Err(_) => warn!("sync session timed out"),
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() && *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (socket, peer) = accepted.map_err(KvError::Transport)?;
                    info!(%peer, "accepted connection");
                    let job_tx = job_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, job_tx).await {
                            error!(error = %e, %peer, "connection handler failed");
                        }
                    });
                }
            }
        }

        drop(job_tx);
        let _ = command_loop.await;
        info!("kvstore-server stopped");
        Ok(())
    }
}

/// Reads one length-prefixed message at a time off `socket`, forwarding
/// each decoded command to the engine's command loop and writing back
/// whatever reply it produces. A bare `SYNC` token hands the whole
/// connection over to the command loop instead.
async fn handle_connection(socket: TcpStream, job_tx: mpsc::Sender<Job>) -> Result<()> {
    let mut transport = Transport::new(socket);

    loop {
        let bytes = match transport.recv_bytes().await {
            Ok(bytes) => bytes,
            Err(_) => return Ok(()), // peer disconnected
        };

        if bytes == CONTROL_SYNC.as_bytes() {
            let socket = transport.into_inner();
            let _ = job_tx.send(Job::SyncSession(socket)).await;
            return Ok(());
        }

        let (command, _): (Command, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| KvError::Serialization(e.to_string()))?;

        let (respond_to, response) = oneshot::channel();
        if job_tx
            .send(Job::Request {
                command,
                respond_to,
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        let reply = response.await.unwrap_or_else(|_| Reply::error(-1));
        transport.send_reply(&reply).await?;
    }
}

async fn dispatch(engine: &mut Engine, command: &Command, secondaries: &mut Vec<String>) -> Reply {
    let result = match command.com.as_str() {
        VERB_PUTS => engine
            .put(&command.usr, &command.key, command.value1.clone(), command.seq)
            .map(|()| Reply::ok()),
        VERB_GETS => engine.get(&command.usr, &command.key).map(Reply::ok_with_value),
        VERB_CPUT => engine
            .cput(
                &command.usr,
                &command.key,
                &command.value1,
                command.value2.clone(),
                command.seq,
            )
            .map(|()| Reply::ok()),
        VERB_DELE => engine
            .delete(&command.usr, &command.key, command.seq)
            .map(|()| Reply::ok()),
        VERB_ALL => engine
            .get_all(&command.usr)
            .map(|pairs| Reply::ok_with_pairs(pairs.into_iter().collect())),
        VERB_CKPT => engine.checkpoint().map(|()| Reply::ok()),
        VERB_CLUSTER => {
            *secondaries = command.addrs.clone();
            Ok(Reply::ok())
        }
        VERB_KILL => engine.prepare_shutdown().map(|()| Reply::ok()),
        VERB_RESTART => engine.replay().map(|()| Reply::ok()),
        other => Err(KvError::Serialization(format!("unknown verb: {other}"))),
    };

    let reply = match result {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, verb = %command.com, "command failed");
            Reply::error(e.status_code())
        }
    };

    if matches!(command.com.as_str(), VERB_PUTS | VERB_CPUT | VERB_DELE) && reply.is_ok() {
        forward_to_secondaries(secondaries, command).await;
    }

    reply
}

/// Best-effort live forwarding: a secondary connection failure is logged
/// and otherwise ignored, per the protocol's crash-detection split between
/// the engine and the master coordinator.
async fn forward_to_secondaries(secondaries: &[String], command: &Command) {
    for addr in secondaries {
        let outcome = timeout(Duration::from_secs(5), forward_one(addr, command)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%addr, error = %e, "forwarding to secondary failed"),
            Err(_) => warn!(%addr, "forwarding to secondary timed out"),
        }
    }
}

async fn forward_one(addr: &str, command: &Command) -> Result<()> {
    let stream = TcpStream::connect(addr).await.map_err(KvError::Transport)?;
    let mut transport = Transport::new(stream);
    transport.send_command(command).await?;
    transport.recv_reply().await?;
    Ok(())
}
