// Primary<->secondary sync handshake: log-replay catch-up when the
// primary hasn't checkpointed past the secondary's last checkpoint, full
// directory-tree sync otherwise.

use crate::engine::Engine;
use crate::error::{KvError, Result};
use crate::replication::transport::{
    FileEnvelope, FileKind, Transport, CONTROL_FULL, CONTROL_OK, CONTROL_SYNC, CONTROL_SYNC_DONE,
    CONTROL_SYNC_ERROR,
};
use std::fs;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

/// Secondary side: contact the primary over `transport` and bring this
/// engine's on-disk state and caches up to date.
pub async fn recover_from_primary<S>(engine: &mut Engine, transport: &mut Transport<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transport.send_control(CONTROL_SYNC).await?;

    let wal_envelope = transport.recv_file_envelope().await?;

    let local_checkpoint = engine.wal().exists().then(|| engine.wal().checkpoint_sequence().ok()).flatten();
    let remote_checkpoint = parse_remote_checkpoint(&wal_envelope.body);

    let need_full = match (local_checkpoint, remote_checkpoint) {
        (Some(local), Some(remote)) => remote > local,
        _ => true,
    };

    let outcome = if need_full {
        transport.send_control(CONTROL_FULL).await?;
        reset_for_full_sync(engine)?;
        receive_full_sync(engine, transport).await
    } else {
        transport.send_control(CONTROL_OK).await?;
        engine.wal().overwrite_raw(&wal_envelope.body)?;
        engine.replay()
    };

    match &outcome {
        Ok(()) => transport.send_control(CONTROL_SYNC_DONE).await?,
        Err(_) => transport.send_control(CONTROL_SYNC_ERROR).await?,
    }

    outcome.map_err(|e| KvError::Sync(e.to_string()))
}

fn parse_remote_checkpoint(wal_bytes: &[u8]) -> Option<u64> {
    crate::replication::wal::wal_checkpoint_sequence_from_bytes(wal_bytes).ok()
}

fn reset_for_full_sync(engine: &mut Engine) -> Result<()> {
    engine.reset_sequence(0);
    engine.clear_caches();
    if engine.data_dir().exists() {
        fs::remove_dir_all(engine.data_dir())?;
    }
    fs::create_dir_all(engine.data_dir())?;
    Ok(())
}

async fn receive_full_sync<S>(engine: &mut Engine, transport: &mut Transport<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let bytes = transport.recv_bytes().await?;
        if bytes == CONTROL_SYNC_DONE.as_bytes() {
            break;
        }
        if bytes == CONTROL_SYNC_ERROR.as_bytes() {
            return Err(KvError::Sync("primary reported SYNC ERROR".into()));
        }

        let envelope = crate::replication::transport::parse_file_envelope(&bytes)?;
        materialize(engine.data_dir(), &envelope)?;
    }

    engine.replay()
}

fn materialize(data_dir: &Path, envelope: &FileEnvelope) -> Result<()> {
    let target = data_dir.join(&envelope.relative_path);
    match envelope.kind {
        FileKind::Dir => {
            fs::create_dir_all(&target)?;
        }
        FileKind::File => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &envelope.body)?;
        }
    }
    Ok(())
}

/// Primary side: drive a sync session with a secondary that has already
/// sent `SYNC`.
pub async fn sync_secondary<S>(engine: &Engine, transport: &mut Transport<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let wal_bytes = engine.wal().read_raw()?;
    transport
        .send_file_envelope(&FileEnvelope {
            relative_path: "logging".to_string(),
            kind: FileKind::File,
            body: wal_bytes,
        })
        .await?;

    let response = transport.recv_control().await?;
    if response == CONTROL_FULL {
        send_full_tree(engine, transport).await?;
    }

    let final_status = transport.recv_control().await?;
    if final_status == CONTROL_SYNC_DONE {
        Ok(())
    } else {
        Err(KvError::Sync("secondary reported SYNC ERROR".into()))
    }
}

async fn send_full_tree<S>(engine: &Engine, transport: &mut Transport<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = send_full_tree_inner(engine, transport).await;
    match &result {
        Ok(()) => transport.send_control(CONTROL_SYNC_DONE).await?,
        Err(_) => transport.send_control(CONTROL_SYNC_ERROR).await?,
    }
    result
}

async fn send_full_tree_inner<S>(engine: &Engine, transport: &mut Transport<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let root = engine.data_dir();
    if !root.exists() {
        return Ok(());
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .map_err(|e| KvError::Sync(e.to_string()))?
                .to_string_lossy()
                .into_owned();

            if path.is_dir() {
                transport
                    .send_file_envelope(&FileEnvelope {
                        relative_path: relative,
                        kind: FileKind::Dir,
                        body: Vec::new(),
                    })
                    .await?;
                stack.push(path);
            } else {
                let body = fs::read(&path)?;
                transport
                    .send_file_envelope(&FileEnvelope {
                        relative_path: relative,
                        kind: FileKind::File,
                        body,
                    })
                    .await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{Engine, Role};
    use tempfile::tempdir;
    use tokio::io::duplex;

    async fn make_primary(dir: &std::path::Path, user: &str, pairs: &[(&str, &str)]) -> Engine {
        let config = EngineConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let mut engine = Engine::new(config, Role::Primary);
        engine.init_primary().unwrap();
        for (i, (key, value)) in pairs.iter().enumerate() {
            engine.put(user, key, value.to_string(), i as u64 + 1).unwrap();
        }
        engine.checkpoint().unwrap();
        engine
    }

    #[tokio::test]
    async fn full_sync_converges_secondary_with_primary() {
        let primary_dir = tempdir().unwrap();
        let secondary_dir = tempdir().unwrap();

        let mut primary = make_primary(primary_dir.path(), "alice", &[("name", "ada"), ("age", "30")]).await;

        let secondary_config = EngineConfig {
            data_dir: secondary_dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut secondary = Engine::new(secondary_config, Role::Secondary {
            primary_addr: "unused".to_string(),
        });

        let (client, server) = duplex(1 << 20);
        let mut secondary_transport = Transport::new(client);
        let mut primary_transport = Transport::new(server);

        let (secondary_result, primary_result) = tokio::join!(
            recover_from_primary(&mut secondary, &mut secondary_transport),
            async {
                primary_transport.recv_control().await.unwrap();
                sync_secondary(&primary, &mut primary_transport).await
            }
        );

        secondary_result.unwrap();
        primary_result.unwrap();

        assert_eq!(
            secondary.get_all("alice").unwrap(),
            primary.get_all("alice").unwrap()
        );
        assert_eq!(secondary.sequence_id(), primary.sequence_id());
    }
}
