// Engine facade: the single point through which the network layer and the
// sync protocol touch storage, cache, and the WAL. Every public mutator
// validates the user/key and checks the sequence guard before it ever
// reaches the log or the cache. CPut advances the guard only once its
// value comparison has succeeded, so a failed compare can be retried at
// the same sequence number. Replay re-derives the guard from the WAL
// itself, checking each record's sequence as it applies it.

pub mod sequence;

use crate::cache::CacheTier;
use crate::config::EngineConfig;
use crate::domain::{RecordKey, UserId};
use crate::error::{KvError, Result};
use crate::replication::wal::{Wal, WalOp};
use crate::storage::KvMap;
use sequence::SequenceGuard;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum Role {
    Primary,
    Secondary { primary_addr: String },
}

pub struct Engine {
    config: EngineConfig,
    role: Role,
    wal: Wal,
    cache: CacheTier,
    sequence: SequenceGuard,
}

impl Engine {
    pub fn new(config: EngineConfig, role: Role) -> Self {
        let wal = Wal::new(config.wal_path());
        Self {
            config,
            role,
            wal,
            cache: CacheTier::new(),
            sequence: SequenceGuard::new(0),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence.current()
    }

    pub fn reset_sequence(&mut self, value: u64) {
        self.sequence.reset(value);
    }

    pub fn clear_caches(&mut self) {
        self.cache.clear();
    }

    /// First boot of a primary with no prior state: lays down an empty data
    /// directory and a fresh WAL checkpointed at sequence 0.
    pub fn init_primary(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.config.data_dir)?;
        if !self.wal.exists() {
            self.wal.reset_to(0)?;
        }
        self.replay()
    }

    /// Replays the WAL (checkpoint marker plus every logged op since) into
    /// the cache. Used on startup recovery and after a sync session lands
    /// new on-disk state. Each record's sequence number is checked against
    /// the guard as it is applied, so a gap or an out-of-order record in
    /// the log surfaces as a recovery error instead of being silently
    /// accepted.
    pub fn replay(&mut self) -> Result<()> {
        if !self.wal.exists() {
            self.wal.reset_to(0)?;
        }
        let (checkpoint_seq, entries) = self.wal.parse()?;
        self.cache.clear();
        self.sequence.reset(checkpoint_seq);

        for entry in &entries {
            self.sequence.check(entry.seq).map_err(|_| {
                KvError::Recovery(format!(
                    "WAL record seq {} out of order (expected {})",
                    entry.seq,
                    self.sequence.expected()
                ))
            })?;
            match &entry.op {
                WalOp::Put { value } => self.cache.put(&entry.user, &entry.key, value.clone()),
                WalOp::Delete => self.cache.delete(&entry.user, &entry.key),
            }
            self.sequence.advance(entry.seq);
        }
        info!(checkpoint_seq, replayed = entries.len(), "replayed write-ahead log");
        Ok(())
    }

    pub fn get(&mut self, user: &str, key: &str) -> Result<String> {
        UserId::new(user)?;
        RecordKey::new(key)?;

        let value = self.cache.get(&self.config.data_dir, user, key)?;
        if value.is_empty() {
            return Err(KvError::KeyNotFound {
                user: user.to_string(),
                key: key.to_string(),
            });
        }
        Ok(value)
    }

    pub fn get_all(&mut self, user: &str) -> Result<KvMap> {
        UserId::new(user)?;
        self.cache.get_all(&self.config.data_dir, user)
    }

    pub fn put(&mut self, user: &str, key: &str, value: String, seq: u64) -> Result<()> {
        UserId::new(user)?;
        RecordKey::new(key)?;
        self.sequence.validate_and_advance(seq)?;
        self.commit_put(user, key, value, seq, true)
    }

    pub fn delete(&mut self, user: &str, key: &str, seq: u64) -> Result<()> {
        UserId::new(user)?;
        RecordKey::new(key)?;
        self.sequence.validate_and_advance(seq)?;
        self.commit_delete(user, key, seq, true)
    }

    /// Compare-and-put: succeeds only if the key's current value equals
    /// `expected`. A missing key surfaces whatever `get` would have
    /// returned for it, matching the read-then-write shape of the
    /// original two-step implementation. The sequence number is only
    /// consumed once the comparison succeeds, so a mismatched CPut can be
    /// retried at the same `seq`.
    pub fn cput(
        &mut self,
        user: &str,
        key: &str,
        expected: &str,
        new_value: String,
        seq: u64,
    ) -> Result<()> {
        UserId::new(user)?;
        RecordKey::new(key)?;
        self.sequence.check(seq)?;

        let current = self.get(user, key)?;
        if current != expected {
            return Err(KvError::ValueMismatch {
                user: user.to_string(),
                key: key.to_string(),
            });
        }

        self.sequence.advance(seq);
        self.commit_put(user, key, new_value, seq, true)
    }

    fn ensure_user_dir(&self, user: &str) -> Result<()> {
        std::fs::create_dir_all(self.config.user_dir(user))?;
        Ok(())
    }

    fn commit_put(&mut self, user: &str, key: &str, value: String, seq: u64, logging: bool) -> Result<()> {
        if logging {
            self.ensure_user_dir(user)?;
            self.wal.append_put(seq, user, key, &value)?;
        }
        self.cache.put(user, key, value);
        Ok(())
    }

    fn commit_delete(&mut self, user: &str, key: &str, seq: u64, logging: bool) -> Result<()> {
        if logging {
            self.ensure_user_dir(user)?;
            self.wal.append_delete(seq, user, key)?;
        }
        self.cache.delete(user, key);
        Ok(())
    }

    /// Flushes every pending cache update into its user's chunk store and
    /// truncates the WAL to a fresh checkpoint marker at the current
    /// sequence, fsync'd before the old log is discarded.
    pub fn checkpoint(&mut self) -> Result<()> {
        let updates = self.cache.drain_updates();
        for (user, batch) in &updates {
            let user_dir = self.config.user_dir(user);
            let mut store = if user_dir.is_dir() {
                crate::storage::ChunkStore::init(&user_dir, user, self.config.chunk_size_limit)?
            } else {
                crate::storage::ChunkStore::create(&user_dir, user, self.config.chunk_size_limit)?
            };
            store.append_batch(batch)?;
        }

        let seq = self.sequence.current();
        self.wal.reset_to(seq)?;
        info!(sequence = seq, users = updates.len(), "checkpoint complete");
        Ok(())
    }

    /// Admin kill: flush whatever is pending so a restart has nothing to
    /// lose beyond what the WAL already covers, then signal the caller to
    /// tear the process down. The engine itself stays valid; only the
    /// network listener needs to stop accepting connections.
    pub fn prepare_shutdown(&mut self) -> Result<()> {
        warn!("kill requested, flushing pending writes");
        self.checkpoint()
    }

    pub fn is_secondary(&self) -> bool {
        matches!(self.role, Role::Secondary { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path) -> Engine {
        let config = EngineConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let mut engine = Engine::new(config, Role::Primary);
        engine.init_primary().unwrap();
        engine
    }

    #[test]
    fn put_then_get_roundtrips_before_checkpoint() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.put("alice", "name", "ada".into(), 1).unwrap();
        assert_eq!(engine.get("alice", "name").unwrap(), "ada");
    }

    #[test]
    fn out_of_order_sequence_is_rejected() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.put("alice", "name", "ada".into(), 1).unwrap();
        let err = engine.put("alice", "age", "30".into(), 3).unwrap_err();
        assert!(matches!(err, KvError::Sequence { expected: 2, got: 3 }));
    }

    #[test]
    fn cput_fails_on_mismatch_without_writing() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.put("alice", "name", "ada".into(), 1).unwrap();
        let err = engine
            .cput("alice", "name", "wrong", "grace".into(), 2)
            .unwrap_err();
        assert!(matches!(err, KvError::ValueMismatch { .. }));
        assert_eq!(engine.get("alice", "name").unwrap(), "ada");
    }

    #[test]
    fn cput_propagates_key_not_found_for_missing_key() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.put("alice", "name", "ada".into(), 1).unwrap();
        let err = engine
            .cput("alice", "missing", "x", "y".into(), 2)
            .unwrap_err();
        assert!(matches!(err, KvError::KeyNotFound { .. }));
    }

    #[test]
    fn cput_propagates_user_not_found_for_unknown_user() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        let err = engine
            .cput("nobody", "missing", "x", "y".into(), 1)
            .unwrap_err();
        assert!(matches!(err, KvError::UserNotFound { .. }));
    }

    #[test]
    fn cput_succeeds_on_match() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.put("alice", "name", "ada".into(), 1).unwrap();
        engine
            .cput("alice", "name", "ada", "grace".into(), 2)
            .unwrap();
        assert_eq!(engine.get("alice", "name").unwrap(), "grace");
    }

    #[test]
    fn checkpoint_then_restart_recovers_state() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        for i in 0..100u64 {
            engine
                .put("alice", &format!("k{i}"), format!("v{i}"), i + 1)
                .unwrap();
        }
        engine.checkpoint().unwrap();
        for i in 100..105u64 {
            engine
                .put("alice", &format!("k{i}"), format!("v{i}"), i + 1)
                .unwrap();
        }

        let config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut restarted = Engine::new(config, Role::Primary);
        restarted.replay().unwrap();

        assert_eq!(restarted.get("alice", "k0").unwrap(), "v0");
        assert_eq!(restarted.get("alice", "k104").unwrap(), "v104");
        assert_eq!(restarted.sequence_id(), 105);
    }

    #[test]
    fn delete_then_checkpoint_removes_key_from_disk() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.put("alice", "name", "ada".into(), 1).unwrap();
        engine.checkpoint().unwrap();
        engine.delete("alice", "name", 2).unwrap();
        engine.checkpoint().unwrap();

        assert!(engine.get("alice", "name").is_err());
    }

    #[test]
    fn cput_mismatch_does_not_consume_the_sequence_number() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.put("alice", "pw", "old".into(), 1).unwrap();

        let err = engine
            .cput("alice", "pw", "wrong", "new".into(), 2)
            .unwrap_err();
        assert!(matches!(err, KvError::ValueMismatch { .. }));

        engine
            .cput("alice", "pw", "old", "new".into(), 2)
            .unwrap();
        assert_eq!(engine.get("alice", "pw").unwrap(), "new");
        assert_eq!(engine.sequence_id(), 2);
    }

    #[test]
    fn replay_rejects_a_gap_in_wal_sequence_numbers() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.put("alice", "k1", "v1".into(), 1).unwrap();
        // Skip seq 2 entirely to simulate a corrupted or truncated WAL.
        engine.wal.append_put(3, "alice", "k3", "v3").unwrap();

        let mut restarted = Engine::new(
            EngineConfig {
                data_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            Role::Primary,
        );
        let err = restarted.replay().unwrap_err();
        assert!(matches!(err, KvError::Recovery(_)));
    }

    #[test]
    fn put_rejects_invalid_user_and_key_without_consuming_sequence() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());

        let err = engine.put("ali/ce", "name", "ada".into(), 1).unwrap_err();
        assert!(matches!(err, KvError::InvalidUser(_)));

        let err = engine.put("alice", "bad key", "ada".into(), 1).unwrap_err();
        assert!(matches!(err, KvError::InvalidKey(_)));

        assert_eq!(engine.sequence_id(), 0);
        engine.put("alice", "name", "ada".into(), 1).unwrap();
    }

    #[test]
    fn get_rejects_invalid_user_and_key() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        assert!(matches!(
            engine.get("ali/ce", "name").unwrap_err(),
            KvError::InvalidUser(_)
        ));
        assert!(matches!(
            engine.get("alice", "bad key").unwrap_err(),
            KvError::InvalidKey(_)
        ));
        assert!(matches!(
            engine.get_all("ali/ce").unwrap_err(),
            KvError::InvalidUser(_)
        ));
    }
}
