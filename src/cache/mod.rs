// Two-tier in-memory cache sitting in front of the chunk store.
//
// `updates_cache` holds everything written since the last checkpoint
// (including tombstones for pending deletes) and always wins. `read_cache`
// is populated lazily on a read miss and is invalidated whenever a key it
// holds is overwritten.

use crate::error::Result;
use crate::storage::{ChunkStore, KvMap};
use std::collections::HashMap;
use std::path::Path;

#[derive(Default)]
pub struct CacheTier {
    updates_cache: HashMap<String, KvMap>,
    read_cache: HashMap<String, KvMap>,
}

impl CacheTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// `updates_cache` wins, then `read_cache`, then disk (populating
    /// `read_cache` on the way out). Empty-string values (tombstones) are
    /// surfaced as-is; callers decide whether emptiness means "deleted".
    pub fn get(&mut self, data_dir: &Path, user: &str, key: &str) -> Result<String> {
        if let Some(value) = self.updates_cache.get(user).and_then(|m| m.get(key)) {
            return Ok(value.clone());
        }
        if let Some(value) = self.read_cache.get(user).and_then(|m| m.get(key)) {
            return Ok(value.clone());
        }

        let store = ChunkStore::init(data_dir.join(user), user, crate::config::DEFAULT_CHUNK_SIZE_LIMIT)?;
        let value = store.get(key)?;
        self.read_cache
            .entry(user.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Writes into `updates_cache` and evicts the key from `read_cache`.
    pub fn put(&mut self, user: &str, key: &str, value: String) {
        self.updates_cache
            .entry(user.to_string())
            .or_default()
            .insert(key.to_string(), value);

        if let Some(user_map) = self.read_cache.get_mut(user) {
            user_map.remove(key);
            if user_map.is_empty() {
                self.read_cache.remove(user);
            }
        }
    }

    /// Equivalent to `put` with an empty value (a tombstone).
    pub fn delete(&mut self, user: &str, key: &str) {
        self.put(user, key, String::new());
    }

    /// Merges the chunk store's full enumeration with pending updates,
    /// applying tombstones.
    pub fn get_all(&self, data_dir: &Path, user: &str) -> Result<KvMap> {
        let store = ChunkStore::init(data_dir.join(user), user, crate::config::DEFAULT_CHUNK_SIZE_LIMIT)?;
        let mut merged = store.get_all()?;

        if let Some(updates) = self.updates_cache.get(user) {
            for (key, value) in updates {
                if value.is_empty() {
                    merged.remove(key);
                } else {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(merged)
    }

    /// Returns and clears the pending updates for every user, ready to be
    /// flushed into the chunk store by a checkpoint.
    pub fn drain_updates(&mut self) -> HashMap<String, KvMap> {
        std::mem::take(&mut self.updates_cache)
    }

    pub fn clear(&mut self) {
        self.updates_cache.clear();
        self.read_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_masks_disk_value() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("alice")).unwrap();
        let mut cache = CacheTier::new();
        cache.put("alice", "name", "ada".to_string());
        assert_eq!(cache.get(dir.path(), "alice", "name").unwrap(), "ada");
    }

    #[test]
    fn delete_masks_disk_value_with_tombstone() {
        let dir = tempdir().unwrap();
        let user_dir = dir.path().join("alice");
        let mut store = ChunkStore::create(&user_dir, "alice", 1 << 26).unwrap();
        store
            .append_batch(&[("name".to_string(), "ada".to_string())].into_iter().collect())
            .unwrap();

        let mut cache = CacheTier::new();
        cache.delete("alice", "name");
        let all = cache.get_all(dir.path(), "alice").unwrap();
        assert!(!all.contains_key("name"));
    }
}
