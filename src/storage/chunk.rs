// Per-user chunk store: an append-only, lazily-compacted value log.
//
// A user's values are spread across numbered chunk files (`chunk-0`,
// `chunk-1`, ...), each holding a sequence of `key LF length LF bytes`
// records. Three sidecar files track the live layout: `chunk_index`
// (current append chunk and its size), `chunk_metadata` (key -> chunk-id),
// and `delete_list` (pending lazy-compaction work).

use crate::error::{KvError, Result};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const CHUNK_INDEX_FILE: &str = "chunk_index";
const CHUNK_METADATA_FILE: &str = "chunk_metadata";
const DELETE_LIST_FILE: &str = "delete_list";

pub type KvMap = HashMap<String, String>;

/// On-disk chunk store for a single user.
#[derive(Debug)]
pub struct ChunkStore {
    user: String,
    dir: PathBuf,
    size_limit: u64,
    append_index: u64,
    current_size: u64,
    metadata: HashMap<String, u64>,
    delete_list: Vec<(String, u64)>,
}

impl ChunkStore {
    /// Loads `chunk_index` and `chunk_metadata` for `user`. Fails with
    /// `UserNotFound` if the user's directory does not exist.
    pub fn init(dir: impl AsRef<Path>, user: &str, size_limit: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(KvError::UserNotFound {
                user: user.to_string(),
            });
        }

        let (append_index, current_size) = match fs::read_to_string(dir.join(CHUNK_INDEX_FILE)) {
            Ok(text) => parse_chunk_index(&text),
            Err(_) => (0, 0),
        };

        let metadata = match fs::read_to_string(dir.join(CHUNK_METADATA_FILE)) {
            Ok(text) => parse_chunk_metadata(&text),
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            user: user.to_string(),
            dir,
            size_limit,
            append_index,
            current_size,
            metadata,
            delete_list: Vec::new(),
        })
    }

    /// Creates the user's directory if absent and returns an empty store.
    /// Used on the first write for a user that has never been seen before.
    pub fn create(dir: impl AsRef<Path>, user: &str, size_limit: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            user: user.to_string(),
            dir,
            size_limit,
            append_index: 0,
            current_size: 0,
            metadata: HashMap::new(),
            delete_list: Vec::new(),
        })
    }

    fn chunk_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("chunk-{id}"))
    }

    /// Looks up the key's chunk and scans it sequentially for the last
    /// matching occurrence.
    pub fn get(&self, key: &str) -> Result<String> {
        let chunk_id = self
            .metadata
            .get(key)
            .ok_or_else(|| KvError::KeyNotFound {
                user: self.user.clone(),
                key: key.to_string(),
            })?;

        let mut file = File::open(self.chunk_path(*chunk_id)).map_err(|_| KvError::KeyNotFound {
            user: self.user.clone(),
            key: key.to_string(),
        })?;

        let mut found = None;
        for (record_key, value) in iter_chunk_records(&mut file)? {
            if record_key == key {
                found = Some(value);
            }
        }

        found.ok_or_else(|| KvError::KeyNotFound {
            user: self.user.clone(),
            key: key.to_string(),
        })
    }

    /// One `get` per metadata entry.
    pub fn get_all(&self) -> Result<KvMap> {
        let mut out = KvMap::new();
        for key in self.metadata.keys() {
            out.insert(key.clone(), self.get(key)?);
        }
        Ok(out)
    }

    /// Applies a batch of puts/deletes, rotating the append chunk as
    /// needed, then persists metadata and runs lazy compaction.
    pub fn append_batch(&mut self, batch: &KvMap) -> Result<()> {
        let mut file = open_append(self.chunk_path(self.append_index))?;

        for (key, value) in batch {
            if value.is_empty() {
                if let Some(old_id) = self.metadata.remove(key) {
                    self.delete_list.push((key.clone(), old_id));
                }
                continue;
            }

            if let Some(&old_id) = self.metadata.get(key) {
                self.delete_list.push((key.clone(), old_id));
            }

            write_record(&mut file, key, value)?;
            self.metadata.insert(key.clone(), self.append_index);

            self.current_size = file
                .stream_position()
                .map_err(|e| KvError::LogWrite(e.to_string()))?;

            if self.current_size > self.size_limit {
                self.append_index += 1;
                self.current_size = 0;
                file = open_append(self.chunk_path(self.append_index))?;
            }
        }

        file.sync_all()?;
        self.persist()?;
        self.compact()?;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        fs::write(
            self.dir.join(CHUNK_INDEX_FILE),
            format!("{}\n{}", self.append_index, self.current_size),
        )?;

        let mut metadata_text = String::new();
        for (key, id) in &self.metadata {
            metadata_text.push_str(key);
            metadata_text.push('\n');
            metadata_text.push_str(&id.to_string());
            metadata_text.push('\n');
        }
        fs::write(self.dir.join(CHUNK_METADATA_FILE), metadata_text)?;

        if !self.delete_list.is_empty() {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(DELETE_LIST_FILE))?;
            for (key, id) in &self.delete_list {
                writeln!(file, "{key}\n{id}")?;
            }
        }

        Ok(())
    }

    /// Groups `delete_list` entries by chunk-id and rewrites each affected
    /// chunk, dropping exactly the deleted multiset of occurrences, then
    /// erases `delete_list`.
    fn compact(&mut self) -> Result<()> {
        let path = self.dir.join(DELETE_LIST_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => return Ok(()),
        };

        let mut by_chunk: HashMap<u64, HashMap<String, u32>> = HashMap::new();
        let mut lines = text.lines();
        while let (Some(key), Some(id)) = (lines.next(), lines.next()) {
            let id: u64 = id.parse().map_err(|_| {
                KvError::Recovery(format!("malformed delete_list entry for key {key}"))
            })?;
            *by_chunk.entry(id).or_default().entry(key.to_string()).or_insert(0) += 1;
        }

        for (chunk_id, mut to_drop) in by_chunk {
            let chunk_path = self.chunk_path(chunk_id);
            let mut file = match File::open(&chunk_path) {
                Ok(f) => f,
                Err(_) => continue,
            };
            let records = iter_chunk_records(&mut file)?;

            let mut kept = Vec::with_capacity(records.len());
            for (key, value) in records {
                let remaining = to_drop.get_mut(&key);
                match remaining {
                    Some(count) if *count > 0 => {
                        *count -= 1;
                    }
                    _ => kept.push((key, value)),
                }
            }

            let mut out = File::create(&chunk_path)?;
            for (key, value) in &kept {
                write_record(&mut out, key, value)?;
            }
            out.sync_all()?;
            self.gc_if_empty(chunk_id, kept.is_empty())?;
        }

        fs::remove_file(&path)?;
        self.delete_list.clear();
        Ok(())
    }

    /// Truncates a chunk file to zero bytes once no metadata entry
    /// references it. Enhancement noted in the design notes: the original
    /// program never reclaims chunk files.
    fn gc_if_empty(&self, chunk_id: u64, rewritten_empty: bool) -> Result<()> {
        if !rewritten_empty {
            return Ok(());
        }
        if self.metadata.values().any(|&id| id == chunk_id) {
            return Ok(());
        }
        if chunk_id == self.append_index {
            // still the active append target; leave it be.
            return Ok(());
        }
        let _ = fs::remove_file(self.chunk_path(chunk_id)).or_else(|_| {
            File::create(self.chunk_path(chunk_id)).map(|_| ())
        });
        Ok(())
    }
}

fn parse_chunk_index(text: &str) -> (u64, u64) {
    let mut lines = text.lines();
    let append_index = lines.next().and_then(|l| l.parse().ok()).unwrap_or(0);
    let current_size = lines.next().and_then(|l| l.parse().ok()).unwrap_or(0);
    (append_index, current_size)
}

fn parse_chunk_metadata(text: &str) -> HashMap<String, u64> {
    let mut map = HashMap::new();
    let mut lines = text.lines();
    while let (Some(key), Some(id)) = (lines.next(), lines.next()) {
        if let Ok(id) = id.parse() {
            map.insert(key.to_string(), id);
        }
    }
    map
}

fn open_append(path: PathBuf) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn write_record(file: &mut File, key: &str, value: &str) -> Result<()> {
    write!(file, "{key}\n{}\n", value.len())?;
    file.write_all(value.as_bytes())?;
    Ok(())
}

/// Reads every `key LF length LF bytes` record in a chunk file, in order.
fn iter_chunk_records(file: &mut File) -> Result<Vec<(String, String)>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut records = Vec::new();
    let mut cursor = 0usize;
    while cursor < buf.len() {
        let key_end = find_lf(&buf, cursor)?;
        let key = String::from_utf8_lossy(&buf[cursor..key_end]).into_owned();
        cursor = key_end + 1;

        let size_end = find_lf(&buf, cursor)?;
        let size: usize = std::str::from_utf8(&buf[cursor..size_end])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| KvError::Recovery("malformed chunk length header".into()))?;
        cursor = size_end + 1;

        if cursor + size > buf.len() {
            return Err(KvError::Recovery("chunk record truncated".into()));
        }
        let value = String::from_utf8_lossy(&buf[cursor..cursor + size]).into_owned();
        cursor += size;

        records.push((key, value));
    }
    Ok(records)
}

fn find_lf(buf: &[u8], from: usize) -> Result<usize> {
    buf[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|p| from + p)
        .ok_or_else(|| KvError::Recovery("missing newline in chunk header".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn batch(pairs: &[(&str, &str)]) -> KvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn init_fails_for_missing_user() {
        let dir = tempdir().unwrap();
        let err = ChunkStore::init(dir.path().join("nobody"), "nobody", 1 << 26).unwrap_err();
        assert!(matches!(err, KvError::UserNotFound { .. }));
    }

    #[test]
    fn append_then_get_roundtrips() {
        let dir = tempdir().unwrap();
        let user_dir = dir.path().join("alice");
        let mut store = ChunkStore::create(&user_dir, "alice", 1 << 26).unwrap();
        store.append_batch(&batch(&[("name", "ada")])).unwrap();

        let store = ChunkStore::init(&user_dir, "alice", 1 << 26).unwrap();
        assert_eq!(store.get("name").unwrap(), "ada");
    }

    #[test]
    fn delete_then_rewrite_drops_key() {
        let dir = tempdir().unwrap();
        let user_dir = dir.path().join("alice");
        let mut store = ChunkStore::create(&user_dir, "alice", 1 << 26).unwrap();
        store.append_batch(&batch(&[("k", "v1")])).unwrap();
        store.append_batch(&batch(&[("k", "v2")])).unwrap();
        store.append_batch(&batch(&[("k", "")])).unwrap();

        let store = ChunkStore::init(&user_dir, "alice", 1 << 26).unwrap();
        assert!(store.get("k").is_err());
    }

    #[test]
    fn chunk_rotates_past_size_limit() {
        let dir = tempdir().unwrap();
        let user_dir = dir.path().join("alice");
        let mut store = ChunkStore::create(&user_dir, "alice", 64).unwrap();
        store
            .append_batch(&batch(&[("a", &"x".repeat(40)), ("b", &"y".repeat(40))]))
            .unwrap();

        assert!(user_dir.join("chunk-0").exists());
        assert!(user_dir.join("chunk-1").exists());
    }

    #[test]
    fn get_all_reflects_latest_values() {
        let dir = tempdir().unwrap();
        let user_dir = dir.path().join("alice");
        let mut store = ChunkStore::create(&user_dir, "alice", 1 << 26).unwrap();
        store
            .append_batch(&batch(&[("a", "1"), ("b", "2")]))
            .unwrap();
        store.append_batch(&batch(&[("a", "3")])).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.get("a").unwrap(), "3");
        assert_eq!(all.get("b").unwrap(), "2");
    }
}
