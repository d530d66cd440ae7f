// Write-ahead log: a single append-only file holding exactly one
// checkpoint marker followed by zero or more operation records with
// strictly increasing sequence numbers.
//
// Parsing is a streaming, length-delimited walk of the file rather than a
// regular expression: a header is read up to its terminating LF, and for
// operation records exactly `length` body bytes are then consumed. Regex
// framing is unnecessary here and risks catastrophic backtracking on
// pathological input.

use crate::error::{KvError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const MARKER_PREFIX: &str = "KvStoreLogEntry Checkpointed at SequenceID: ";
const OP_PREFIX: &str = "KvStoreLogEntry Seq ";
pub const OP_PUTS: &str = "Puts";
pub const OP_DELE: &str = "Dele";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalOp {
    Put { value: String },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub seq: u64,
    pub user: String,
    pub key: String,
    pub op: WalOp,
}

pub struct Wal {
    path: PathBuf,
}

impl Wal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Appends a Put record and fsyncs before returning.
    pub fn append_put(&self, seq: u64, user: &str, key: &str, value: &str) -> Result<()> {
        let entry = format!(
            "{OP_PREFIX}{seq} user {user} key {key} op {OP_PUTS} length {}\n{value}\n",
            value.len()
        );
        self.append_raw(entry.as_bytes())
    }

    /// Appends a Delete record and fsyncs before returning.
    pub fn append_delete(&self, seq: u64, user: &str, key: &str) -> Result<()> {
        let entry = format!("{OP_PREFIX}{seq} user {user} key {key} op {OP_DELE} length 0\n");
        self.append_raw(entry.as_bytes())
    }

    fn append_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| KvError::LogWrite(e.to_string()))?;
        file.write_all(bytes)
            .map_err(|e| KvError::LogWrite(e.to_string()))?;
        file.sync_all().map_err(|e| KvError::LogWrite(e.to_string()))?;
        Ok(())
    }

    /// Truncates the WAL and writes a fresh checkpoint marker, fsync'd.
    pub fn reset_to(&self, new_sequence_id: u64) -> Result<()> {
        let marker = format!("{MARKER_PREFIX}{new_sequence_id}\n");
        let mut file = File::create(&self.path).map_err(|e| KvError::LogWrite(e.to_string()))?;
        file.write_all(marker.as_bytes())
            .map_err(|e| KvError::LogWrite(e.to_string()))?;
        file.sync_all().map_err(|e| KvError::LogWrite(e.to_string()))?;
        Ok(())
    }

    /// Reads the whole file and parses the checkpoint marker's sequence
    /// number plus every following operation record, in order.
    pub fn parse(&self) -> Result<(u64, Vec<WalEntry>)> {
        let bytes = fs::read(&self.path).map_err(|e| KvError::Recovery(e.to_string()))?;
        parse_wal_bytes(&bytes)
    }

    /// Only the checkpoint marker, without decoding the operation records
    /// - used by the secondary when deciding FULL vs log-replay sync.
    pub fn checkpoint_sequence(&self) -> Result<u64> {
        let bytes = fs::read(&self.path).map_err(|e| KvError::Recovery(e.to_string()))?;
        checkpoint_sequence_from_bytes(&bytes)
    }

    pub fn read_raw(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|e| KvError::Recovery(e.to_string()))
    }

    /// Overwrites the WAL wholesale with bytes received from a peer during
    /// sync, fsync'd.
    pub fn overwrite_raw(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&self.path).map_err(|e| KvError::Sync(e.to_string()))?;
        file.write_all(bytes).map_err(|e| KvError::Sync(e.to_string()))?;
        file.sync_all().map_err(|e| KvError::Sync(e.to_string()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Same as [`Wal::checkpoint_sequence`] but operating on an in-memory WAL
/// image, for the secondary side of a sync session deciding FULL vs replay.
pub fn wal_checkpoint_sequence_from_bytes(bytes: &[u8]) -> Result<u64> {
    checkpoint_sequence_from_bytes(bytes)
}

fn checkpoint_sequence_from_bytes(bytes: &[u8]) -> Result<u64> {
    let line_end = find_lf(bytes, 0)
        .ok_or_else(|| KvError::Recovery("WAL missing checkpoint marker".into()))?;
    let line = std::str::from_utf8(&bytes[..line_end])
        .map_err(|_| KvError::Recovery("WAL marker is not valid UTF-8".into()))?;
    parse_marker(line)
}

fn parse_wal_bytes(bytes: &[u8]) -> Result<(u64, Vec<WalEntry>)> {
    let marker_end = find_lf(bytes, 0)
        .ok_or_else(|| KvError::Recovery("WAL missing checkpoint marker".into()))?;
    let marker_line = std::str::from_utf8(&bytes[..marker_end])
        .map_err(|_| KvError::Recovery("WAL marker is not valid UTF-8".into()))?;
    let checkpoint_seq = parse_marker(marker_line)?;

    let mut entries = Vec::new();
    let mut cursor = marker_end + 1;
    while cursor < bytes.len() {
        let header_end = find_lf(bytes, cursor)
            .ok_or_else(|| KvError::Recovery("WAL record missing header terminator".into()))?;
        let header = std::str::from_utf8(&bytes[cursor..header_end])
            .map_err(|_| KvError::Recovery("WAL header is not valid UTF-8".into()))?;
        let (seq, user, key, op, length) = parse_op_header(header)?;
        cursor = header_end + 1;

        let op = match op.as_str() {
            OP_PUTS => {
                if cursor + length > bytes.len() {
                    return Err(KvError::Recovery("WAL record body truncated".into()));
                }
                let value = String::from_utf8_lossy(&bytes[cursor..cursor + length]).into_owned();
                cursor += length;
                // trailing newline after the value
                if bytes.get(cursor) == Some(&b'\n') {
                    cursor += 1;
                }
                WalOp::Put { value }
            }
            OP_DELE => WalOp::Delete,
            other => {
                return Err(KvError::Recovery(format!("unknown WAL op '{other}'")));
            }
        };

        entries.push(WalEntry { seq, user, key, op });
    }

    Ok((checkpoint_seq, entries))
}

fn find_lf(bytes: &[u8], from: usize) -> Option<usize> {
    bytes[from..].iter().position(|&b| b == b'\n').map(|p| from + p)
}

fn parse_marker(line: &str) -> Result<u64> {
    let rest = line
        .strip_prefix(MARKER_PREFIX)
        .ok_or_else(|| KvError::Recovery(format!("malformed checkpoint marker: {line}")))?;
    rest.parse()
        .map_err(|_| KvError::Recovery(format!("malformed checkpoint sequence: {rest}")))
}

fn parse_op_header(header: &str) -> Result<(u64, String, String, String, usize)> {
    let tokens: Vec<&str> = header.split(' ').collect();
    // KvStoreLogEntry Seq <n> user <u> key <k> op <op> length <L>
    if tokens.len() != 11
        || tokens[0] != "KvStoreLogEntry"
        || tokens[1] != "Seq"
        || tokens[3] != "user"
        || tokens[5] != "key"
        || tokens[7] != "op"
        || tokens[9] != "length"
    {
        return Err(KvError::Recovery(format!("malformed WAL header: {header}")));
    }

    let seq = tokens[2]
        .parse()
        .map_err(|_| KvError::Recovery(format!("malformed WAL sequence: {header}")))?;
    let length = tokens[10]
        .parse()
        .map_err(|_| KvError::Recovery(format!("malformed WAL length: {header}")))?;

    Ok((
        seq,
        tokens[4].to_string(),
        tokens[6].to_string(),
        tokens[8].to_string(),
        length,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reset_to_writes_only_marker() {
        let dir = tempdir().unwrap();
        let wal = Wal::new(dir.path().join("logging"));
        wal.reset_to(0).unwrap();
        let (seq, entries) = wal.parse().unwrap();
        assert_eq!(seq, 0);
        assert!(entries.is_empty());
    }

    #[test]
    fn append_and_parse_roundtrips() {
        let dir = tempdir().unwrap();
        let wal = Wal::new(dir.path().join("logging"));
        wal.reset_to(0).unwrap();
        wal.append_put(1, "alice", "name", "ada").unwrap();
        wal.append_delete(2, "alice", "tmp").unwrap();

        let (seq, entries) = wal.parse().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[0].op, WalOp::Put { value: "ada".into() });
        assert_eq!(entries[1].op, WalOp::Delete);
    }

    #[test]
    fn replay_is_order_preserving_for_interleaved_users() {
        let dir = tempdir().unwrap();
        let wal = Wal::new(dir.path().join("logging"));
        wal.reset_to(0).unwrap();
        wal.append_put(1, "alice", "a", "1").unwrap();
        wal.append_put(2, "bob", "b", "2").unwrap();
        wal.append_delete(3, "alice", "a").unwrap();

        let (_, entries) = wal.parse().unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn missing_marker_is_a_recovery_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logging");
        fs::write(&path, b"garbage\n").unwrap();
        let wal = Wal::new(path);
        assert!(matches!(wal.parse(), Err(KvError::Recovery(_))));
    }
}
