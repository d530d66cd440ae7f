// Length-prefixed message transport: every logical message on the wire is
// an 8-byte little-endian size followed by that many payload bytes - fixed
// width regardless of host word size (9: a portability hazard in the
// original program, which used the native `size_t`).
//
// Control tokens (`OK`, `FULL`, `SYNC`, `SYNC DONE`, `SYNC ERROR`) and file
// envelopes ride the same framing as raw bytes; commands and replies ride
// it bincode-encoded.

use crate::error::{KvError, Result};
use crate::replication::protocol::{Command, Reply};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const CONTROL_OK: &str = "OK";
pub const CONTROL_FULL: &str = "FULL";
pub const CONTROL_SYNC: &str = "SYNC";
pub const CONTROL_SYNC_DONE: &str = "SYNC DONE";
pub const CONTROL_SYNC_ERROR: &str = "SYNC ERROR";

const FILE_ENVELOPE_PREFIX: &str = "KvStoreSync Filename: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
}

impl FileKind {
    fn as_str(self) -> &'static str {
        match self {
            FileKind::File => "FILE",
            FileKind::Dir => "DIR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileEnvelope {
    pub relative_path: String,
    pub kind: FileKind,
    pub body: Vec<u8>,
}

/// Length-prefixed transport over any async byte stream.
pub struct Transport<S> {
    stream: S,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub async fn send_bytes(&mut self, payload: &[u8]) -> Result<()> {
        let len = payload.len() as u64;
        self.stream.write_all(&len.to_le_bytes()).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn recv_bytes(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 8];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u64::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(command, bincode::config::standard())
            .map_err(|e| KvError::Serialization(e.to_string()))?;
        self.send_bytes(&bytes).await
    }

    pub async fn recv_command(&mut self) -> Result<Command> {
        let bytes = self.recv_bytes().await?;
        let (command, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| KvError::Serialization(e.to_string()))?;
        Ok(command)
    }

    pub async fn send_reply(&mut self, reply: &Reply) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(reply, bincode::config::standard())
            .map_err(|e| KvError::Serialization(e.to_string()))?;
        self.send_bytes(&bytes).await
    }

    pub async fn recv_reply(&mut self) -> Result<Reply> {
        let bytes = self.recv_bytes().await?;
        let (reply, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| KvError::Serialization(e.to_string()))?;
        Ok(reply)
    }

    pub async fn send_control(&mut self, token: &str) -> Result<()> {
        self.send_bytes(token.as_bytes()).await
    }

    pub async fn recv_control(&mut self) -> Result<String> {
        let bytes = self.recv_bytes().await?;
        String::from_utf8(bytes).map_err(|e| KvError::Serialization(e.to_string()))
    }

    pub async fn send_file_envelope(&mut self, envelope: &FileEnvelope) -> Result<()> {
        let mut message = format!(
            "{FILE_ENVELOPE_PREFIX}{} Type: {} size: {}\r\n",
            envelope.relative_path,
            envelope.kind.as_str(),
            envelope.body.len()
        )
        .into_bytes();
        message.extend_from_slice(&envelope.body);
        self.send_bytes(&message).await
    }

    pub async fn recv_file_envelope(&mut self) -> Result<FileEnvelope> {
        let bytes = self.recv_bytes().await?;
        parse_file_envelope(&bytes)
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

pub fn parse_file_envelope(bytes: &[u8]) -> Result<FileEnvelope> {
    let header_end = bytes
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| KvError::Sync("file envelope missing \\r\\n separator".into()))?;
    let header = std::str::from_utf8(&bytes[..header_end])
        .map_err(|_| KvError::Sync("file envelope header is not valid UTF-8".into()))?;

    let rest = header
        .strip_prefix(FILE_ENVELOPE_PREFIX)
        .ok_or_else(|| KvError::Sync(format!("malformed file envelope header: {header}")))?;
    let (path_and_type, size_str) = rest
        .rsplit_once(" size: ")
        .ok_or_else(|| KvError::Sync(format!("malformed file envelope header: {header}")))?;
    let (relative_path, type_str) = path_and_type
        .rsplit_once(" Type: ")
        .ok_or_else(|| KvError::Sync(format!("malformed file envelope header: {header}")))?;

    let kind = match type_str {
        "FILE" => FileKind::File,
        "DIR" => FileKind::Dir,
        other => return Err(KvError::Sync(format!("unknown file envelope type: {other}"))),
    };
    let size: usize = size_str
        .parse()
        .map_err(|_| KvError::Sync(format!("malformed file envelope size: {size_str}")))?;

    let body = &bytes[header_end + 2..];
    if body.len() != size {
        return Err(KvError::Sync(format!(
            "file envelope size mismatch: header says {size}, body has {}",
            body.len()
        )));
    }

    Ok(FileEnvelope {
        relative_path: relative_path.to_string(),
        kind,
        body: body.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn control_tokens_roundtrip() {
        let (client, server) = duplex(4096);
        let mut client = Transport::new(client);
        let mut server = Transport::new(server);

        client.send_control(CONTROL_SYNC).await.unwrap();
        assert_eq!(server.recv_control().await.unwrap(), CONTROL_SYNC);
    }

    #[tokio::test]
    async fn file_envelope_roundtrips() {
        let (client, server) = duplex(8192);
        let mut client = Transport::new(client);
        let mut server = Transport::new(server);

        let envelope = FileEnvelope {
            relative_path: "alice/chunk-0".to_string(),
            kind: FileKind::File,
            body: b"hello world".to_vec(),
        };
        client.send_file_envelope(&envelope).await.unwrap();
        let received = server.recv_file_envelope().await.unwrap();
        assert_eq!(received.relative_path, "alice/chunk-0");
        assert_eq!(received.kind, FileKind::File);
        assert_eq!(received.body, b"hello world");
    }

    #[tokio::test]
    async fn command_roundtrips() {
        let (client, server) = duplex(4096);
        let mut client = Transport::new(client);
        let mut server = Transport::new(server);

        let command = Command::puts("alice", "name", "ada", 1);
        client.send_command(&command).await.unwrap();
        let received = server.recv_command().await.unwrap();
        assert_eq!(received.usr, "alice");
        assert_eq!(received.seq, 1);
    }
}
