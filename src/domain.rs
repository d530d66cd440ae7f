// Strongly-typed identifiers for the entities the engine partitions state
// by, following the newtype-with-validation pattern used throughout the
// replication layer.

use crate::error::KvError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters that may never appear in a user name, per the wire grammar.
const RESERVED_USER_CHARS: &[char] = &['@', '\\', '/', '$', '%', '&', '='];

/// A namespace identifier: printable, non-empty, ASCII 0x21-0x7E, and free
/// of the characters the frontend and wire protocol reserve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(name: impl Into<String>) -> Result<Self, KvError> {
        let name = name.into();
        if name.is_empty() {
            return Err(KvError::InvalidUser("user name must not be empty".into()));
        }
        if !name
            .bytes()
            .all(|b| (0x21..=0x7E).contains(&b))
        {
            return Err(KvError::InvalidUser(format!(
                "user name '{name}' contains non-printable characters"
            )));
        }
        if name.chars().any(|c| RESERVED_USER_CHARS.contains(&c)) {
            return Err(KvError::InvalidUser(format!(
                "user name '{name}' contains a reserved character"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A key in the WAL/chunk alphabet: `[A-Za-z0-9.\-+_=]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        if key.is_empty() {
            return Err(KvError::InvalidKey("key must not be empty".into()));
        }
        let valid = key.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'+' | b'_' | b'=')
        });
        if !valid {
            return Err(KvError::InvalidKey(format!(
                "key '{key}' contains characters outside the logged-key alphabet"
            )));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_rejects_reserved_chars() {
        assert!(UserId::new("alice").is_ok());
        assert!(UserId::new("ali/ce").is_err());
        assert!(UserId::new("ali@ce").is_err());
        assert!(UserId::new("").is_err());
    }

    #[test]
    fn record_key_rejects_non_alphabet_bytes() {
        assert!(RecordKey::new("chunk.metadata-1").is_ok());
        assert!(RecordKey::new("bad key").is_err());
        assert!(RecordKey::new("bad/key").is_err());
    }
}
