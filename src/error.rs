// Crate-wide error type for the key-value engine.
//
// Every variant corresponds to one of the stable wire status codes in
// `status_code()`, which the network layer uses to report failures back to
// clients without leaking internal detail.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("user not found: {user}")]
    UserNotFound { user: String },

    #[error("key not found: {key} (user {user})")]
    KeyNotFound { user: String, key: String },

    #[error("value mismatch on CPut for key {key} (user {user})")]
    ValueMismatch { user: String, key: String },

    #[error("sequence mismatch: expected {expected}, got {got}")]
    Sequence { expected: u64, got: u64 },

    #[error("log write error: {0}")]
    LogWrite(String),

    #[error("recovery error: {0}")]
    Recovery(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("invalid user name: {0}")]
    InvalidUser(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl KvError {
    /// The stable wire status code for this error, per the protocol's
    /// external interface. `0` is reserved for success and is never
    /// returned by this method.
    pub fn status_code(&self) -> i32 {
        match self {
            KvError::Transport(_) => -1,
            KvError::UserNotFound { .. } => -2,
            KvError::KeyNotFound { .. } => -3,
            KvError::ValueMismatch { .. } => -4,
            KvError::Sequence { .. } => -5,
            KvError::LogWrite(_) => -6,
            KvError::Recovery(_) => -7,
            KvError::Sync(_) => -8,
            KvError::InvalidUser(_) => -2,
            KvError::InvalidKey(_) => -3,
            KvError::Serialization(_) => -1,
        }
    }
}

pub type Result<T> = std::result::Result<T, KvError>;
