// Wire command/reply records exchanged between clients and engines, and
// between primaries and secondaries for live forwarding. Strings for the
// verb keep the wire format legible and stable across versions, mirroring
// the original program's protobuf-style record.

use serde::{Deserialize, Serialize};

pub const VERB_PUTS: &str = "PUTS";
pub const VERB_GETS: &str = "GETS";
pub const VERB_CPUT: &str = "CPUT";
pub const VERB_DELE: &str = "DELE";
pub const VERB_ALL: &str = "ALL";
pub const VERB_CKPT: &str = "CKPT";
pub const VERB_SYNC: &str = "SYNC";
pub const VERB_CLUSTER: &str = "CLUSTER";
pub const VERB_KILL: &str = "KILL";
pub const VERB_RESTART: &str = "RESTART";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub com: String,
    pub usr: String,
    pub key: String,
    pub value1: String,
    pub value2: String,
    pub addrs: Vec<String>,
    pub seq: u64,
}

impl Command {
    pub fn puts(usr: &str, key: &str, value: &str, seq: u64) -> Self {
        Self {
            com: VERB_PUTS.to_string(),
            usr: usr.to_string(),
            key: key.to_string(),
            value1: value.to_string(),
            seq,
            ..Default::default()
        }
    }

    pub fn cput(usr: &str, key: &str, expected: &str, new: &str, seq: u64) -> Self {
        Self {
            com: VERB_CPUT.to_string(),
            usr: usr.to_string(),
            key: key.to_string(),
            value1: expected.to_string(),
            value2: new.to_string(),
            seq,
            ..Default::default()
        }
    }

    pub fn dele(usr: &str, key: &str, seq: u64) -> Self {
        Self {
            com: VERB_DELE.to_string(),
            usr: usr.to_string(),
            key: key.to_string(),
            seq,
            ..Default::default()
        }
    }

    pub fn gets(usr: &str, key: &str) -> Self {
        Self {
            com: VERB_GETS.to_string(),
            usr: usr.to_string(),
            key: key.to_string(),
            ..Default::default()
        }
    }

    pub fn get_all(usr: &str) -> Self {
        Self {
            com: VERB_ALL.to_string(),
            usr: usr.to_string(),
            ..Default::default()
        }
    }

    pub fn checkpoint() -> Self {
        Self {
            com: VERB_CKPT.to_string(),
            ..Default::default()
        }
    }

    pub fn cluster(addrs: Vec<String>) -> Self {
        Self {
            com: VERB_CLUSTER.to_string(),
            addrs,
            ..Default::default()
        }
    }

    pub fn kill() -> Self {
        Self {
            com: VERB_KILL.to_string(),
            ..Default::default()
        }
    }

    pub fn restart() -> Self {
        Self {
            com: VERB_RESTART.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reply {
    pub status: i32,
    pub value: String,
    pub key_values: Vec<(String, String)>,
}

impl Reply {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn ok_with_value(value: String) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    pub fn ok_with_pairs(key_values: Vec<(String, String)>) -> Self {
        Self {
            key_values,
            ..Default::default()
        }
    }

    pub fn error(status: i32) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}
