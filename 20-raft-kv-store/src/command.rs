use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Mutations that flow through the Raft replicated log.
///
/// Expirations are absolute timestamps fixed when the command is built, so
/// replaying the log never consults a clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Set {
        key: String,
        value: String,
        expiration: Option<DateTime<Utc>>,
    },
    Delete {
        key: String,
        recursive: bool,
    },
    CompareAndSwap {
        key: String,
        value: String,
        prev_value: String,
        expiration: Option<DateTime<Utc>>,
    },
    /// Proposed by the leader's expiration scheduler, never by clients.
    Expire {
        key: String,
        expiration: DateTime<Utc>,
    },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. }
            | Command::Delete { key, .. }
            | Command::CompareAndSwap { key, .. }
            | Command::Expire { key, .. } => key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|err| Error::Codec(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|err| Error::Codec(err.to_string()))
    }
}
