//! Error taxonomy shared by the store, the apply pipeline and the gateway.
//!
//! Store-level errors (`KeyNotFound`, `CompareFailed`, ...) are safe to show
//! to end users. Coordinator-level errors (`NotLeader`, `ProposalLost`,
//! `Timeout`) tell the caller to retry or redirect. `Internal` means the state
//! machine may have diverged and the apply loop stops.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("value is required: {0}")]
    ValueRequired(String),

    /// Not a number, or already in the past when the request arrived.
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    #[error("compare failed on {key}: [{expected} != {actual}]")]
    CompareFailed {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// The timer that proposed this expiration no longer matches the key.
    #[error("expiration superseded: {0}")]
    ExpirationSuperseded(String),

    #[error("event index {requested} has been cleared from history (oldest retained: {oldest})")]
    HistoryCleared { requested: u64, oldest: u64 },

    #[error("not the leader; current leader: {leader:?}")]
    NotLeader { leader: Option<u64> },

    #[error("proposal lost before commit")]
    ProposalLost,

    #[error("request timed out")]
    Timeout,

    #[error("replication pipeline has shut down")]
    Shutdown,

    #[error("command codec error: {0}")]
    Codec(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors the caller may retry, possibly against another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. } | Error::ProposalLost | Error::Timeout
        )
    }

    /// Errors that must halt the apply loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }

    /// Numeric code in the etcd v1 error space.
    pub fn error_code(&self) -> u32 {
        match self {
            Error::KeyNotFound(_) | Error::ExpirationSuperseded(_) => 100,
            Error::CompareFailed { .. } => 101,
            Error::NotAFile(_) => 102,
            Error::DirectoryNotEmpty(_) => 108,
            Error::ValueRequired(_) => 200,
            Error::InvalidTtl(_) => 202,
            Error::InvalidPath(_) | Error::Codec(_) => 209,
            Error::ProposalLost | Error::Timeout | Error::Shutdown | Error::Internal(_) => 300,
            Error::NotLeader { .. } => 301,
            Error::HistoryCleared { .. } => 401,
        }
    }

    /// Short human message, without the variable part.
    pub fn message(&self) -> &'static str {
        match self {
            Error::KeyNotFound(_) => "Key Not Found",
            Error::NotAFile(_) => "Not A File",
            Error::InvalidPath(_) => "Invalid Path",
            Error::ValueRequired(_) => "Value is Required in POST form",
            Error::InvalidTtl(_) => "The given TTL is not a number or is in the past",
            Error::CompareFailed { .. } => "Test Failed",
            Error::DirectoryNotEmpty(_) => "Directory Not Empty",
            Error::ExpirationSuperseded(_) => "Expiration Superseded",
            Error::HistoryCleared { .. } => "The event in requested index is outdated and cleared",
            Error::NotLeader { .. } => "Not Leader",
            Error::ProposalLost => "Proposal Lost",
            Error::Timeout => "Request Timeout",
            Error::Shutdown => "Shutting Down",
            Error::Codec(_) => "Invalid Command",
            Error::Internal(_) => "Internal Error",
        }
    }

    /// The variable part of the error (usually the key), if any.
    pub fn cause(&self) -> Option<String> {
        match self {
            Error::KeyNotFound(key)
            | Error::NotAFile(key)
            | Error::InvalidPath(key)
            | Error::ValueRequired(key)
            | Error::InvalidTtl(key)
            | Error::DirectoryNotEmpty(key)
            | Error::ExpirationSuperseded(key)
            | Error::Codec(key)
            | Error::Internal(key) => Some(key.clone()),
            Error::CompareFailed {
                expected, actual, ..
            } => Some(format!("[{expected} != {actual}]")),
            Error::HistoryCleared { requested, oldest } => {
                Some(format!("requested {requested}, oldest {oldest}"))
            }
            Error::NotLeader { leader } => leader.map(|id| id.to_string()),
            Error::ProposalLost | Error::Timeout | Error::Shutdown => None,
        }
    }
}
