use crate::types::{ResultCode, Term};

/// Crate-wide error type. Variants map 1:1 onto the result kinds a client or
/// caller can observe (spec §7), plus the ambient codec/IO failures that
/// spec.md leaves to collaborators but which this engine still has to
/// propagate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("this server is not the leader and cannot be forwarded (no known leader)")]
    NotLeader { known_leader: Option<crate::types::ServerId> },

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("server {0} is already a member of the cluster")]
    ServerAlreadyExists(crate::types::ServerId),

    #[error("server {0} is not a member of the cluster")]
    ServerNotFound(crate::types::ServerId),

    #[error("a configuration change is already in flight")]
    ConfigChanging,

    #[error("request cancelled: {0}")]
    Cancelled(&'static str),

    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Failed(String),

    #[error("stale term: saw {seen}, current is {current}")]
    StaleTerm { seen: Term, current: Term },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The [`ResultCode`] a client-facing API should report for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Error::NotLeader { .. } => ResultCode::NotLeader,
            Error::BadRequest(_) => ResultCode::BadRequest,
            Error::ServerAlreadyExists(_) => ResultCode::ServerAlreadyExists,
            Error::ServerNotFound(_) => ResultCode::ServerNotFound,
            Error::ConfigChanging => ResultCode::ConfigChanging,
            Error::Cancelled(_) => ResultCode::Cancelled,
            Error::Timeout => ResultCode::Timeout,
            Error::Failed(_) | Error::StaleTerm { .. } | Error::Codec(_) | Error::Io(_) => {
                ResultCode::Failed
            }
        }
    }
}
