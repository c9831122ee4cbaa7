use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Exception {
    /// Transient failure (timeouts, throttling, connectivity). Safe to retry.
    #[error("Retryable failure: {0}")]
    Retryable(String),

    #[error("Non-retryable failure: {0}")]
    NonRetryable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Local lease bookkeeping no longer matches what the caller claims to hold.
    #[error("RemoteLocker state is corrupted. lockId: {lock_id}, ownerId: {owner_id}, {details}")]
    CorruptedState {
        lock_id: String,
        owner_id: String,
        details: String,
    },

    #[error("RemoteLocker is already disposed")]
    Disposed,

    #[error("Codec failure: {0}")]
    Codec(String),
}

impl Exception {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Exception::Retryable(_))
    }
}

impl From<serde_json::Error> for Exception {
    fn from(err: serde_json::Error) -> Self {
        Exception::Codec(err.to_string())
    }
}

pub type LockResult<T> = Result<T, Exception>;
