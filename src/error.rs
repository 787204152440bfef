//! Failover error taxonomy.
//!
//! Errors raised before the tower transfer are recoverable by abort: the
//! server surfaces them to the peer via the message's `error_message` field
//! and both sides exit cleanly. `Transfer` and `Switchover` are catastrophic
//! once the switchover has begun; callers emit manual recovery instructions
//! and never attempt compensating actions.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("admission check failed: {0}")]
    Admission(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tower transfer failed: {0}")]
    Transfer(String),

    #[error("switchover failed: {0}")]
    Switchover(String),

    #[error("hook {0} failed: {1}")]
    Hook(String, String),

    #[error("rpc request failed: {0}")]
    Rpc(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures that occur after the switchover is underway, where
    /// the only remedy is operator intervention.
    pub fn is_catastrophic(&self) -> bool {
        matches!(self, Error::Transfer(_) | Error::Switchover(_))
    }
}
