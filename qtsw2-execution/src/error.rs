use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum ExecutionError {
    /// Transient transport fault (timeout, dropped connection). Retryable.
    #[error("transport: {0}")]
    Transport(String),

    /// Broker refused the request (insufficient margin, bad params). Fatal for the
    /// intent; never retried.
    #[error("protocol rejection: {0}")]
    Protocol(String),

    #[error("account snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
}
