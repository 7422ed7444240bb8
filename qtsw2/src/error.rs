use crate::{config::ConfigError, journal::JournalError};
use qtsw2_data::error::DataError;
use qtsw2_execution::error::ExecutionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("journal: {0}")]
    Journal(#[from] JournalError),

    #[error("market data: {0}")]
    Data(#[from] DataError),

    #[error("execution: {0}")]
    Execution(#[from] ExecutionError),

    #[error("broker event channel closed")]
    BrokerRxDropped,

    #[error("JoinError: {0}")]
    JoinError(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::JoinError(format!("{value:?}"))
    }
}
