use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum DataError {
    #[error("bar provider: {0}")]
    Provider(String),

    #[error("csv source {path}: {detail}")]
    Csv { path: String, detail: String },
}

impl From<std::io::Error> for DataError {
    fn from(value: std::io::Error) -> Self {
        Self::Provider(value.to_string())
    }
}
