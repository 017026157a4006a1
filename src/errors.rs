use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("replay log error: {0}")]
    ReplayLog(String),
    #[error("failed to write report {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("result store error: {0}")]
    Store(#[from] StoreError),
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl HarnessError {
    /// Whether the error must abort the run rather than being logged.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HarnessError::Metrics(_))
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
