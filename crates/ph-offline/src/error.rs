use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum OfflineError {
    #[error("local store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("local store write failed: {0}")]
    WriteError(String),

    #[error("remote rejected request: {0}")]
    RemoteRejected(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("invalid pending record: {0}")]
    InvalidRecord(String),
}

impl From<reqwest::Error> for OfflineError {
    fn from(err: reqwest::Error) -> Self {
        OfflineError::TransportFailure(err.to_string())
    }
}
