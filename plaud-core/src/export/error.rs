use thiserror::Error;

pub type ExportResult<T> = Result<T, ExportError>;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("no recordings found, check that the recordings page is open")]
    NoRecordings,
    #[error("stale recording handle, the list was refreshed since discovery")]
    StaleItem,
    #[error("export run canceled")]
    Canceled,
    #[error("an export run is already active")]
    AlreadyRunning,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<tokio::task::JoinError> for ExportError {
    fn from(err: tokio::task::JoinError) -> Self {
        ExportError::Unexpected(err.to_string())
    }
}
