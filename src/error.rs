// Error taxonomy for the library. The binary wraps these in `anyhow`, the
// library itself returns `send2boox::Result` everywhere so callers can
// match on the failure class.

use std::fmt;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the upload-and-register flow.
#[derive(Error, Debug)]
pub enum Error {
    /// No bearer token could be resolved (neither configured nor obtained by login).
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A bootstrap or configuration response lacked an expected field.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The object store rejected a request during upload.
    #[error("transfer failed: {0}")]
    Transfer(ObjectStoreError),

    /// The freshly uploaded document did not show up in the listing diff.
    #[error("not found: {0}")]
    NotFound(String),

    /// The API or the sync gateway answered with an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The document was already given a forged revision by this process.
    #[error("document {0} was already registered")]
    AlreadyRegistered(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Convenience constructor for protocol errors.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    /// HTTP status of an object-store failure, if this is one.
    pub fn transfer_status(&self) -> Option<u16> {
        match self {
            Error::Transfer(e) => Some(e.status),
            _ => None,
        }
    }
}

/// Error reply from the object store. The store answers failures with an
/// XML document carrying a code, a message and a request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreError {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}

impl ObjectStoreError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// True for the 5xx status class.
    pub fn is_server_error(&self) -> bool {
        self.status / 100 == 5
    }
}

impl fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {} {}: {}", self.status, self.code, self.message)?;
        if let Some(id) = &self.request_id {
            write!(f, " (request id {})", id)?;
        }
        Ok(())
    }
}

impl From<ObjectStoreError> for Error {
    fn from(e: ObjectStoreError) -> Self {
        Error::Transfer(e)
    }
}
