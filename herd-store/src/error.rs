use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Returns a stable error code for this error variant.
    /// These codes are stable and can be used by clients for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Error::Corruption(_) => "CORRUPTION",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
        }
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// Transient errors like IO errors are retryable, while logical errors
    /// like InvalidArgument or Corruption are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) => true,

            Error::StorageUnavailable(_) => false,
            Error::Corruption(_) => false,
            Error::NotFound(_) => false,
            Error::InvalidArgument(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
