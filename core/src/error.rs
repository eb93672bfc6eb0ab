//! Error handling.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type CoreResult<T> = Result<T, CoreError>;

/// An error from the core primitives (hashing, chunking, the encryption envelope).
#[derive(Debug, Display)]
pub enum CoreError {
    /// Hashing error: {0}
    HashError(super::hash::Error),

    /// Encryption error: {0}
    CryptoError(super::crypto::Error),

    /// I/O error: {error}.
    IoError { error: io::Error },
}

impl CoreError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HashError(_) => "HashError",
            Self::CryptoError(_) => "CryptoError",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for CoreError {}

impl From<io::Error> for CoreError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}

impl From<super::hash::Error> for CoreError {
    fn from(error: super::hash::Error) -> Self {
        Self::HashError(error)
    }
}

impl From<super::crypto::Error> for CoreError {
    fn from(error: super::crypto::Error) -> Self {
        Self::CryptoError(error)
    }
}
