// src/error.rs
use std::io;

/// Central error type for the nocturne server core.
#[derive(Debug)]
pub enum NocturneError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// The listen address or port could not be resolved.
    AddrResolution(String),
    /// `start` was called on a server that is already running.
    AlreadyRunning,
}

impl std::fmt::Display for NocturneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NocturneError::Io(e) => write!(f, "I/O error: {}", e),
            NocturneError::AddrResolution(msg) => write!(f, "Address resolution failed: {}", msg),
            NocturneError::AlreadyRunning => write!(f, "Server is already running"),
        }
    }
}

impl std::error::Error for NocturneError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NocturneError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NocturneError {
    fn from(e: io::Error) -> Self {
        NocturneError::Io(e)
    }
}

pub type NocturneResult<T> = Result<T, NocturneError>;
