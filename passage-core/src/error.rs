//! Error types for the relay engine.
//!
//! Categorized errors with an optional underlying cause. Per-connection I/O
//! failures are not represented here: they terminate the owning task by
//! closing its streams rather than crossing task boundaries as values.

use std::fmt;

/// Error categories for the relay engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Configuration errors, fatal at startup.
    Config,
    /// Control-channel wire protocol errors.
    Protocol,
    /// Carrier or upstream transport errors.
    Transport,
    /// Mux session errors.
    Mux,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Mux => write!(f, "mux"),
        }
    }
}

/// A relay error with category and optional cause.
#[derive(Debug)]
pub struct RelayError {
    /// The error category.
    pub kind: ErrorKind,
    /// A human-readable message.
    pub message: String,
    /// The underlying cause, if any.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl RelayError {
    /// Create a new relay error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause.
    pub fn with_source<E: std::error::Error + Send + Sync + 'static>(mut self, source: E) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// Create a mux session error.
    pub fn mux(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Mux, message)
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::transport(e.to_string()).with_source(e)
    }
}

/// Result type using RelayError.
pub type RelayResult<T> = Result<T, RelayError>;
