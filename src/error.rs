//! Error type shared by every engine subsystem.
//!
//! Out-of-bounds pixel access is deliberately *not* an error: reads return
//! transparent black and writes are dropped, so brush loops never branch on
//! a `Result` per pixel.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed color string or script line.
    #[error("Format error: {0}")]
    Format(String),

    /// The requested operation is not legal in the current state
    /// (undo at the start of history, commit without a take, ...).
    /// Nothing was changed.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Invalid project file: {0}")]
    InvalidProject(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl EngineError {
    pub fn format(msg: impl Into<String>) -> Self {
        EngineError::Format(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidOperation(msg.into())
    }

    /// True for errors the interactive caller can simply report and move on from.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::Format(_) | EngineError::InvalidOperation(_))
    }
}

impl From<Box<bincode::ErrorKind>> for EngineError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        EngineError::Serialize(e.to_string())
    }
}
