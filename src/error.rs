use crate::state::VideoState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReforgeError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Binary not found on PATH: {0}")]
    BinaryNotFound(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Failed to parse {context}: {message}")]
    Parse { context: String, message: String },

    #[error("Illegal state transition: {from} -> {to}")]
    InvalidTransition { from: VideoState, to: VideoState },

    #[error("Video not found: {0}")]
    VideoNotFound(i64),

    #[error("Process timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, ReforgeError>;
