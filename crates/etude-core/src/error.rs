use std::io;
use thiserror::Error;

/// Central error type for the Etude engine.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The shutdown signal handler could not be installed.
    #[error("Signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),
    /// Invalid construction-time configuration.
    #[error("Configuration error: {0}")]
    Config(String),
    /// The generated status line and headers did not fit the write buffer.
    #[error("Response does not fit the connection write buffer")]
    WriteBufferFull,
    /// The worker queue already holds its configured maximum.
    #[error("Worker queue is full")]
    QueueFull,
    /// No connection slot is available for a new descriptor.
    #[error("Connection table is full")]
    TableFull,
}

pub type EtudeResult<T> = Result<T, EtudeError>;
