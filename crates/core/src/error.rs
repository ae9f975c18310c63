//! Core error types.

use thiserror::Error;

/// Errors produced by core domain operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;
