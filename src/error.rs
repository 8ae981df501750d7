//! Error types for modal decompositions.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModalError {
    /// A capability needed by the operation was never supplied.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A read happened before the state it depends on was computed or loaded.
    #[error("{0} has not been computed; call compute_decomp or set it first")]
    NotYetComputed(&'static str),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Vector handle or matrix storage failure.
    #[error("I/O failure: {0:#}")]
    Io(#[from] anyhow::Error),

    #[error("numerical failure: {0}")]
    Numerical(String),

    /// Another worker failed inside a collective and broadcast a failure token.
    #[error("collective operation aborted: {0}")]
    CollectiveAborted(String),
}

impl ModalError {
    pub fn shape(message: impl Into<String>) -> Self {
        ModalError::ShapeMismatch(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        ModalError::Configuration(message.into())
    }

    pub fn numerical(message: impl Into<String>) -> Self {
        ModalError::Numerical(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ModalError>;
