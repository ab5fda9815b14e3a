//! Error taxonomy for the inference runtime core

use axum::http::StatusCode;
use thiserror::Error;

use crate::engine::tensor::ElementType;

/// Errors raised by the resolver, runtime, preprocessor and engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("delegate library not found (tried: {})", tried.join(", "))]
    LibraryNotFound { tried: Vec<String> },

    #[error("no accelerator library available, NPU acceleration unavailable")]
    NoAccelerator,

    #[error("failed to load delegate: {0}")]
    DelegateLoad(String),

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("failed to allocate tensors: {0}")]
    Allocation(String),

    #[error("Model not loaded")]
    NotLoaded,

    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("unsupported element type: {0}")]
    UnsupportedElementType(ElementType),

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("inference failed: {0}")]
    Invoke(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status used when the error reaches the request boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Decode(_) => StatusCode::BAD_REQUEST,
            Error::NotLoaded | Error::NoAccelerator => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Build a shape mismatch from anything that debug-formats like a shape
    pub fn shape_mismatch(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        Error::ShapeMismatch {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}
