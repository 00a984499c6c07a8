use thiserror::Error;

use crate::dtype::DType;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unsupported dtype {dtype} for backend {backend}")]
    UnsupportedDtype { backend: String, dtype: DType },

    #[error("Shape mismatch: {message}")]
    ShapeMismatch { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Kernel initialization error: {message}")]
    KernelInit { message: String },

    #[error("Config parse error: {source}")]
    Config {
        #[from]
        source: serde_json::Error,
    },

    #[error("Config file error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl DispatchError {
    pub(crate) fn shape(message: impl Into<String>) -> Self {
        DispatchError::ShapeMismatch {
            message: message.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        DispatchError::InvalidInput {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
