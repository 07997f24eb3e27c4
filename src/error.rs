//! Error types for image stack operations.

use thiserror::Error;

use crate::config::ConfigError;

/// Boxed error returned by user functions run inside the parallel engine.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while building, slicing or transforming an image stack.
#[derive(Debug, Error)]
pub enum StackError {
    /// Data or selector shape does not match the destination.
    #[error("shape error: {message}")]
    Shape { message: String },

    /// Element type or value range violates the float-in-[0, 1] contract.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    /// A selector did not resolve to the expected number of entries.
    #[error("lookup error: {message}")]
    Lookup { message: String },

    /// Conflicting or malformed options.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A task running on the worker pool failed.
    #[error("worker task for {selector} failed: {source}")]
    Worker {
        selector: String,
        #[source]
        source: TaskError,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StackError {
    pub fn shape(message: impl Into<String>) -> Self {
        StackError::Shape {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        StackError::InvalidData {
            message: message.into(),
        }
    }

    pub fn lookup(message: impl Into<String>) -> Self {
        StackError::Lookup {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        StackError::Config {
            message: message.into(),
        }
    }

    pub fn worker(selector: impl Into<String>, source: TaskError) -> Self {
        StackError::Worker {
            selector: selector.into(),
            source,
        }
    }
}

impl From<ConfigError> for StackError {
    fn from(value: ConfigError) -> Self {
        StackError::config(value.to_string())
    }
}

pub type StackResult<T> = Result<T, StackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_error_keeps_source() {
        let source: TaskError = "kernel diverged".into();
        let err = StackError::worker("{r: 0, c: 1}", source);
        let text = err.to_string();
        assert!(text.contains("{r: 0, c: 1}"));
        assert!(text.contains("kernel diverged"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn config_error_converts() {
        let err: StackError = ConfigError::Parse("bad".into()).into();
        assert!(matches!(err, StackError::Config { .. }));
    }
}
