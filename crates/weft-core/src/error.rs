//! Error types shared across the workspace foundations.

/// The result type used throughout weft-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the shared foundations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier failed to parse.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// What was being parsed and why it failed.
        message: String,
    },

    /// Configuration could not be loaded or a value was out of range.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new configuration error with a source.
    #[must_use]
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn config_error_display() {
        let err = Error::config("unknown backend 'redis'");
        assert!(err.to_string().contains("unknown backend"));
    }

    #[test]
    fn config_error_carries_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "weft.toml");
        let err = Error::config_with_source("failed to read config file", io);
        assert!(StdError::source(&err).is_some());
    }
}
