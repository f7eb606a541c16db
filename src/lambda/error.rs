//! Error types for the Lambda Cloud client.

use thiserror::Error;

use crate::config::ConfigError;
use crate::provider::ProviderError;

/// Errors raised by the Lambda Cloud client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LambdaError {
    /// Raised when the client configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a launch request is missing a required field.
    #[error("invalid launch request: {0}")]
    Validation(String),
    /// Raised when no HTTP response was obtained (DNS, TLS, connection).
    #[error("transport error: {message}")]
    Transport {
        /// Message reported by the HTTP client.
        message: String,
    },
    /// Raised when the provider answers with a non-2xx status.
    #[error("provider returned HTTP {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },
    /// Raised when a 2xx response body does not match the expected shape.
    #[error("failed to decode provider response: {message}")]
    Decode {
        /// Message reported by the JSON decoder.
        message: String,
    },
    /// Raised when a launch succeeds but names no instance.
    #[error("launch accepted but no instance id was returned")]
    EmptyLaunch,
}

impl LambdaError {
    /// Returns `true` for an `Api` error with status 404.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}

impl From<ConfigError> for LambdaError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<ProviderError> for LambdaError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::Validation(field) => Self::Validation(field),
        }
    }
}

impl From<reqwest::Error> for LambdaError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}
