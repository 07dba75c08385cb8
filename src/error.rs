//! Custom error types for the application.
//!
//! This module defines the primary error type, `AxisError`, used across the
//! engine, the controller client and the configuration loaders. It is built
//! with `thiserror` so lower-level errors convert through `?` without ceremony.
//!
//! ## Error Hierarchy
//!
//! - **Communication**: `Timeout`, `ConnectionRefused` and `Io` cover the
//!   controller being unreachable or slow. A polling round that hits one of
//!   these marks the axis as errored.
//! - **Decode**: `Decode` and `Rejected` carry the request and raw reply so
//!   a malformed or negative answer can be diagnosed from the log alone.
//!   Decode failures are treated like communication failures by the engine.
//! - **Status**: `StatusOutOfRange` is only ever raised by the limit-status
//!   request, and the engine disables status polling for the axis instead of
//!   erroring it.
//! - **Configuration**: `Configuration`, `Config` and `Yaml` come out of the
//!   bss.config, TOML and group file loaders.
//! - **Engine**: `UnknownAxis` and `EngineStopped` are returned by the
//!   engine handle itself.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AxisError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum AxisError {
    #[error("Controller did not answer within {timeout_ms} ms ({during})")]
    Timeout { during: String, timeout_ms: u64 },

    #[error("Connection to {endpoint} refused: {reason}")]
    ConnectionRefused { endpoint: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Undecodable reply to '{request}': '{response}'")]
    Decode { request: String, response: String },

    #[error("Controller rejected '{request}': '{response}'")]
    Rejected { request: String, response: String },

    #[error("Status value out of range for '{request}': '{response}'")]
    StatusOutOfRange { request: String, response: String },

    #[error("Unknown axis '{0}'")]
    UnknownAxis(String),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Group file error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Polling engine has stopped")]
    EngineStopped,
}

/// Coarse classification used for logging and for the engine's reaction to
/// a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Controller unreachable, refused or timed out.
    CommunicationFailure,
    /// Reply received but could not be decoded, or a command was refused.
    DecodeFailure,
    /// Status request answered with something outside 0-31.
    StatusUnavailable,
    /// Invalid configuration input.
    Configuration,
    /// Engine-side misuse or shutdown.
    Engine,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::CommunicationFailure => "communication failure",
            ErrorCategory::DecodeFailure => "decode failure",
            ErrorCategory::StatusUnavailable => "status unavailable",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Engine => "engine",
        };
        f.write_str(label)
    }
}

impl AxisError {
    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AxisError::Timeout { .. } | AxisError::ConnectionRefused { .. } | AxisError::Io(_) => {
                ErrorCategory::CommunicationFailure
            }
            AxisError::Decode { .. } | AxisError::Rejected { .. } => ErrorCategory::DecodeFailure,
            AxisError::StatusOutOfRange { .. } => ErrorCategory::StatusUnavailable,
            AxisError::Configuration(_) | AxisError::Config(_) | AxisError::Yaml(_) => {
                ErrorCategory::Configuration
            }
            AxisError::UnknownAxis(_) | AxisError::EngineStopped => ErrorCategory::Engine,
        }
    }

    /// True when a polling round should put the axis into the errored set.
    ///
    /// Decode failures count: an axis whose replies cannot be understood is
    /// treated the same as one that does not answer.
    pub fn is_communication_failure(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::CommunicationFailure | ErrorCategory::DecodeFailure
        )
    }

    pub(crate) fn decode(request: impl Into<String>, response: impl Into<String>) -> Self {
        AxisError::Decode {
            request: request.into(),
            response: response.into(),
        }
    }
}

impl From<figment::Error> for AxisError {
    fn from(err: figment::Error) -> Self {
        AxisError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorises_transport_errors_as_communication() {
        let timeout = AxisError::Timeout {
            during: "read".into(),
            timeout_ms: 2000,
        };
        assert_eq!(timeout.category(), ErrorCategory::CommunicationFailure);
        assert!(timeout.is_communication_failure());

        let io: AxisError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(io.is_communication_failure());
    }

    #[test]
    fn decode_failures_error_the_axis_but_status_does_not() {
        let decode = AxisError::decode("get/bl_41in_x/query", "garbage");
        assert_eq!(decode.category(), ErrorCategory::DecodeFailure);
        assert!(decode.is_communication_failure());

        let status = AxisError::StatusOutOfRange {
            request: "get/bl_41in_x/status".into(),
            response: "get/bl_41in_x/status/64".into(),
        };
        assert_eq!(status.category(), ErrorCategory::StatusUnavailable);
        assert!(!status.is_communication_failure());
    }

    #[test]
    fn display_includes_request_and_reply() {
        let err = AxisError::Rejected {
            request: "put/bl_41in_x/stop".into(),
            response: "put/bl_41in_x/stop/1".into(),
        };
        let text = err.to_string();
        assert!(text.contains("put/bl_41in_x/stop"));
        assert!(text.contains("/1"));
        assert_eq!(ErrorCategory::DecodeFailure.to_string(), "decode failure");
    }
}
