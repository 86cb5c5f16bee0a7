use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CoreError;

use super::model::Phase;

/// Failure category of a pipeline phase; drives the retry decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimited,
    Timeout,
    Connection,
    InvalidData,
    Config,
    Cancelled,
    Fatal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::Timeout | ErrorKind::Connection
        )
    }
}

/// Message fragments (lowercase) that mark an untyped error as transient.
const RETRYABLE_MARKERS: &[(&str, ErrorKind)] = &[
    ("etimedout", ErrorKind::Timeout),
    ("timed out", ErrorKind::Timeout),
    ("timeout", ErrorKind::Timeout),
    ("econnreset", ErrorKind::Connection),
    ("econnrefused", ErrorKind::Connection),
    ("enotfound", ErrorKind::Connection),
    ("eai_again", ErrorKind::Connection),
    ("connection reset", ErrorKind::Connection),
    ("connection refused", ErrorKind::Connection),
    ("broken pipe", ErrorKind::Connection),
    ("rate limit", ErrorKind::RateLimited),
    ("too many requests", ErrorKind::RateLimited),
    ("429", ErrorKind::RateLimited),
    ("502", ErrorKind::Transient),
    ("503", ErrorKind::Transient),
    ("504", ErrorKind::Transient),
    ("service unavailable", ErrorKind::Transient),
    ("temporarily unavailable", ErrorKind::Transient),
];

/// Classifies a free-form error message. Anything unrecognised is fatal.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    RETRYABLE_MARKERS
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Fatal)
}

pub fn is_retryable_message(message: &str) -> bool {
    classify_message(message).is_retryable()
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{phase} phase failed ({kind:?}): {message}")]
pub struct PipelineError {
    pub phase: Phase,
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn new(phase: Phase, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            phase,
            kind,
            message: message.into(),
        }
    }

    /// Builds an error whose kind is inferred from the message text.
    pub fn classify(phase: Phase, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = classify_message(&message);
        Self::new(phase, kind, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Maps a connector error onto a phase failure.
    pub fn from_core(phase: Phase, err: CoreError) -> Self {
        let kind = match &err {
            CoreError::Pipeline(inner) => return inner.clone(),
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::Unavailable(_) | CoreError::CircuitOpen(_) => ErrorKind::Transient,
            CoreError::Io(io) => match io.kind() {
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::Interrupted => ErrorKind::Connection,
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    ErrorKind::Config
                }
                _ => classify_message(&io.to_string()),
            },
            CoreError::InvalidInput(_) | CoreError::Serialization(_) => ErrorKind::InvalidData,
            CoreError::NotFound(_) => ErrorKind::Config,
            CoreError::Cancelled(_) => ErrorKind::Cancelled,
            other => classify_message(&other.to_string()),
        };
        Self::new(phase, kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_transient_messages_are_retryable() {
        for message in [
            "connect ETIMEDOUT 10.0.0.4:5432",
            "read ECONNRESET",
            "upstream returned 503",
            "Rate limit exceeded for vendor API",
            "Too Many Requests",
        ] {
            assert!(is_retryable_message(message), "{message}");
        }
    }

    #[test]
    fn unknown_messages_are_fatal() {
        assert_eq!(classify_message("column \"price\" is not numeric"), ErrorKind::Fatal);
        assert!(!is_retryable_message("schema mismatch"));
    }

    #[test]
    fn io_errors_map_by_kind() {
        let err = CoreError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        let mapped = PipelineError::from_core(Phase::Load, err);
        assert_eq!(mapped.kind, ErrorKind::Connection);
        assert_eq!(mapped.phase, Phase::Load);

        let missing = PipelineError::from_core(
            Phase::Extract,
            CoreError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no file")),
        );
        assert!(!missing.is_retryable());
    }
}
