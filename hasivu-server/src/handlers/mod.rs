pub mod circuit_breakers;
pub mod health;
pub mod integrations;
pub mod monitoring;
pub mod pipelines;
pub mod queues;

use std::str::FromStr;

use crate::infra::errors::AppError;

/// Parses a path segment, answering 400 when it is malformed.
pub(crate) fn parse_path<T>(raw: &str, what: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|err| AppError::bad_request(format!("invalid {what} '{raw}': {err}")))
}
