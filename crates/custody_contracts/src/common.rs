#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wall-clock instant in milliseconds since the Unix epoch (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        let ms = Utc::now().timestamp_millis();
        Self(u64::try_from(ms).unwrap_or(1).max(1))
    }

    /// RFC 3339 UTC rendering with millisecond precision, e.g. `2024-03-01T10:00:00.000Z`.
    pub fn to_rfc3339_utc(self) -> String {
        let ms = i64::try_from(self.0).unwrap_or(i64::MAX);
        match DateTime::<Utc>::from_timestamp_millis(ms) {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => format!("{}ms", self.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContractViolation {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field} out of range [{min}, {max}]: got {got}")]
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
        got: f64,
    },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

pub(crate) fn validate_text(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    Ok(())
}
