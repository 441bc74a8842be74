//! Error taxonomy for every control operation.
//!
//! Infrastructure code (startup, config parsing, board drivers, file helpers)
//! keeps using `anyhow`; anything a caller of the controller can see is mapped
//! into [`ControlError`] so the web layer can show a kind plus a reason.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// Unknown zone or program id.
    #[error("not found: {0}")]
    NotFound(String),

    /// A program (or zone) is already committed.
    #[error("busy: {0}")]
    Busy(String),

    /// Out-of-range duration, malformed program, bad interval.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Concurrency limit on active zones.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Persisted state could not be read or written.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Overlapping program schedules.
    #[error("schedule conflict: {0}")]
    ConflictDetected(String),

    /// A relay output could not be driven.
    #[error("hardware failure: {0}")]
    Hardware(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;

impl ControlError {
    /// Stable machine-readable name, used in JSON responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Busy(_) => "busy",
            Self::InvalidInput(_) => "invalid_input",
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::StorageFailure(_) => "storage_failure",
            Self::ConflictDetected(_) => "conflict_detected",
            Self::Hardware(_) => "hardware_failure",
        }
    }

    /// Human-readable reason without the kind prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::NotFound(r)
            | Self::Busy(r)
            | Self::InvalidInput(r)
            | Self::CapacityExceeded(r)
            | Self::StorageFailure(r)
            | Self::ConflictDetected(r)
            | Self::Hardware(r) => r,
        }
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        Self::StorageFailure(format!("{err:#}"))
    }

    pub(crate) fn hardware(err: anyhow::Error) -> Self {
        Self::Hardware(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_reason_are_split() {
        let err = ControlError::Busy("program 3 is running".into());
        assert_eq!(err.kind(), "busy");
        assert_eq!(err.reason(), "program 3 is running");
        assert_eq!(err.to_string(), "busy: program 3 is running");
    }

    #[test]
    fn storage_keeps_anyhow_context_chain() {
        let inner = anyhow::anyhow!("disk full").context("write program_state.json");
        let err = ControlError::storage(inner);
        assert_eq!(err.kind(), "storage_failure");
        assert!(err.reason().contains("write program_state.json"));
        assert!(err.reason().contains("disk full"));
    }
}
