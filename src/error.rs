//! Error types for declarative drivers.
//!
//! `DaqError` is the single error type produced by the framework, from class
//! construction down to the backend round-trip.
//!
//! ## Error Hierarchy
//!
//! - **Configuration errors** (`Configuration`, `DuplicateModification`,
//!   `MissingAnchor`, `InvalidSpecifier`, `SignatureMismatch`,
//!   `ConflictingValidators`, `MissingChannelListing`, `UnknownMember`,
//!   `MissingVersion`, `Config`): mistakes in a driver definition. They are
//!   raised while a class is being built and are never caught by the framework.
//! - **Access errors** (`AccessDenied`, `Disabled`, `NotReadable`, `NotSettable`,
//!   `UnknownSetting`): the member exists but cannot be used right now.
//! - **Validation errors** (`InvalidArguments`, `InvalidValue`, `OutOfLimits`, `CheckFailed`,
//!   `Conversion`, `Unit`): raised in `pre_set`/`pre_call`, before any I/O.
//! - **Communication errors** (`Communication`, `Instrument`): reported by the
//!   backend. Kinds listed by `Backend::retries_exceptions` are retried.
//! - **Instrument-reported failure** (`OperationFailed`): the check following a
//!   set reported an error.
//! - **`FailedCall`**: any failure inside an action call, wrapped with the
//!   action name and its arguments.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the framework error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Classification of communication failures, used to decide what is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommErrorKind {
    /// The instrument did not answer in time.
    Timeout,
    /// Generic transport failure.
    Io,
    /// The session handle is no longer valid (connection dropped).
    InvalidSession,
    /// Anything else reported by the transport.
    Other,
}

impl fmt::Display for CommErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommErrorKind::Timeout => "timeout",
            CommErrorKind::Io => "io",
            CommErrorKind::InvalidSession => "invalid session",
            CommErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Errors raised while defining or using drivers.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration load error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Modification id '{id}' is already used in {stage}")]
    DuplicateModification { stage: String, id: String },

    #[error("No fragment named '{anchor}' in {stage}")]
    MissingAnchor { stage: String, anchor: String },

    #[error("Invalid customization specifier: {0}")]
    InvalidSpecifier(String),

    #[error("Function for {stage} has the wrong signature: expected {expected}")]
    SignatureMismatch { stage: String, expected: String },

    #[error("Parameter '{param}' of {action} declares both values and limits")]
    ConflictingValidators { action: String, param: String },

    #[error("Channel '{0}' does not specify how to list available channels")]
    MissingChannelListing(String),

    #[error("{owner} has no member named '{name}'")]
    UnknownMember { owner: String, name: String },

    #[error("Driver class {0} does not declare a version")]
    MissingVersion(String),

    #[error("Access to {name} denied: {reason}")]
    AccessDenied { name: String, reason: String },

    #[error("{name} is disabled on {owner}")]
    Disabled { name: String, owner: String },

    #[error("Feature {0} is not readable")]
    NotReadable(String),

    #[error("Feature {0} is not settable")]
    NotSettable(String),

    #[error("{name} has no setting '{key}'")]
    UnknownSetting { name: String, key: String },

    #[error("Invalid arguments for {action}: {detail}")]
    InvalidArguments { action: String, detail: String },

    #[error("Invalid value for {name}: {value} is not one of {allowed}")]
    InvalidValue {
        name: String,
        value: String,
        allowed: String,
    },

    #[error("{0}")]
    OutOfLimits(String),

    #[error("Check failed: {assertion} ({namespace})")]
    CheckFailed { assertion: String, namespace: String },

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Unit error: {0}")]
    Unit(String),

    #[error("Communication error ({kind}): {message}")]
    Communication { kind: CommErrorKind, message: String },

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Setting {feature} to {value} failed: {detail}")]
    OperationFailed {
        feature: String,
        value: String,
        detail: String,
    },

    #[error("Calling {action} with {args} failed: {source}")]
    FailedCall {
        action: String,
        args: String,
        #[source]
        source: Box<DaqError>,
    },
}

impl DaqError {
    /// Shorthand for a communication error of the given kind.
    pub fn comm(kind: CommErrorKind, message: impl Into<String>) -> Self {
        DaqError::Communication {
            kind,
            message: message.into(),
        }
    }

    /// Returns `true` for errors describing a broken driver definition.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DaqError::Config(_)
                | DaqError::Configuration(_)
                | DaqError::DuplicateModification { .. }
                | DaqError::MissingAnchor { .. }
                | DaqError::InvalidSpecifier(_)
                | DaqError::SignatureMismatch { .. }
                | DaqError::ConflictingValidators { .. }
                | DaqError::MissingChannelListing(_)
                | DaqError::UnknownMember { .. }
                | DaqError::MissingVersion(_)
        )
    }

    /// Kind of communication failure, if this is one.
    pub fn comm_kind(&self) -> Option<CommErrorKind> {
        match self {
            DaqError::Communication { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Innermost error, unwrapping `FailedCall` layers.
    pub fn root_cause(&self) -> &DaqError {
        match self {
            DaqError::FailedCall { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::MissingAnchor {
            stage: "pre_get".to_string(),
            anchor: "checks".to_string(),
        };
        assert_eq!(err.to_string(), "No fragment named 'checks' in pre_get");

        let err = DaqError::comm(CommErrorKind::Timeout, "no answer");
        assert_eq!(err.to_string(), "Communication error (timeout): no answer");
    }

    #[test]
    fn test_failed_call_root_cause() {
        let inner = DaqError::InvalidValue {
            name: "a".to_string(),
            value: "5".to_string(),
            allowed: "[1, 2, 3]".to_string(),
        };
        let err = DaqError::FailedCall {
            action: "compute".to_string(),
            args: "a=5".to_string(),
            source: Box::new(inner),
        };
        assert!(matches!(err.root_cause(), DaqError::InvalidValue { .. }));
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_configuration_classification() {
        assert!(DaqError::InvalidSpecifier("bogus".into()).is_configuration());
        assert!(DaqError::MissingChannelListing("ch".into()).is_configuration());
        assert!(!DaqError::NotReadable("x".into()).is_configuration());
        assert_eq!(
            DaqError::comm(CommErrorKind::Io, "x").comm_kind(),
            Some(CommErrorKind::Io)
        );
    }
}
