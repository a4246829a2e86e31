//! Errors returned by twin operations.
//!
//! Every variant is a local, recoverable condition. None of them poisons the
//! device entry that produced it.

use crate::mdl::{PropertyKey, ValueError};

pub type TwinResult<T> = Result<T, TwinError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TwinError {
    /// Model, device or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Device model already registered: {0}")]
    DuplicateModel(String),

    #[error("Device already exists: {0}")]
    DuplicateDevice(String),

    /// Two access configuration entries for the same member
    #[error("Duplicate access config for {service}/{member}")]
    DuplicateAccessConfig { service: String, member: String },

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unknown member {member} in service {service}")]
    UnknownMember { service: String, member: String },

    #[error("Unknown property: {0}")]
    UnknownProperty(PropertyKey),

    #[error("Property is read-only: {0}")]
    NotWritable(PropertyKey),

    #[error("Type mismatch for {key}: expected {expected}, found {found}")]
    TypeMismatch {
        key: PropertyKey,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Value out of range for {key}: {source}")]
    OutOfRange { key: PropertyKey, source: ValueError },

    /// Malformed value without an accompanying error message
    #[error("Invalid report for {0}: malformed value without error message")]
    InvalidReport(PropertyKey),

    #[error("Stale write to {key}: stored timestamp {stored}, incoming {incoming}")]
    StaleWrite {
        key: PropertyKey,
        stored: i64,
        incoming: i64,
    },

    /// The device was bound against a model registration that has since been replaced
    #[error("Stale binding for device {device_id}: model {model} was replaced, re-bind required")]
    StaleBinding { device_id: String, model: String },

    #[error("Device model {model} is in use by {devices} device(s)")]
    InUse { model: String, devices: usize },

    #[error("Invalid device model: {0}")]
    InvalidModel(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl TwinError {
    /// Attach a property key to a value check failure.
    ///
    /// `Missing` maps to `InvalidReport`: a null value is never well formed.
    pub fn from_value(key: PropertyKey, err: ValueError) -> Self {
        match err {
            ValueError::TypeMismatch { expected, found } => TwinError::TypeMismatch {
                key,
                expected,
                found,
            },
            ValueError::OutOfRange { .. } => TwinError::OutOfRange { key, source: err },
            ValueError::Missing => TwinError::InvalidReport(key),
        }
    }

    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::DuplicateModel(_) => "duplicate_model",
            Self::DuplicateDevice(_) => "duplicate_device",
            Self::DuplicateAccessConfig { .. } => "duplicate_access_config",
            Self::UnknownService(_) => "unknown_service",
            Self::UnknownMember { .. } => "unknown_member",
            Self::UnknownProperty(_) => "unknown_property",
            Self::NotWritable(_) => "not_writable",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::OutOfRange { .. } => "out_of_range",
            Self::InvalidReport(_) => "invalid_report",
            Self::StaleWrite { .. } => "stale_write",
            Self::StaleBinding { .. } => "stale_binding",
            Self::InUse { .. } => "in_use",
            Self::InvalidModel(_) => "invalid_model",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<TwinError> for edgetwin_core::Error {
    fn from(e: TwinError) -> Self {
        use edgetwin_core::Error;
        match e {
            TwinError::NotFound(s) => Error::NotFound(s),
            TwinError::Storage(s) => Error::Storage(s),
            TwinError::DuplicateModel(_)
            | TwinError::DuplicateDevice(_)
            | TwinError::DuplicateAccessConfig { .. }
            | TwinError::StaleWrite { .. }
            | TwinError::StaleBinding { .. }
            | TwinError::InUse { .. } => Error::Conflict(e.to_string()),
            other => Error::Validation(other.to_string()),
        }
    }
}
