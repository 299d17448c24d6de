//! Error types for validating incoming telemetry records.

use thiserror::Error;

/// Reasons an incoming device record cannot be ingested.
///
/// A malformed record is skipped on its own; it never aborts the rest of
/// the snapshot it arrived in.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecordError {
    /// The record is not a JSON object.
    #[error("device record is not a JSON object")]
    NotAnObject,

    /// `device_id` is absent or not a string.
    #[error("device_id is missing or not a string")]
    MissingDeviceId,

    /// `updated_at` is absent or not a string.
    #[error("updated_at is missing or not a string for device {0}")]
    MissingUpdatedAt(String),

    /// A timestamp field could not be parsed as RFC3339.
    #[error("invalid {field} timestamp '{value}'")]
    InvalidTimestamp {
        field: &'static str,
        value: String,
    },

    /// A timestamp parsed but lies outside the range the store can index.
    #[error("{field} timestamp '{value}' is outside the supported range")]
    TimestampOutOfRange {
        field: &'static str,
        value: String,
    },
}

/// Result type alias using [`RecordError`].
pub type RecordResult<T> = std::result::Result<T, RecordError>;
