//! RFC3339 helpers.
//!
//! All timestamps exchanged with clients and the telemetry source are RFC3339.
//! Comparisons are always done on parsed [`OffsetDateTime`] values, never on
//! the string form, so offsets and fractional seconds compare correctly.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::RecordError;

/// Parse an RFC3339 timestamp, tagging failures with the field name.
pub fn parse_rfc3339(field: &'static str, value: &str) -> Result<OffsetDateTime, RecordError> {
    OffsetDateTime::parse(value.trim(), &Rfc3339).map_err(|_| RecordError::InvalidTimestamp {
        field,
        value: value.to_string(),
    })
}

/// Whether `value` fits in signed 64-bit Unix nanoseconds, the form device
/// timestamps are indexed in. That covers roughly the years 1677 to 2262.
pub fn is_indexable(value: OffsetDateTime) -> bool {
    i64::try_from(value.unix_timestamp_nanos()).is_ok()
}

/// Format a timestamp as RFC3339.
///
/// Formatting only fails for years outside 0..=9999, which cannot come out of
/// [`parse_rfc3339`]; those fall back to the unix epoch.
pub fn format_rfc3339(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
