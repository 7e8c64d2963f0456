//! Shared utility functions used across the crate.

use std::time::Duration;

use crate::error::ConfigError;

/// Parse a duration string (e.g., "30s", "500ms", "1m", "1h") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds (e.g., "30s", "1.5s")
/// - `Nm` - minutes (e.g., "5m")
/// - `Nh` - hours (e.g., "1h")
/// - Plain number - treated as milliseconds (e.g., "1000")
///
/// Returns `None` if the string cannot be parsed.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    let secs = if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<f64>().ok().map(|v| v / 1000.0)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<f64>().ok()
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<f64>().ok().map(|m| m * 60.0)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<f64>().ok().map(|h| h * 3600.0)
    } else {
        s.parse::<u64>().ok().map(|ms| ms as f64 / 1000.0)
    }?;

    // Rejects negative, NaN, infinite and out-of-range values.
    Duration::try_from_secs_f64(secs).ok()
}

/// Parse a duration option, naming the offending field on failure.
pub fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration_str(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}
