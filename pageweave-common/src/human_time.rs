//! Human-readable duration formatting
//!
//! Used for user-facing wall-clock estimates ("about 4m 30s"). Purely
//! presentational; scheduling decisions never consume these strings.

/// Format selection thresholds (seconds)
const SECONDS_ONLY_MAX: u64 = 100; // < 100s → "Xs"
const MINUTES_MAX: u64 = 6_000; // < 100m → "Xm YYs"

/// Format a duration in seconds for display.
///
/// # Examples
/// ```
/// use pageweave_common::human_time::format_duration;
///
/// assert_eq!(format_duration(45), "45s");
/// assert_eq!(format_duration(330), "5m 30s");
/// assert_eq!(format_duration(7_265), "2h 01m");
/// ```
pub fn format_duration(seconds: u64) -> String {
    if seconds < SECONDS_ONLY_MAX {
        format!("{}s", seconds)
    } else if seconds < MINUTES_MAX {
        format!("{}m {:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Format an estimate range, collapsing when the bounds agree.
///
/// # Examples
/// ```
/// use pageweave_common::human_time::format_estimate_range;
///
/// assert_eq!(format_estimate_range(90, 90), "90s");
/// assert_eq!(format_estimate_range(120, 180), "2m 00s - 3m 00s");
/// ```
pub fn format_estimate_range(low_seconds: u64, high_seconds: u64) -> String {
    if low_seconds == high_seconds {
        format_duration(low_seconds)
    } else {
        format!(
            "{} - {}",
            format_duration(low_seconds),
            format_duration(high_seconds)
        )
    }
}
