use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub fn now_i64() -> i64 {
    Utc::now().timestamp()
}

pub fn get_instant() -> Instant {
    Instant::now()
}

/// Far enough ahead to never be reached by a run.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Deadline `seconds` from now on the tokio clock, saturating at a far
/// future instant.
pub fn deadline_in(seconds: u64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_secs(seconds))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Human readable UTC rendering of a unix timestamp, for logs.
pub fn format_unix(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_is_seconds_ahead() {
        let before = Instant::now();
        let deadline = deadline_in(30);
        assert!(deadline >= before + Duration::from_secs(30));
        assert!(deadline <= Instant::now() + Duration::from_secs(30));
    }

    #[test]
    fn huge_timeout_saturates() {
        let deadline = deadline_in(u64::MAX);
        assert!(deadline > Instant::now() + Duration::from_secs(365 * 24 * 3600));
    }

    #[test]
    fn unix_timestamps_render_as_rfc3339() {
        assert_eq!(format_unix(0), "1970-01-01T00:00:00+00:00");
    }
}
