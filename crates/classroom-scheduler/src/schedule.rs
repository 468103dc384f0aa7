use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SchedulerError};

/// Base delay of the first automatic retry; doubles for every further attempt.
const RETRY_BASE_SECS: i64 = 60;
/// Cap on the exponent so a long-failing job still retries within a day.
const RETRY_MAX_EXPONENT: u32 = 10;

/// Parse a cron expression (seconds field first, e.g. `"0 0 3 * * *"`).
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expression)
        .map_err(|e| SchedulerError::InvalidSchedule(format!("{expression}: {e}")))
}

/// Next fire time of `expression` strictly after `from`.
///
/// Returns `InvalidSchedule` when the expression does not parse or never
/// fires again (e.g. a fixed year in the past).
pub fn next_after(expression: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse_cron(expression)?
        .after(&from)
        .next()
        .ok_or_else(|| SchedulerError::InvalidSchedule(format!("{expression}: no future run")))
}

/// Delay before retry number `attempt` (1-based): 60s, 120s, 240s, ...
pub fn retry_backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(RETRY_MAX_EXPONENT);
    Duration::seconds(RETRY_BASE_SECS * 2_i64.pow(exp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn daily_cron_advances_to_next_day() {
        let from = Utc.with_ymd_and_hms(2026, 5, 10, 3, 0, 0).unwrap();
        let next = next_after("0 0 3 * * *", from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 5, 11, 3, 0, 0).unwrap());

        let earlier = Utc.with_ymd_and_hms(2026, 5, 10, 1, 0, 0).unwrap();
        let next = next_after("0 0 3 * * *", earlier).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 5, 10, 3, 0, 0).unwrap());
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let err = next_after("every tuesday", Utc::now()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(retry_backoff(1), Duration::seconds(60));
        assert_eq!(retry_backoff(2), Duration::seconds(120));
        assert_eq!(retry_backoff(3), Duration::seconds(240));
        assert_eq!(retry_backoff(50), retry_backoff(11));
    }
}
