//! Cron expression handling.
//!
//! Accepted forms:
//!
//! - `@always`: every minute, at second 0.
//! - 5-field Unix expressions (`min hour dom month dow`), run at second 0.
//! - 6- and 7-field expressions with seconds (and year), as the `cron`
//!   crate reads them.
//! - `@hourly`, `@daily` and the other descriptors the `cron` crate knows.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::CronError;

pub const ALWAYS: &str = "@always";

const EVERY_MINUTE: &str = "0 * * * * *";

/// Parse `expr` into a schedule, normalizing the forms listed above.
pub fn parse(expr: &str) -> Result<cron::Schedule, CronError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.eq_ignore_ascii_case(ALWAYS) {
        EVERY_MINUTE.to_string()
    } else if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    cron::Schedule::from_str(&normalized).map_err(|e| CronError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// First fire time strictly after `after`.
pub fn next_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    parse(expr)?
        .after(&after)
        .next()
        .ok_or_else(|| CronError::InvalidSchedule {
            expr: expr.to_string(),
            reason: "schedule never fires again".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn always_fires_at_the_next_minute() {
        let next = next_after(ALWAYS, t("2026-01-01T00:00:30Z")).unwrap();
        assert_eq!(next, t("2026-01-01T00:01:00Z"));
    }

    #[test]
    fn next_is_strictly_after_the_reference() {
        let next = next_after(ALWAYS, t("2026-01-01T00:01:00Z")).unwrap();
        assert_eq!(next, t("2026-01-01T00:02:00Z"));
    }

    #[test]
    fn five_field_expressions_run_at_second_zero() {
        let next = next_after("*/15 * * * *", t("2026-01-01T00:07:10Z")).unwrap();
        assert_eq!(next, t("2026-01-01T00:15:00Z"));
    }

    #[test]
    fn six_field_expressions_keep_their_seconds() {
        let next = next_after("30 0 * * * *", t("2026-01-01T00:00:00Z")).unwrap();
        assert_eq!(next, t("2026-01-01T00:00:30Z"));
    }

    #[test]
    fn descriptors_are_accepted() {
        let next = next_after("@hourly", t("2026-01-01T00:10:00Z")).unwrap();
        assert_eq!(next, t("2026-01-01T01:00:00Z"));
    }

    #[test]
    fn garbage_is_rejected() {
        for expr in ["", "not-a-cron", "* * *", "99 * * * *"] {
            let err = parse(expr).unwrap_err();
            assert!(matches!(err, CronError::InvalidSchedule { .. }), "{expr}");
        }
    }
}
