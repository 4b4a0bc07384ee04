//! Fire-time computation for the three schedule kinds.
//!
//! All computation is in UTC. Cron expressions are the 5-field standard
//! (minute hour day-of-month month day-of-week) with `*` `,` `-` `/`
//! operators — no seconds field, no named macros.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::store::types::ScheduleType;
use crate::{AutomatorError, Result};

/// A parsed, validated schedule.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    /// 5-field cron expression.
    Cron(Box<cron::Schedule>),
    /// Single UTC instant.
    Once(DateTime<Utc>),
    /// Fixed period in whole seconds (≥ 1).
    Interval(u64),
}

impl ScheduleSpec {
    /// Parse and validate a schedule value for the given type.
    pub fn parse(schedule_type: ScheduleType, value: &str) -> Result<Self> {
        match schedule_type {
            ScheduleType::Cron => parse_cron(value).map(|s| Self::Cron(Box::new(s))),
            ScheduleType::Once => {
                let at = DateTime::parse_from_rfc3339(value.trim()).map_err(|e| {
                    AutomatorError::Validation(format!(
                        "once schedule is not an RFC 3339 timestamp: {e}"
                    ))
                })?;
                Ok(Self::Once(at.with_timezone(&Utc)))
            }
            ScheduleType::Interval => {
                let secs: u64 = value.trim().parse().map_err(|_| {
                    AutomatorError::Validation(format!(
                        "interval schedule must be a whole number of seconds, got {value:?}"
                    ))
                })?;
                if secs == 0 {
                    return Err(AutomatorError::Validation(
                        "interval schedule must be at least 1 second".to_owned(),
                    ));
                }
                Ok(Self::Interval(secs))
            }
        }
    }

    /// Next fire time given the last completed fire (if any) and the
    /// current instant. `None` means the schedule will never fire again.
    ///
    /// - `once`: the instant itself while it is still in the future.
    /// - `interval`: `max(last_run_at, now) + secs`; first scheduling after
    ///   creation therefore lands at `now + secs`.
    /// - `cron`: the smallest matching instant strictly after
    ///   `max(last_run_at, now)`.
    #[must_use]
    pub fn next_fire(
        &self,
        last_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let base = match last_run_at {
            Some(last) if last > now => last,
            _ => now,
        };
        match self {
            Self::Once(at) => (*at > now).then_some(*at),
            Self::Interval(secs) => {
                let secs = i64::try_from(*secs).unwrap_or(i64::MAX);
                base.checked_add_signed(Duration::seconds(secs))
            }
            Self::Cron(schedule) => schedule.after(&base).next(),
        }
    }
}

/// Parse a 5-field cron expression.
///
/// The `cron` crate wants a seconds field, so a literal `0` is prepended
/// after the field count is validated — keeping the operator-visible format
/// at exactly five fields.
fn parse_cron(value: &str) -> Result<cron::Schedule> {
    let fields = value.split_whitespace().count();
    if fields != 5 {
        return Err(AutomatorError::Validation(format!(
            "cron expression must have exactly 5 fields, got {fields}"
        )));
    }
    cron::Schedule::from_str(&format!("0 {}", value.trim()))
        .map_err(|e| AutomatorError::Validation(format!("invalid cron expression: {e}")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn interval_first_fire_is_now_plus_period() {
        let spec = ScheduleSpec::parse(ScheduleType::Interval, "60").unwrap();
        let now = at(2026, 3, 1, 12, 0, 0);
        assert_eq!(spec.next_fire(None, now), Some(at(2026, 3, 1, 12, 1, 0)));
    }

    #[test]
    fn interval_coalesces_missed_fires() {
        // Last run 10 minutes ago: the next fire is one period from now,
        // not ten backlogged periods.
        let spec = ScheduleSpec::parse(ScheduleType::Interval, "60").unwrap();
        let now = at(2026, 3, 1, 12, 10, 0);
        let last = Some(at(2026, 3, 1, 12, 0, 0));
        assert_eq!(spec.next_fire(last, now), Some(at(2026, 3, 1, 12, 11, 0)));
    }

    #[test]
    fn interval_rejects_zero_and_garbage() {
        assert!(ScheduleSpec::parse(ScheduleType::Interval, "0").is_err());
        assert!(ScheduleSpec::parse(ScheduleType::Interval, "-5").is_err());
        assert!(ScheduleSpec::parse(ScheduleType::Interval, "soon").is_err());
        assert!(ScheduleSpec::parse(ScheduleType::Interval, "1.5").is_err());
    }

    #[test]
    fn once_fires_only_in_the_future() {
        let spec = ScheduleSpec::parse(ScheduleType::Once, "2026-03-01T15:00:00Z").unwrap();
        let before = at(2026, 3, 1, 12, 0, 0);
        assert_eq!(spec.next_fire(None, before), Some(at(2026, 3, 1, 15, 0, 0)));

        let after = at(2026, 3, 1, 16, 0, 0);
        assert_eq!(spec.next_fire(None, after), None);
    }

    #[test]
    fn once_accepts_offset_timestamps_as_utc() {
        let spec = ScheduleSpec::parse(ScheduleType::Once, "2026-03-01T15:00:00+02:00").unwrap();
        let now = at(2026, 3, 1, 12, 0, 0);
        assert_eq!(spec.next_fire(None, now), Some(at(2026, 3, 1, 13, 0, 0)));
    }

    #[test]
    fn once_rejects_malformed_timestamps() {
        assert!(ScheduleSpec::parse(ScheduleType::Once, "tomorrow").is_err());
        assert!(ScheduleSpec::parse(ScheduleType::Once, "2026-03-01").is_err());
    }

    #[test]
    fn cron_every_minute() {
        let spec = ScheduleSpec::parse(ScheduleType::Cron, "* * * * *").unwrap();
        let now = at(2026, 3, 1, 12, 0, 30);
        assert_eq!(spec.next_fire(None, now), Some(at(2026, 3, 1, 12, 1, 0)));
    }

    #[test]
    fn cron_strictly_after_base() {
        // Exactly on a match: the next fire is the following match, never
        // the current instant.
        let spec = ScheduleSpec::parse(ScheduleType::Cron, "*/15 * * * *").unwrap();
        let now = at(2026, 3, 1, 12, 15, 0);
        assert_eq!(spec.next_fire(None, now), Some(at(2026, 3, 1, 12, 30, 0)));
    }

    #[test]
    fn cron_operators_parse() {
        for expr in ["0 9 * * 1-5", "30 4 1,15 * *", "*/5 8-18 * * *", "0 0 1 1 *"] {
            assert!(
                ScheduleSpec::parse(ScheduleType::Cron, expr).is_ok(),
                "expected {expr:?} to parse"
            );
        }
    }

    #[test]
    fn cron_rejects_wrong_field_counts_and_junk() {
        assert!(ScheduleSpec::parse(ScheduleType::Cron, "* * * *").is_err());
        assert!(ScheduleSpec::parse(ScheduleType::Cron, "0 * * * * *").is_err());
        assert!(ScheduleSpec::parse(ScheduleType::Cron, "61 * * * *").is_err());
        assert!(ScheduleSpec::parse(ScheduleType::Cron, "not a cron").is_err());
    }
}
