use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use tracing::warn;

use crate::types::Schedule;

/// Compute the next UTC execution time for `schedule` starting *after* `from`.
///
/// Returns `None` when the schedule is exhausted (e.g. a `Once` job whose
/// time has already passed) or when the schedule type is not yet supported
/// (e.g. `Cron`).
pub fn compute_next_run(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { at } => {
            // Fire only if the instant is still in the future.
            if *at > from {
                Some(*at)
            } else {
                None
            }
        }

        Schedule::Interval { every_secs } => Some(from + Duration::seconds(*every_secs as i64)),

        Schedule::Daily { hour, minute } => {
            // Build today's candidate at HH:MM:00 UTC.
            let candidate = Utc
                .with_ymd_and_hms(
                    from.year(),
                    from.month(),
                    from.day(),
                    *hour as u32,
                    *minute as u32,
                    0,
                )
                .single()?;
            if candidate > from {
                Some(candidate)
            } else {
                // Today's window has passed — advance to tomorrow.
                Some(candidate + Duration::days(1))
            }
        }

        Schedule::Weekly { day, hour, minute } => {
            // `day` follows ISO weekday numbering: 0=Monday … 6=Sunday,
            // which matches chrono's `num_days_from_monday`.
            let today_dow = from.weekday().num_days_from_monday() as i64;
            let target_dow = (*day as i64).clamp(0, 6);
            let mut days_ahead = target_dow - today_dow;

            // Normalise: negative means the target day already passed this week.
            let candidate_day = if days_ahead < 0 {
                from + Duration::days(7 + days_ahead)
            } else {
                from + Duration::days(days_ahead)
            };

            let candidate = Utc
                .with_ymd_and_hms(
                    candidate_day.year(),
                    candidate_day.month(),
                    candidate_day.day(),
                    *hour as u32,
                    *minute as u32,
                    0,
                )
                .single()?;

            if candidate > from {
                Some(candidate)
            } else {
                // The time on the target weekday has already passed — push 7 days.
                days_ahead = if days_ahead <= 0 { 7 } else { 7 - days_ahead };
                Some(candidate + Duration::days(days_ahead))
            }
        }

        Schedule::Cron { expression, tz, end_date } => {
            let zone: chrono_tz::Tz = tz
                .as_deref()
                .and_then(|t| t.parse().ok())
                .unwrap_or(chrono_tz::UTC);
            let parsed = match parse_cron(expression) {
                Ok(s) => s,
                Err(e) => {
                    warn!(expression = %expression, "invalid cron expression: {e}");
                    return None;
                }
            };
            let from_zoned = from.with_timezone(&zone);
            let next = parsed.after(&from_zoned).next()?.with_timezone(&Utc);
            if let Some(end) = end_date {
                if next > *end {
                    return None;
                }
            }
            Some(next)
        }
    }
}

/// Parse a standard 5-field POSIX cron expression (`min hour dom month dow`)
/// by prepending a `"0"` seconds field — the `cron` crate natively speaks
/// 6/7-field expressions including seconds.
pub fn parse_cron(expression: &str) -> std::result::Result<cron::Schedule, cron::error::Error> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let with_seconds = if fields.len() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    with_seconds.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn once_fires_only_if_in_the_future() {
        let now = Utc::now();
        assert!(compute_next_run(&Schedule::Once { at: now + Duration::minutes(5) }, now).is_some());
        assert!(compute_next_run(&Schedule::Once { at: now - Duration::minutes(5) }, now).is_none());
    }

    #[test]
    fn interval_advances_by_exactly_the_given_seconds() {
        let now = Utc::now();
        let next = compute_next_run(&Schedule::Interval { every_secs: 90 }, now).unwrap();
        assert_eq!(next, now + Duration::seconds(90));
    }

    #[test]
    fn cron_every_five_minutes_lands_on_a_five_minute_boundary() {
        let from = Utc.with_ymd_and_hms(2026, 7, 29, 10, 3, 0).unwrap();
        let schedule = Schedule::Cron {
            expression: "*/5 * * * *".to_string(),
            tz: None,
            end_date: None,
        };
        let next = compute_next_run(&schedule, from).unwrap();
        assert!(next > from);
        assert_eq!(next.minute() % 5, 0);
    }

    #[test]
    fn cron_respects_end_date() {
        let from = Utc.with_ymd_and_hms(2026, 7, 29, 10, 0, 0).unwrap();
        let schedule = Schedule::Cron {
            expression: "0 * * * *".to_string(),
            tz: None,
            end_date: Some(from + Duration::minutes(30)),
        };
        assert!(compute_next_run(&schedule, from).is_none());
    }

    #[test]
    fn cron_invalid_expression_returns_none_instead_of_panicking() {
        let schedule = Schedule::Cron {
            expression: "not a cron expression".to_string(),
            tz: None,
            end_date: None,
        };
        assert!(compute_next_run(&schedule, Utc::now()).is_none());
    }

    #[test]
    fn parse_cron_prepends_seconds_field_for_five_field_expressions() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
    }
}
