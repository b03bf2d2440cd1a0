//! Calendar-reminder adapter — the thin layer that lowers a calendar event's
//! reminders into cron [`Job`]s.
//!
//! Grounded on `original_source/nanobot/services/calendar_reminder.py`: a
//! calendar event carries at most one reminder configuration, which is
//! turned into a single cron job whose id encodes the event so later updates
//! can find and replace it.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::json;
use tracing::{error, info};

use nanobot_core::reminder::ReminderAction;

use crate::engine::SchedulerHandle;
use crate::error::Result;
use crate::types::{Job, Schedule};

/// How far past the event start a recurring reminder cron job stays active.
const MAX_REMINDER_DAYS: i64 = 365;

/// How a calendar event repeats. Maps 1:1 to `RECURRENCE_TO_CRON` in the
/// source adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    None,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    fn parse(s: &str) -> Self {
        match s {
            "daily" => Recurrence::Daily,
            "weekly" => Recurrence::Weekly,
            "monthly" => Recurrence::Monthly,
            _ => Recurrence::None,
        }
    }
}

/// Minimal view of a calendar event needed to derive reminder jobs. Calendar
/// storage itself is out of scope here — callers (a future calendar tool)
/// supply this directly.
#[derive(Debug, Clone)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub recurrence: String,
    /// Minutes before `start` to fire the reminder (0 = at the event start).
    pub reminder_minutes: i64,
    /// Delivery channel (`"discord"`, `"telegram"`, `"ws"`), if configured.
    pub channel: Option<String>,
    /// Delivery target within that channel (numeric Discord channel id, chat id, …).
    pub target: Option<String>,
}

/// `cal:<eventId>:<reminderMinutes>` — stable across create/update so
/// `delete_reminder_jobs` can find every job belonging to an event.
fn job_id(event_id: &str, reminder_minutes: i64) -> String {
    format!("cal:{event_id}:{reminder_minutes}")
}

/// Build the recurrence-aware cron expression for a trigger instant, exactly
/// mirroring `_build_recurrence_cron`/`RECURRENCE_TO_CRON`.
fn build_cron_expr(trigger: DateTime<Utc>, recurrence: Recurrence) -> String {
    let (hour, minute) = (trigger.hour(), trigger.minute());
    match recurrence {
        Recurrence::None | Recurrence::Daily => format!("{minute} {hour} * * *"),
        Recurrence::Weekly => format!("{minute} {hour} * * 1"),
        Recurrence::Monthly => format!("{minute} {hour} 1 * *"),
    }
}

/// Create the reminder job(s) for a calendar event. Returns an empty vec if
/// the event has no reminder configured.
pub fn create_reminder_jobs(handle: &SchedulerHandle, event: &CalendarEvent) -> Result<Vec<Job>> {
    if event.channel.is_none() && event.target.is_none() {
        // Still schedule — delivery routing falls back to notifications —
        // but a reminder with neither is almost certainly a caller bug.
        info!(event_id = %event.id, "calendar reminder has no delivery target configured");
    }

    let recurrence = Recurrence::parse(&event.recurrence);
    let trigger = event.start - Duration::minutes(event.reminder_minutes);
    let cron_expr = build_cron_expr(trigger, recurrence);
    let end_date = event.start + Duration::days(MAX_REMINDER_DAYS);

    let message = if event.reminder_minutes == 0 {
        format!("Event \"{}\" is starting now", event.title)
    } else {
        format!(
            "Event \"{}\" starts in {} minutes",
            event.title, event.reminder_minutes
        )
    };

    let action = ReminderAction {
        channel: event.channel.clone().unwrap_or_default(),
        channel_id: event.target.as_deref().and_then(|t| t.parse().ok()),
        message,
        image_url: None,
        bash_command: None,
        session_key: None,
        kind: nanobot_core::reminder::ReminderKind::CalendarReminder,
    };
    let action_json = serde_json::to_string(&action)
        .unwrap_or_else(|_| json!({"message": action.message}).to_string());

    let schedule = Schedule::Cron {
        expression: cron_expr.clone(),
        tz: None,
        end_date: Some(end_date),
    };

    let id = job_id(&event.id, event.reminder_minutes);
    match handle.add_job_full(
        Some(id.clone()),
        &format!("[calendar] {}", event.title),
        schedule,
        &action_json,
        false,
        false,
    ) {
        Ok(job) => {
            info!(job_id = %id, cron = %cron_expr, end = %end_date, "calendar reminder job created");
            Ok(vec![job])
        }
        Err(e) => {
            error!(event_id = %event.id, "failed to create calendar reminder job: {e}");
            Err(e)
        }
    }
}

/// Delete then recreate every job belonging to `event` — matches
/// `update_reminder_jobs`'s "blow away and rebuild" semantics exactly.
pub fn update_reminder_jobs(handle: &SchedulerHandle, event: &CalendarEvent) -> Result<Vec<Job>> {
    delete_reminder_jobs(handle, &event.id)?;
    create_reminder_jobs(handle, event)
}

/// Remove every job whose id is prefixed `cal:<eventId>:`. Returns the ids removed.
pub fn delete_reminder_jobs(handle: &SchedulerHandle, event_id: &str) -> Result<Vec<String>> {
    let prefix = format!("cal:{event_id}:");
    let mut removed = Vec::new();
    for job in handle.list_jobs()? {
        if job.id.starts_with(&prefix) {
            if let Err(e) = handle.remove_job(&job.id) {
                error!(job_id = %job.id, "failed to delete calendar reminder job: {e}");
                continue;
            }
            removed.push(job.id);
        }
    }
    Ok(removed)
}

/// All jobs created by the calendar adapter, for listing/debugging.
pub fn list_calendar_jobs(handle: &SchedulerHandle) -> Result<Vec<Job>> {
    Ok(handle
        .list_jobs()?
        .into_iter()
        .filter(|j| j.id.starts_with("cal:"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn handle() -> SchedulerHandle {
        SchedulerHandle::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap()
    }

    fn sample_event() -> CalendarEvent {
        CalendarEvent {
            id: "evt1".to_string(),
            title: "Standup".to_string(),
            start: Utc::now() + Duration::days(1),
            recurrence: "daily".to_string(),
            reminder_minutes: 10,
            channel: Some("discord".to_string()),
            target: Some("12345".to_string()),
        }
    }

    #[test]
    fn create_reminder_jobs_uses_deterministic_id() {
        let handle = handle();
        let jobs = create_reminder_jobs(&handle, &sample_event()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "cal:evt1:10");
    }

    #[test]
    fn update_reminder_jobs_replaces_the_existing_job() {
        let handle = handle();
        let event = sample_event();
        create_reminder_jobs(&handle, &event).unwrap();

        let mut updated = event.clone();
        updated.reminder_minutes = 15;
        update_reminder_jobs(&handle, &updated).unwrap();

        let jobs = list_calendar_jobs(&handle).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "cal:evt1:15");
    }

    #[test]
    fn delete_reminder_jobs_removes_every_job_for_the_event() {
        let handle = handle();
        let event = sample_event();
        create_reminder_jobs(&handle, &event).unwrap();

        let removed = delete_reminder_jobs(&handle, &event.id).unwrap();
        assert_eq!(removed, vec!["cal:evt1:10".to_string()]);
        assert!(list_calendar_jobs(&handle).unwrap().is_empty());
    }

    #[test]
    fn build_cron_expr_maps_recurrence_to_template() {
        let trigger = Utc.with_ymd_and_hms(2026, 7, 29, 9, 30, 0).unwrap();
        assert_eq!(build_cron_expr(trigger, Recurrence::Daily), "30 9 * * *");
        assert_eq!(build_cron_expr(trigger, Recurrence::Weekly), "30 9 * * 1");
        assert_eq!(build_cron_expr(trigger, Recurrence::Monthly), "30 9 1 * *");
    }
}
