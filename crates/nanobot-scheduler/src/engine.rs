use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    schedule::compute_next_run,
    types::{Job, JobStatus, Schedule},
};

/// Shared handle for job management (list/add/remove) while the engine loop runs.
///
/// Uses its own `Connection` so WS handlers can manage jobs without conflicting
/// with the engine's polling queries.
pub struct SchedulerHandle {
    conn: Arc<Mutex<Connection>>,
}

impl SchedulerHandle {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn add_job(&self, name: &str, schedule: Schedule, action: &str) -> Result<Job> {
        self.add_job_ex(name, schedule, action, false, false)
    }

    /// Like [`Self::add_job`] but lets the caller mark the job as a system
    /// job (undeletable via `remove_job`) and/or as delete-after-run (the
    /// row is removed outright, not left around as `completed`, once its
    /// schedule is exhausted). Used by the memory-maintenance background
    /// jobs seeded at startup and by one-shot calendar reminders.
    pub fn add_job_ex(
        &self,
        name: &str,
        schedule: Schedule,
        action: &str,
        is_system: bool,
        delete_after_run: bool,
    ) -> Result<Job> {
        self.add_job_full(None, name, schedule, action, is_system, delete_after_run)
    }

    /// Full constructor: lets the caller pin a deterministic `id` instead of
    /// a random UUID — used by the calendar adapter, whose job ids are
    /// `cal:<eventId>:<reminderMinutes>` so `delete_reminder_jobs` can find
    /// them again by prefix, and by system-job seeding, which uses the id to
    /// detect "already seeded" across restarts.
    pub fn add_job_full(
        &self,
        id: Option<String>,
        name: &str,
        schedule: Schedule,
        action: &str,
        is_system: bool,
        delete_after_run: bool,
    ) -> Result<Job> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let next = compute_next_run(&schedule, now).map(|dt| dt.to_rfc3339());
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let schedule_json = serde_json::to_string(&schedule)
            .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        conn.execute(
            "INSERT INTO jobs
             (id, name, schedule, action, status, last_run, next_run,
              run_count, max_runs, created_at, updated_at, is_system, delete_after_run)
             VALUES (?1,?2,?3,?4,'pending',NULL,?5,0,NULL,?6,?6,?7,?8)",
            rusqlite::params![id, name, schedule_json, action, next, now_str, is_system, delete_after_run],
        )?;
        info!(job_id = %id, %name, "job added via handle");
        Ok(Job {
            id,
            name: name.to_string(),
            schedule,
            action: action.to_string(),
            status: JobStatus::Pending,
            last_run: None,
            next_run: next,
            run_count: 0,
            max_runs: None,
            created_at: now_str.clone(),
            updated_at: now_str,
            is_system,
            delete_after_run,
            last_status: None,
            last_error: None,
        })
    }

    /// Fetch a single job by id, if it exists.
    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.list_jobs()?.into_iter().find(|j| j.id == id))
    }

    /// Overwrite a job's `action` payload in place — used by the
    /// memory-maintenance handlers to persist their own mutable state
    /// (`last_daily_run_date`, `last_summarize_run`) back into the row they
    /// fired from.
    pub fn update_action(&self, id: &str, action: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET action = ?1 WHERE id = ?2",
            rusqlite::params![action, id],
        )?;
        Ok(())
    }

    pub fn remove_job(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let is_system: Option<bool> = conn
            .query_row("SELECT is_system FROM jobs WHERE id = ?1", [id], |row| row.get(0))
            .ok();
        match is_system {
            None => return Err(SchedulerError::JobNotFound { id: id.to_string() }),
            Some(true) => {
                warn!(job_id = %id, "refusing to remove system job");
                return Err(SchedulerError::InvalidSchedule(format!(
                    "job {id} is a system job and cannot be removed"
                )));
            }
            Some(false) => {}
        }
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "job removed via handle");
        Ok(())
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, schedule, action, status, last_run, next_run,
                    run_count, max_runs, created_at, updated_at,
                    is_system, delete_after_run, last_status, last_error
             FROM jobs ORDER BY created_at",
        )?;
        let jobs = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, u32>(7)?,
                    row.get::<_, Option<u32>>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, bool>(11)?,
                    row.get::<_, bool>(12)?,
                    row.get::<_, Option<String>>(13)?,
                    row.get::<_, Option<String>>(14)?,
                ))
            })?
            .filter_map(|r| {
                let (
                    id,
                    name,
                    sched_json,
                    action,
                    status_str,
                    last_run,
                    next_run,
                    run_count,
                    max_runs,
                    created_at,
                    updated_at,
                    is_system,
                    delete_after_run,
                    last_status,
                    last_error,
                ) = r.ok()?;
                let schedule: Schedule = serde_json::from_str(&sched_json).ok()?;
                let status: JobStatus = status_str.parse().ok()?;
                Some(Job {
                    id,
                    name,
                    schedule,
                    action,
                    status,
                    last_run,
                    next_run,
                    run_count,
                    max_runs,
                    created_at,
                    updated_at,
                    is_system,
                    delete_after_run,
                    last_status,
                    last_error,
                })
            })
            .collect();
        Ok(jobs)
    }

    /// Record the outcome of the most recent delivery attempt for `id`,
    /// independent of the scheduling-lifecycle `status` column.
    pub fn record_result(&self, id: &str, status: &str, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET last_status = ?1, last_error = ?2 WHERE id = ?3",
            rusqlite::params![status, error, id],
        )?;
        Ok(())
    }
}

/// Core scheduler: persists jobs to SQLite and drives execution at ±1 s precision.
pub struct SchedulerEngine {
    conn: Connection,
    /// If set, fired jobs are sent here for delivery routing.
    fired_tx: Option<mpsc::Sender<Job>>,
}

impl SchedulerEngine {
    /// Create a new engine, initialising the DB schema if needed.
    ///
    /// Pass `Some(tx)` to receive a copy of every fired [`Job`] via mpsc.
    /// The sender is non-blocking (`try_send`) so the tick loop is never stalled.
    pub fn new(conn: Connection, fired_tx: Option<mpsc::Sender<Job>>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self { conn, fired_tx })
    }

    /// Add a new job. Returns the fully populated [`Job`] record.
    pub fn add_job(&self, name: &str, schedule: Schedule, action: &str) -> Result<Job> {
        self.add_job_ex(name, schedule, action, false, false)
    }

    /// Like [`Self::add_job`], additionally marking the job as a system job
    /// and/or delete-after-run. See [`SchedulerHandle::add_job_ex`] for the
    /// semantics of both flags.
    pub fn add_job_ex(
        &self,
        name: &str,
        schedule: Schedule,
        action: &str,
        is_system: bool,
        delete_after_run: bool,
    ) -> Result<Job> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let next = compute_next_run(&schedule, now).map(|dt| dt.to_rfc3339());
        let id = Uuid::new_v4().to_string();
        let schedule_json = serde_json::to_string(&schedule)
            .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        self.conn.execute(
            "INSERT INTO jobs
             (id, name, schedule, action, status, last_run, next_run,
              run_count, max_runs, created_at, updated_at, is_system, delete_after_run)
             VALUES (?1,?2,?3,?4,'pending',NULL,?5,0,NULL,?6,?6,?7,?8)",
            rusqlite::params![id, name, schedule_json, action, next, now_str, is_system, delete_after_run],
        )?;

        info!(job_id = %id, %name, "job added");

        Ok(Job {
            id,
            name: name.to_string(),
            schedule,
            action: action.to_string(),
            status: JobStatus::Pending,
            last_run: None,
            next_run: next,
            run_count: 0,
            max_runs: None,
            created_at: now_str.clone(),
            updated_at: now_str,
            is_system,
            delete_after_run,
            last_status: None,
            last_error: None,
        })
    }

    /// Remove a job by ID. Returns `JobNotFound` if no row is deleted, and
    /// refuses (without deleting) when the job is a system job.
    pub fn remove_job(&self, id: &str) -> Result<()> {
        let is_system: Option<bool> = self
            .conn
            .query_row("SELECT is_system FROM jobs WHERE id = ?1", [id], |row| row.get(0))
            .ok();
        match is_system {
            None => return Err(SchedulerError::JobNotFound { id: id.to_string() }),
            Some(true) => {
                warn!(job_id = %id, "refusing to remove system job");
                return Err(SchedulerError::InvalidSchedule(format!(
                    "job {id} is a system job and cannot be removed"
                )));
            }
            Some(false) => {}
        }
        let n = self.conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "job removed");
        Ok(())
    }

    /// Record the outcome of the most recent delivery attempt for `id`.
    pub fn record_result(&self, id: &str, status: &str, error: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET last_status = ?1, last_error = ?2 WHERE id = ?3",
            rusqlite::params![status, error, id],
        )?;
        Ok(())
    }

    /// Return all known jobs ordered by creation time.
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, schedule, action, status, last_run, next_run,
                    run_count, max_runs, created_at, updated_at,
                    is_system, delete_after_run, last_status, last_error
             FROM jobs ORDER BY created_at",
        )?;

        let jobs = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,         // id
                    row.get::<_, String>(1)?,         // name
                    row.get::<_, String>(2)?,         // schedule JSON
                    row.get::<_, String>(3)?,         // action
                    row.get::<_, String>(4)?,         // status
                    row.get::<_, Option<String>>(5)?, // last_run
                    row.get::<_, Option<String>>(6)?, // next_run
                    row.get::<_, u32>(7)?,            // run_count
                    row.get::<_, Option<u32>>(8)?,    // max_runs
                    row.get::<_, String>(9)?,         // created_at
                    row.get::<_, String>(10)?,        // updated_at
                    row.get::<_, bool>(11)?,          // is_system
                    row.get::<_, bool>(12)?,          // delete_after_run
                    row.get::<_, Option<String>>(13)?, // last_status
                    row.get::<_, Option<String>>(14)?, // last_error
                ))
            })?
            .filter_map(|r| {
                let (
                    id,
                    name,
                    sched_json,
                    action,
                    status_str,
                    last_run,
                    next_run,
                    run_count,
                    max_runs,
                    created_at,
                    updated_at,
                    is_system,
                    delete_after_run,
                    last_status,
                    last_error,
                ) = r.ok()?;
                let schedule: Schedule = serde_json::from_str(&sched_json).ok()?;
                let status: JobStatus = status_str.parse().ok()?;
                Some(Job {
                    id,
                    name,
                    schedule,
                    action,
                    status,
                    last_run,
                    next_run,
                    run_count,
                    max_runs,
                    created_at,
                    updated_at,
                    is_system,
                    delete_after_run,
                    last_status,
                    last_error,
                })
            })
            .collect();

        Ok(jobs)
    }

    /// Main event loop. Polls every second until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        self.mark_missed_on_startup();

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        error!("scheduler tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    // --- private helpers ---------------------------------------------------

    /// On startup, mark any pending job whose next_run is in the past as Missed.
    fn mark_missed_on_startup(&mut self) {
        let now = Utc::now().to_rfc3339();
        match self.conn.execute(
            "UPDATE jobs SET status = 'missed', updated_at = ?1
             WHERE status = 'pending' AND next_run IS NOT NULL AND next_run < ?1",
            [&now],
        ) {
            Ok(n) if n > 0 => warn!(count = n, "jobs marked missed on startup"),
            Err(e) => error!("missed-on-startup query failed: {e}"),
            _ => {}
        }
    }

    /// Process all jobs whose next_run has arrived.
    fn tick(&mut self) -> Result<()> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        // Collect eagerly inside the block so `stmt` is dropped before we
        // borrow `self.conn` again for the UPDATE below.
        // Columns: id, name, schedule, action, run_count, max_runs, delete_after_run, is_system
        let due: Vec<(String, String, String, String, u32, Option<u32>, bool, bool)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT id, name, schedule, action, run_count, max_runs, delete_after_run, is_system FROM jobs
                 WHERE status = 'pending' AND next_run IS NOT NULL AND next_run <= ?1",
            )?;
            let rows: Vec<_> = stmt
                .query_map([&now_str], |row| {
                    Ok((
                        row.get::<_, String>(0)?,      // id
                        row.get::<_, String>(1)?,      // name
                        row.get::<_, String>(2)?,      // schedule JSON
                        row.get::<_, String>(3)?,      // action JSON
                        row.get::<_, u32>(4)?,         // run_count
                        row.get::<_, Option<u32>>(5)?, // max_runs
                        row.get::<_, bool>(6)?,        // delete_after_run
                        row.get::<_, bool>(7)?,        // is_system
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        for (id, name, sched_json, action, run_count, max_runs, delete_after_run, is_system) in due {
            let schedule: Schedule = match serde_json::from_str(&sched_json) {
                Ok(s) => s,
                Err(e) => {
                    error!(job_id = %id, "bad schedule JSON: {e}");
                    continue;
                }
            };

            let new_count = run_count + 1;
            // next is None when the schedule is exhausted (Once after first fire,
            // or max_runs reached).
            let next = if max_runs.is_some_and(|m| new_count >= m) {
                None
            } else {
                compute_next_run(&schedule, now).map(|dt| dt.to_rfc3339())
            };

            if next.is_none() && delete_after_run {
                info!(job_id = %id, %name, run = new_count, "job exhausted, deleting (delete_after_run)");
                self.conn.execute("DELETE FROM jobs WHERE id = ?1", [&id])?;
            } else {
                // Completed when there is no future run; pending when there is a next_run.
                let new_status = if next.is_none() { "completed" } else { "pending" };

                info!(job_id = %id, %name, run = new_count, next_status = %new_status, "executing job");

                self.conn.execute(
                    "UPDATE jobs SET status=?1, last_run=?2, next_run=?3,
                      run_count=?4, updated_at=?2
                     WHERE id=?5",
                    rusqlite::params![new_status, now_str, next, new_count, id],
                )?;
            }

            // Forward the fired job to the delivery router (non-blocking).
            if let Some(ref tx) = self.fired_tx {
                let job = Job {
                    id: id.clone(),
                    name: name.clone(),
                    schedule,
                    action: action.clone(),
                    status: JobStatus::Pending,
                    last_run: Some(now_str.clone()),
                    next_run: next.clone(),
                    run_count: new_count,
                    max_runs,
                    created_at: String::new(),
                    updated_at: now_str.clone(),
                    is_system,
                    delete_after_run,
                    last_status: None,
                    last_error: None,
                };
                // try_send never blocks the tick loop; log a warning if the channel is full.
                if tx.try_send(job).is_err() {
                    warn!(job_id = %id, "delivery channel full or closed — job dropped");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open_memory() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn system_jobs_cannot_be_removed() {
        let handle = SchedulerHandle::new(open_memory()).unwrap();
        let job = handle
            .add_job_ex("system:memory_maintenance", Schedule::Interval { every_secs: 300 }, "{}", true, false)
            .unwrap();

        let err = handle.remove_job(&job.id).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        assert!(handle.list_jobs().unwrap().iter().any(|j| j.id == job.id));
    }

    #[test]
    fn non_system_jobs_can_be_removed() {
        let handle = SchedulerHandle::new(open_memory()).unwrap();
        let job = handle
            .add_job("user reminder", Schedule::Once { at: Utc::now() + Duration::minutes(5) }, "{}")
            .unwrap();

        handle.remove_job(&job.id).unwrap();
        assert!(handle.list_jobs().unwrap().is_empty());
    }

    #[test]
    fn delete_after_run_job_is_removed_once_exhausted() {
        let conn = open_memory();
        let mut engine = SchedulerEngine::new(conn, None).unwrap();
        let job = engine
            .add_job_ex("cal:evt1:30", Schedule::Once { at: Utc::now() - Duration::seconds(1) }, "{}", false, true)
            .unwrap();

        engine.tick().unwrap();

        assert!(engine.list_jobs().unwrap().iter().all(|j| j.id != job.id));
    }

    #[test]
    fn exhausted_job_without_delete_after_run_is_marked_completed() {
        let conn = open_memory();
        let mut engine = SchedulerEngine::new(conn, None).unwrap();
        let job = engine
            .add_job("one shot", Schedule::Once { at: Utc::now() - Duration::seconds(1) }, "{}")
            .unwrap();

        engine.tick().unwrap();

        let reloaded = engine.list_jobs().unwrap().into_iter().find(|j| j.id == job.id).unwrap();
        assert_eq!(reloaded.status, JobStatus::Completed);
        assert!(reloaded.next_run.is_none());
    }

    #[test]
    fn update_action_persists_mutable_state() {
        let handle = SchedulerHandle::new(open_memory()).unwrap();
        let job = handle
            .add_job_ex("system:memory_auto_integrate", Schedule::Interval { every_secs: 60 }, "{}", true, false)
            .unwrap();

        handle.update_action(&job.id, r#"{"event":"memory_auto_integrate","state":{"k":1}}"#).unwrap();

        let reloaded = handle.get_job(&job.id).unwrap().unwrap();
        assert!(reloaded.action.contains("\"k\":1"));
    }

    #[test]
    fn record_result_persists_status_and_clears_error_on_success() {
        let handle = SchedulerHandle::new(open_memory()).unwrap();
        let job = handle
            .add_job("reminder", Schedule::Interval { every_secs: 60 }, "{}")
            .unwrap();
        assert!(job.last_status.is_none());

        handle.record_result(&job.id, "error", Some("delivery unavailable")).unwrap();
        let reloaded = handle.get_job(&job.id).unwrap().unwrap();
        assert_eq!(reloaded.last_status.as_deref(), Some("error"));
        assert_eq!(reloaded.last_error.as_deref(), Some("delivery unavailable"));

        handle.record_result(&job.id, "ok", None).unwrap();
        let reloaded = handle.get_job(&job.id).unwrap().unwrap();
        assert_eq!(reloaded.last_status.as_deref(), Some("ok"));
        assert!(reloaded.last_error.is_none());
    }

    #[test]
    fn add_job_full_with_explicit_id_is_idempotent_for_seeding() {
        let handle = SchedulerHandle::new(open_memory()).unwrap();
        let first = handle
            .add_job_full(
                Some("system:memory_maintenance".to_string()),
                "system:memory_maintenance",
                Schedule::Interval { every_secs: 300 },
                "{}",
                true,
                false,
            )
            .unwrap();
        assert_eq!(first.id, "system:memory_maintenance");
        assert!(handle.get_job("system:memory_maintenance").unwrap().is_some());
    }
}
