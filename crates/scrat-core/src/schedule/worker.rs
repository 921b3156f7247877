use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use tracing::{info, warn};

use super::{local_to_utc, next_run, utc_to_local};
use crate::catalog::{Catalog, ScheduleRow};
use crate::error::Result;
use crate::events::{EngineEvent, EventSender};

/// Wake-up period of the scheduler worker.
pub const SCHEDULER_TICK: Duration = Duration::from_secs(60);

/// Upper bound on enumerated missed occurrences per schedule.
const MISSED_RUN_CAP: usize = 100;

/// A backup run queued by the scheduler. Jobs execute sequentially; a
/// schedule firing while another job runs waits behind it.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub schedule_id: String,
    pub destination_id: String,
    pub sources: Vec<String>,
}

fn job_for(row: &ScheduleRow) -> BackupJob {
    BackupJob {
        schedule_id: row.config.id.clone(),
        destination_id: row.config.destination_id.clone(),
        sources: row.config.sources.clone(),
    }
}

/// Runs a schedule missed while the engine was offline, reported to the UI
/// for a run-now / run-latest-only / skip decision.
#[derive(Debug, Clone)]
pub struct MissedRun {
    pub schedule_id: String,
    pub occurrences: Vec<DateTime<Utc>>,
    pub job: BackupJob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissedRunChoice {
    /// One run per missed occurrence.
    RunNow,
    /// A single catch-up run.
    RunLatestOnly,
    Skip,
}

/// Fire every due schedule (ordered by `next_run`) and advance their
/// bookkeeping. Firing is idempotent: once `next_run` moves forward, an
/// immediately repeated check queues nothing.
pub fn check_due(
    catalog: &Catalog,
    job_tx: &Sender<BackupJob>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut due: Vec<(DateTime<Utc>, ScheduleRow)> = Vec::new();

    for row in catalog.schedules()? {
        if !row.config.enabled || !row.config.frequency.is_wall_clock() {
            continue;
        }
        match row.next_run {
            Some(at) if at <= now => due.push((at, row)),
            Some(_) => {}
            None => {
                // Freshly installed: initialize without firing.
                let upcoming =
                    next_run(&row.config, utc_to_local(now)).and_then(local_to_utc);
                catalog.update_schedule_runs(&row.config.id, None, upcoming)?;
            }
        }
    }

    due.sort_by(|a, b| a.0.cmp(&b.0));

    let mut fired = 0;
    for (_, row) in due {
        if job_tx.send(job_for(&row)).is_err() {
            warn!("job queue closed; scheduler cannot fire");
            break;
        }
        let upcoming = next_run(&row.config, utc_to_local(now)).and_then(local_to_utc);
        catalog.update_schedule_runs(&row.config.id, Some(now), upcoming)?;
        info!(
            schedule = %row.config.id,
            next_run = ?upcoming,
            "schedule fired"
        );
        fired += 1;
    }
    Ok(fired)
}

/// On worker start: every schedule whose `next_run` lies in the past was
/// missed. Reported through the event stream; `next_run` is recomputed
/// forward from the present regardless of how the user answers.
pub fn detect_missed(
    catalog: &Catalog,
    events: &EventSender,
    now: DateTime<Utc>,
) -> Result<Vec<MissedRun>> {
    let mut missed = Vec::new();

    for row in catalog.schedules()? {
        if !row.config.enabled || !row.config.frequency.is_wall_clock() {
            continue;
        }
        let Some(first) = row.next_run.filter(|at| *at < now) else {
            continue;
        };

        let mut occurrences = vec![first];
        let mut cursor = first;
        while occurrences.len() < MISSED_RUN_CAP {
            match next_run(&row.config, utc_to_local(cursor)).and_then(local_to_utc) {
                Some(next) if next < now => {
                    occurrences.push(next);
                    cursor = next;
                }
                _ => break,
            }
        }

        let upcoming = next_run(&row.config, utc_to_local(now)).and_then(local_to_utc);
        catalog.update_schedule_runs(&row.config.id, None, upcoming)?;

        events.emit(EngineEvent::MissedRuns {
            schedule_id: row.config.id.clone(),
            occurrences: occurrences.clone(),
        });
        warn!(
            schedule = %row.config.id,
            missed = occurrences.len(),
            next_run = ?upcoming,
            "missed scheduled runs detected"
        );

        missed.push(MissedRun {
            schedule_id: row.config.id.clone(),
            occurrences,
            job: job_for(&row),
        });
    }
    Ok(missed)
}

/// Apply the user's decision for a missed run. Returns how many jobs were
/// queued.
pub fn resolve_missed(
    job_tx: &Sender<BackupJob>,
    missed: &MissedRun,
    choice: MissedRunChoice,
) -> usize {
    let count = match choice {
        MissedRunChoice::Skip => 0,
        MissedRunChoice::RunLatestOnly => 1,
        MissedRunChoice::RunNow => missed.occurrences.len(),
    };
    let mut queued = 0;
    for _ in 0..count {
        if job_tx.send(missed.job.clone()).is_err() {
            break;
        }
        queued += 1;
    }
    queued
}

/// Single-threaded scheduler worker: detects missed runs on start, then
/// wakes every tick and fires due schedules into the job queue.
pub struct SchedulerWorker {
    shutdown: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerWorker {
    pub fn start(
        catalog: Arc<Mutex<Catalog>>,
        events: EventSender,
        job_tx: Sender<BackupJob>,
        tick: Duration,
    ) -> SchedulerWorker {
        let shutdown = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));

        let worker_shutdown = Arc::clone(&shutdown);
        let worker_paused = Arc::clone(&paused);
        let handle = std::thread::spawn(move || {
            {
                let catalog = catalog.lock().unwrap_or_else(|p| p.into_inner());
                if let Err(e) = detect_missed(&catalog, &events, Utc::now()) {
                    warn!(error = %e, "missed-run detection failed");
                }
            }

            while !worker_shutdown.load(Ordering::SeqCst) {
                if !worker_paused.load(Ordering::SeqCst) {
                    let catalog = catalog.lock().unwrap_or_else(|p| p.into_inner());
                    if let Err(e) = check_due(&catalog, &job_tx, Utc::now()) {
                        warn!(error = %e, "schedule check failed");
                    }
                }

                let mut slept = Duration::ZERO;
                while slept < tick && !worker_shutdown.load(Ordering::SeqCst) {
                    let step = Duration::from_millis(200).min(tick - slept);
                    std::thread::sleep(step);
                    slept += step;
                }
            }
            info!("scheduler worker stopped");
        });

        SchedulerWorker {
            shutdown,
            paused,
            handle: Some(handle),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SchedulerWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
