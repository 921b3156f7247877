//! Synchronous command surface the UI shell calls into, plus the scheduler
//! glue that feeds queued jobs through the same paths.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use chrono::Utc;
use crossbeam_channel::Receiver;
use tracing::{error, info};

use crate::catalog::{Catalog, SearchHit, Statistics};
use crate::config::{DestinationConfig, ScheduleConfig, ScratConfig, SourceConfig};
use crate::destination::destination_from_config;
use crate::engine::{self, BackupOutcome, BackupRequest, CancelToken, RequestedKind};
use crate::error::{Result, ScratError};
use crate::events::{EngineEvent, EventSender};
use crate::restore::{self, RestoreOutcome, RestorePoint, RestoreRequest};
use crate::schedule::{self, BackupJob, SchedulerWorker, SCHEDULER_TICK};

/// Engine facade: owns the catalog, the event stream, and the
/// one-run-at-a-time cancellation slot.
pub struct Ops {
    catalog: Arc<Mutex<Catalog>>,
    config: ScratConfig,
    events: EventSender,
    current_run: Arc<Mutex<Option<CancelToken>>>,
}

impl Ops {
    /// Open the engine against its catalog. Returns the receiving half of
    /// the event stream for the UI.
    pub fn open(config: ScratConfig) -> Result<(Ops, Receiver<EngineEvent>)> {
        config.validate()?;
        let catalog = Catalog::open(Path::new(&config.catalog_path))?;
        let (events, event_rx) = EventSender::channel();
        Ok((
            Ops {
                catalog: Arc::new(Mutex::new(catalog)),
                config,
                events,
                current_run: Arc::new(Mutex::new(None)),
            },
            event_rx,
        ))
    }

    fn lock_catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spool_dir(&self) -> Option<PathBuf> {
        self.config.spool_dir.as_ref().map(PathBuf::from)
    }

    pub fn start_backup(
        &self,
        destination_id: &str,
        kind: RequestedKind,
        passphrase: &str,
        sources: Option<Vec<String>>,
    ) -> Result<BackupOutcome> {
        let request = BackupRequest {
            destination_id: destination_id.to_string(),
            kind,
            passphrase: passphrase.to_string(),
            sources,
        };
        run_with_cancel_slot(
            &self.catalog,
            &self.config.policy,
            self.spool_dir(),
            &self.events,
            &self.current_run,
            &request,
        )
    }

    /// Cancel the running backup, if any. Takes effect at the next file
    /// boundary.
    pub fn cancel_backup(&self) -> bool {
        let slot = self.current_run.lock().unwrap_or_else(|p| p.into_inner());
        match &*slot {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn list_restorable_points(&self, destination_id: &str) -> Result<Vec<RestorePoint>> {
        let catalog = self.lock_catalog();
        restore::list_restorable_points(&catalog, destination_id)
    }

    pub fn restore(&self, request: &RestoreRequest) -> Result<RestoreOutcome> {
        let catalog = self.lock_catalog();
        restore::run_restore(&catalog, &self.config.policy, request, &self.events)
    }

    pub fn install_schedule(&self, schedule: &ScheduleConfig) -> Result<()> {
        let catalog = self.lock_catalog();
        if catalog.destination(&schedule.destination_id)?.is_none() {
            return Err(ScratError::Validation(format!(
                "schedule references unknown destination '{}'",
                schedule.destination_id
            )));
        }
        for name in &schedule.sources {
            if catalog.source(name)?.is_none() {
                return Err(ScratError::Validation(format!(
                    "schedule references unknown source '{name}'"
                )));
            }
        }
        catalog.install_schedule(schedule)?;
        drop(catalog);
        self.events.emit(EngineEvent::ConfigChanged {
            kind: "schedule".into(),
        });
        Ok(())
    }

    pub fn remove_schedule(&self, id: &str) -> Result<bool> {
        let removed = self.lock_catalog().remove_schedule(id)?;
        if removed {
            self.events.emit(EngineEvent::ConfigChanged {
                kind: "schedule".into(),
            });
        }
        Ok(removed)
    }

    /// Fire every due schedule immediately and run the queued jobs to
    /// completion, one after another.
    pub fn trigger_due_schedules_now(&self, passphrase: &str) -> Result<usize> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let fired = {
            let catalog = self.lock_catalog();
            schedule::check_due(&catalog, &job_tx, Utc::now())?
        };
        drop(job_tx);

        for job in job_rx.try_iter() {
            self.start_backup(
                &job.destination_id,
                RequestedKind::Auto,
                passphrase,
                Some(job.sources),
            )?;
        }
        Ok(fired)
    }

    /// Run every enabled schedule bound to an OS lifecycle hook. The host's
    /// autostart / session glue invokes this explicitly; the scheduler never
    /// hooks the OS itself.
    pub fn trigger_lifecycle_schedules(
        &self,
        frequency: crate::config::Frequency,
        passphrase: &str,
    ) -> Result<usize> {
        if frequency.is_wall_clock() {
            return Err(ScratError::Validation(
                "lifecycle trigger only applies to startup/shutdown schedules".into(),
            ));
        }

        let jobs: Vec<BackupJob> = self
            .lock_catalog()
            .schedules()?
            .into_iter()
            .filter(|row| row.config.enabled && row.config.frequency == frequency)
            .map(|row| BackupJob {
                schedule_id: row.config.id.clone(),
                destination_id: row.config.destination_id.clone(),
                sources: row.config.sources.clone(),
            })
            .collect();

        let fired = jobs.len();
        for job in jobs {
            info!(schedule = %job.schedule_id, hook = frequency.as_str(), "running lifecycle backup");
            self.start_backup(
                &job.destination_id,
                RequestedKind::Auto,
                passphrase,
                Some(job.sources),
            )?;
            self.lock_catalog()
                .update_schedule_runs(&job.schedule_id, Some(Utc::now()), None)?;
        }
        Ok(fired)
    }

    pub fn test_destination(&self, destination_id: &str) -> Result<()> {
        let dest_config = self
            .lock_catalog()
            .destination(destination_id)?
            .ok_or_else(|| {
                ScratError::Validation(format!("unknown destination '{destination_id}'"))
            })?;
        let mut dest = destination_from_config(&dest_config)?;
        dest.test()?;
        self.lock_catalog()
            .touch_destination_connected(destination_id)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Registry passthrough for the configuration surface
    // -----------------------------------------------------------------

    pub fn add_source(&self, source: &SourceConfig) -> Result<()> {
        self.lock_catalog().upsert_source(source)?;
        self.events.emit(EngineEvent::ConfigChanged {
            kind: "source".into(),
        });
        Ok(())
    }

    pub fn remove_source(&self, name: &str) -> Result<bool> {
        self.lock_catalog().remove_source(name)
    }

    pub fn sources(&self) -> Result<Vec<SourceConfig>> {
        self.lock_catalog().sources()
    }

    pub fn add_destination(&self, destination: &DestinationConfig) -> Result<()> {
        self.lock_catalog().upsert_destination(destination)?;
        self.events.emit(EngineEvent::ConfigChanged {
            kind: "destination".into(),
        });
        Ok(())
    }

    pub fn remove_destination(&self, id: &str) -> Result<bool> {
        self.lock_catalog().remove_destination(id)
    }

    pub fn destinations(&self) -> Result<Vec<DestinationConfig>> {
        self.lock_catalog().destinations()
    }

    pub fn schedules(&self) -> Result<Vec<crate::catalog::ScheduleRow>> {
        self.lock_catalog().schedules()
    }

    pub fn statistics(&self) -> Result<Statistics> {
        self.lock_catalog().statistics()
    }

    pub fn search_files(&self, pattern: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.lock_catalog().search_files(pattern, limit)
    }

    /// Start the background scheduler. Jobs run sequentially on a worker
    /// thread using the given passphrase.
    pub fn start_scheduler(&self, passphrase: String) -> SchedulerHandle {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<BackupJob>();
        let worker = SchedulerWorker::start(
            Arc::clone(&self.catalog),
            self.events.clone(),
            job_tx,
            SCHEDULER_TICK,
        );

        let catalog = Arc::clone(&self.catalog);
        let policy = self.config.policy.clone();
        let spool_dir = self.spool_dir();
        let events = self.events.clone();
        let current_run = Arc::clone(&self.current_run);

        let executor = std::thread::spawn(move || {
            for job in job_rx.iter() {
                info!(schedule = %job.schedule_id, "running scheduled backup");
                let request = BackupRequest {
                    destination_id: job.destination_id.clone(),
                    kind: RequestedKind::Auto,
                    passphrase: passphrase.clone(),
                    sources: Some(job.sources.clone()),
                };
                let result = run_with_cancel_slot(
                    &catalog,
                    &policy,
                    spool_dir.clone(),
                    &events,
                    &current_run,
                    &request,
                );
                if let Err(e) = result {
                    error!(
                        schedule = %job.schedule_id,
                        error = %e,
                        "scheduled backup failed"
                    );
                }
            }
        });

        SchedulerHandle {
            worker: Some(worker),
            executor: Some(executor),
        }
    }
}

fn run_with_cancel_slot(
    catalog: &Arc<Mutex<Catalog>>,
    policy: &crate::config::BackupPolicy,
    spool_dir: Option<PathBuf>,
    events: &EventSender,
    current_run: &Arc<Mutex<Option<CancelToken>>>,
    request: &BackupRequest,
) -> Result<BackupOutcome> {
    let token = CancelToken::new();
    {
        let mut slot = current_run.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(token.clone());
    }

    let result = {
        let mut guard = catalog.lock().unwrap_or_else(|p| p.into_inner());
        engine::run(
            &mut guard,
            policy,
            spool_dir.as_deref(),
            request,
            events,
            &token,
        )
    };

    {
        let mut slot = current_run.lock().unwrap_or_else(|p| p.into_inner());
        *slot = None;
    }
    result
}

/// Running scheduler: the tick worker plus the sequential job executor.
/// The UI shell holds this to pause, resume, or stop scheduling; stopping
/// joins both threads.
pub struct SchedulerHandle {
    worker: Option<SchedulerWorker>,
    executor: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Hold fire on due schedules without tearing the worker down. A job
    /// already queued still runs to completion.
    pub fn pause(&self) {
        if let Some(worker) = &self.worker {
            worker.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(worker) = &self.worker {
            worker.resume();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_paused())
    }

    pub fn stop(mut self) {
        if let Some(worker) = self.worker.take() {
            // Dropping the worker's job sender ends the executor loop.
            worker.stop();
        }
        if let Some(executor) = self.executor.take() {
            let _ = executor.join();
        }
    }
}

/// Process exit code for a command result.
pub fn exit_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => match e.kind_name() {
            "validation_error" => 2,
            "passphrase_error" => 3,
            "destination_error" => 4,
            "io_error" => 5,
            "cancelled" => 6,
            _ => 70,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_the_taxonomy() {
        assert_eq!(exit_code(&Ok(())), 0);
        assert_eq!(exit_code::<()>(&Err(ScratError::Validation("x".into()))), 2);
        assert_eq!(exit_code::<()>(&Err(ScratError::Passphrase)), 3);
        assert_eq!(exit_code::<()>(&Err(ScratError::Destination("x".into()))), 4);
        assert_eq!(exit_code::<()>(&Err(ScratError::TransientIo("x".into()))), 5);
        assert_eq!(exit_code::<()>(&Err(ScratError::Cancelled)), 6);
        assert_eq!(exit_code::<()>(&Err(ScratError::Internal("x".into()))), 70);
    }

    #[test]
    fn scheduler_handle_forwards_pause_state() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ScratConfig {
            catalog_path: tmp.path().join("catalog.db").display().to_string(),
            policy: Default::default(),
            spool_dir: None,
        };
        let (ops, _events) = Ops::open(config).unwrap();

        let handle = ops.start_scheduler("correct-horse-battery-staple".into());
        assert!(!handle.is_paused());
        handle.pause();
        assert!(handle.is_paused());
        handle.resume();
        assert!(!handle.is_paused());
        handle.stop();
    }
}
