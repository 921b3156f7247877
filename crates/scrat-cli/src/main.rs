mod cli;
mod passphrase;
mod signal;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;

use scrat_core::config::{self, DestinationConfig, DestinationKind, ScheduleConfig, ScratConfig, SourceConfig};
use scrat_core::engine::RequestedKind;
use scrat_core::error::{Result, ScratError};
use scrat_core::events::EngineEvent;
use scrat_core::ops::{exit_code, Ops};
use scrat_core::restore::RestoreRequest;

use crate::cli::{Cli, Commands, DestinationCmd, KindArg, ScheduleCmd, SourceCmd};
use crate::signal::SHUTDOWN;

fn main() {
    let args = Cli::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    signal::install_signal_handlers();

    // `config` needs no existing configuration file.
    if let Commands::Config { dest } = &args.command {
        let path = dest.clone().unwrap_or_else(|| PathBuf::from("scrat.json"));
        if let Err(e) = generate_config(&path) {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
        println!("Wrote starter configuration to {}", path.display());
        return;
    }

    let config_path = resolve_config_path(args.config.clone());
    let config = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Run `scrat config` to generate a starter config file.");
            std::process::exit(2);
        }
    };

    let (ops, event_rx) = match Ops::open(config) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    let printer = std::thread::spawn(move || {
        for event in event_rx.iter() {
            print_event(&event);
        }
    });

    let result = dispatch(&ops, args.command);
    let code = exit_code(&result);
    if let Err(e) = &result {
        eprintln!("Error: {e}");
    }

    drop(ops); // closes the event stream, ends the printer
    let _ = printer.join();
    std::process::exit(code);
}

fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Ok(env_path) = std::env::var("SCRAT_CONFIG") {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }
    PathBuf::from("scrat.json")
}

fn generate_config(path: &std::path::Path) -> Result<()> {
    let starter = ScratConfig {
        catalog_path: "scrat.db".into(),
        policy: Default::default(),
        spool_dir: None,
    };
    config::save(&starter, path)
}

fn dispatch(ops: &Ops, command: Commands) -> Result<()> {
    match command {
        Commands::Backup {
            destination,
            kind,
            source,
        } => {
            let pass = passphrase::get_passphrase()
                .map_err(|e| ScratError::Validation(format!("passphrase: {e}")))?;
            let kind = match kind {
                KindArg::Auto => RequestedKind::Auto,
                KindArg::Full => RequestedKind::Full,
                KindArg::Incremental => RequestedKind::Incremental,
            };
            let sources = if source.is_empty() { None } else { Some(source) };

            // Bridge Ctrl-C to engine cancellation while the run is active.
            let done = AtomicBool::new(false);
            let outcome = std::thread::scope(|scope| {
                scope.spawn(|| {
                    while !done.load(Ordering::SeqCst) {
                        if SHUTDOWN.load(Ordering::SeqCst) {
                            ops.cancel_backup();
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(200));
                    }
                });
                let result = ops.start_backup(&destination, kind, &pass, sources);
                done.store(true, Ordering::SeqCst);
                result
            })?;

            println!(
                "Backup {} completed: {} files, {} bytes original, {} bytes stored, {}s",
                outcome.backup_id,
                outcome.stats.files_total,
                outcome.stats.size_original,
                outcome.stats.size_stored,
                outcome.duration_seconds
            );
            if !outcome.skipped.is_empty() {
                println!("Skipped {} unreadable files:", outcome.skipped.len());
                for skip in &outcome.skipped {
                    println!("  {}: {}", skip.path, skip.message);
                }
            }
            Ok(())
        }

        Commands::List { destination } => {
            let points = ops.list_restorable_points(&destination)?;
            if points.is_empty() {
                println!("No restorable backups on '{destination}'.");
            }
            for point in points {
                println!(
                    "{}  {}  {}",
                    point.backup_id,
                    point.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                    point.kind.as_str()
                );
            }
            Ok(())
        }

        Commands::Restore {
            destination,
            at,
            target,
            path,
        } => {
            let pass = passphrase::get_passphrase()
                .map_err(|e| ScratError::Validation(format!("passphrase: {e}")))?;
            let at = resolve_point(ops, &destination, &at)?;
            let selection: Option<HashSet<String>> = if path.is_empty() {
                None
            } else {
                Some(path.into_iter().collect())
            };

            let outcome = ops.restore(&RestoreRequest {
                destination_id: destination,
                at,
                passphrase: pass.as_str().to_owned(),
                selection,
                target_dir: target,
            })?;

            println!(
                "Restored {} files ({} bytes).",
                outcome.files_restored, outcome.bytes_restored
            );
            if !outcome.failed.is_empty() {
                println!("{} files could not be restored:", outcome.failed.len());
                for failed in &outcome.failed {
                    println!(
                        "  {} (segment {}): {}",
                        failed.relative_path, failed.archive_name, failed.message
                    );
                }
                return Err(ScratError::Integrity(format!(
                    "{} files failed verification",
                    outcome.failed.len()
                )));
            }
            Ok(())
        }

        Commands::Find { pattern, limit } => {
            for hit in ops.search_files(&pattern, limit)? {
                println!(
                    "{}  {}  {}/{} ({} bytes)",
                    hit.backup_id,
                    hit.backup_timestamp.format("%Y-%m-%d %H:%M"),
                    hit.source_root,
                    hit.relative_path,
                    hit.logical_size
                );
            }
            Ok(())
        }

        Commands::Status => {
            let stats = ops.statistics()?;
            println!("Backups:   {} total, {} completed", stats.total_backups, stats.completed_backups);
            println!("Files:     {}", stats.total_files);
            println!("Original:  {} bytes", stats.size_original);
            println!("Stored:    {} bytes", stats.size_stored);
            Ok(())
        }

        Commands::TestDestination { id } => {
            ops.test_destination(&id)?;
            println!("Destination '{id}' is reachable and writable.");
            Ok(())
        }

        Commands::Source { command } => match command {
            SourceCmd::Add {
                name,
                root_path,
                exclude,
            } => {
                ops.add_source(&SourceConfig {
                    name: name.clone(),
                    root_path: root_path.display().to_string(),
                    enabled: true,
                    exclude_patterns: exclude,
                })?;
                println!("Source '{name}' saved.");
                Ok(())
            }
            SourceCmd::Remove { name } => {
                if ops.remove_source(&name)? {
                    println!("Source '{name}' removed.");
                } else {
                    println!("No source named '{name}'.");
                }
                Ok(())
            }
            SourceCmd::List => {
                for source in ops.sources()? {
                    let state = if source.enabled { "enabled" } else { "disabled" };
                    println!("{}  {}  ({state})", source.name, source.root_path);
                }
                Ok(())
            }
        },

        Commands::Destination { command } => match command {
            DestinationCmd::AddLocal { id, root_path } => {
                ops.add_destination(&DestinationConfig {
                    id: id.clone(),
                    kind: DestinationKind::Local {
                        root_path: root_path.display().to_string(),
                    },
                    enabled: true,
                })?;
                println!("Destination '{id}' saved.");
                Ok(())
            }
            DestinationCmd::AddJson { json } => {
                let destination: DestinationConfig = serde_json::from_str(&json)
                    .map_err(|e| ScratError::Validation(format!("invalid destination JSON: {e}")))?;
                let id = destination.id.clone();
                ops.add_destination(&destination)?;
                println!("Destination '{id}' saved.");
                Ok(())
            }
            DestinationCmd::Remove { id } => {
                if ops.remove_destination(&id)? {
                    println!("Destination '{id}' removed.");
                } else {
                    println!("No destination with id '{id}'.");
                }
                Ok(())
            }
            DestinationCmd::List => {
                for destination in ops.destinations()? {
                    let state = if destination.enabled { "enabled" } else { "disabled" };
                    println!("{}  {}  ({state})", destination.id, destination.kind.name());
                }
                Ok(())
            }
        },

        Commands::Schedule { command } => match command {
            ScheduleCmd::Install { json } => {
                let schedule: ScheduleConfig = serde_json::from_str(&json)
                    .map_err(|e| ScratError::Validation(format!("invalid schedule JSON: {e}")))?;
                let id = schedule.id.clone();
                ops.install_schedule(&schedule)?;
                println!("Schedule '{id}' installed.");
                Ok(())
            }
            ScheduleCmd::Remove { id } => {
                if ops.remove_schedule(&id)? {
                    println!("Schedule '{id}' removed.");
                } else {
                    println!("No schedule with id '{id}'.");
                }
                Ok(())
            }
            ScheduleCmd::List => {
                for row in ops.schedules()? {
                    let state = if row.config.enabled { "enabled" } else { "disabled" };
                    let next = row
                        .next_run
                        .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
                        .unwrap_or_else(|| "-".into());
                    println!(
                        "{}  {}  next: {next}  ({state})",
                        row.config.id,
                        row.config.frequency.as_str()
                    );
                }
                Ok(())
            }
        },

        Commands::RunDue => {
            let pass = passphrase::get_passphrase()
                .map_err(|e| ScratError::Validation(format!("passphrase: {e}")))?;
            let fired = ops.trigger_due_schedules_now(&pass)?;
            println!("Fired {fired} due schedule(s).");
            Ok(())
        }

        Commands::RunHook { phase } => {
            let pass = passphrase::get_passphrase()
                .map_err(|e| ScratError::Validation(format!("passphrase: {e}")))?;
            let frequency = match phase {
                cli::HookPhase::Startup => scrat_core::config::Frequency::Startup,
                cli::HookPhase::Shutdown => scrat_core::config::Frequency::Shutdown,
            };
            let fired = ops.trigger_lifecycle_schedules(frequency, &pass)?;
            println!("Ran {fired} {} schedule(s).", frequency.as_str());
            Ok(())
        }

        Commands::Daemon => {
            let pass = passphrase::get_passphrase()
                .map_err(|e| ScratError::Validation(format!("passphrase: {e}")))?;
            tracing::info!("scheduler running; Ctrl-C to stop");
            let handle = ops.start_scheduler(pass.as_str().to_owned());
            while !SHUTDOWN.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
            tracing::info!("shutdown signal received");
            handle.stop();
            Ok(())
        }

        Commands::Config { .. } => unreachable!("handled before catalog open"),
    }
}

/// Resolve a `--at` argument: "latest", an exact backup id, or RFC3339.
fn resolve_point(ops: &Ops, destination: &str, raw: &str) -> Result<DateTime<Utc>> {
    if raw.eq_ignore_ascii_case("latest") {
        return Ok(Utc::now());
    }
    if let Some(point) = ops
        .list_restorable_points(destination)?
        .into_iter()
        .find(|p| p.backup_id == raw)
    {
        return Ok(point.timestamp);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            ScratError::Validation(format!(
                "'{raw}' is neither a backup id on '{destination}' nor an RFC3339 timestamp"
            ))
        })
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::BackupProgress {
            bytes_done,
            bytes_total,
            files_done,
            files_total,
            speed_bps,
            eta_seconds,
            ..
        } => {
            let eta = eta_seconds
                .map(|s| format!("{s}s left"))
                .unwrap_or_else(|| "--".into());
            eprintln!(
                "  {files_done}/{files_total} files, {bytes_done}/{bytes_total} bytes, {} MiB/s, {eta}",
                speed_bps / (1024 * 1024)
            );
        }
        EngineEvent::BackupFailed { run_id, kind, message } => {
            eprintln!("Backup {run_id} failed ({kind}): {message}");
        }
        EngineEvent::MissedRuns {
            schedule_id,
            occurrences,
        } => {
            eprintln!(
                "Schedule '{schedule_id}' missed {} run(s); next run recomputed.",
                occurrences.len()
            );
        }
        EngineEvent::RestoreProgress {
            files_done,
            files_total,
            bytes_done,
            ..
        } => {
            eprintln!("  restored {files_done}/{files_total} files, {bytes_done} bytes");
        }
        _ => {}
    }
}
