//! Wall-clock scheduling: when the next backup is due, which runs were
//! missed while the engine was down, and the worker that fires them.

mod worker;

pub use worker::{
    check_due, detect_missed, resolve_missed, BackupJob, MissedRun, MissedRunChoice,
    SchedulerWorker, SCHEDULER_TICK,
};

use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::config::{Frequency, ScheduleConfig};

/// Compute the next wall-clock fire time strictly after `from` (local
/// time). Startup/shutdown schedules have no wall-clock next run; the host
/// triggers those explicitly.
pub fn next_run(config: &ScheduleConfig, from: NaiveDateTime) -> Option<NaiveDateTime> {
    match config.frequency {
        Frequency::Daily => {
            let time = config.time_of_day?;
            let mut candidate = from.date().and_time(time);
            if candidate <= from {
                candidate += Duration::days(1);
            }
            Some(candidate)
        }
        Frequency::Weekly => {
            let time = config.time_of_day?;
            if config.weekdays.is_empty() {
                return None;
            }
            // Today counts when its time has not passed yet.
            for ahead in 0..=7 {
                let date = from.date() + Duration::days(ahead);
                let weekday = date.weekday().number_from_monday() as u8;
                if config.weekdays.contains(&weekday) {
                    let candidate = date.and_time(time);
                    if candidate > from {
                        return Some(candidate);
                    }
                }
            }
            None
        }
        Frequency::Monthly => {
            let time = config.time_of_day?;
            let day = config.day_of_month?;

            let this_month = clamped_date(from.year(), from.month(), day).and_time(time);
            if this_month > from {
                return Some(this_month);
            }
            let (year, month) = if from.month() == 12 {
                (from.year() + 1, 1)
            } else {
                (from.year(), from.month() + 1)
            };
            Some(clamped_date(year, month, day).and_time(time))
        }
        Frequency::Startup | Frequency::Shutdown => None,
    }
}

/// The requested day of month, clamped to the month's last day
/// (31 in February becomes the 28th or 29th).
fn clamped_date(year: i32, month: u32, day: u32) -> NaiveDate {
    let last = last_day_of_month(year, month);
    NaiveDate::from_ymd_opt(year, month, day.min(last))
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, 1).expect("month start exists"))
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let first_of_next =
        NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("month start exists");
    (first_of_next - Duration::days(1)).day()
}

/// Convert a local wall-clock time to UTC for storage; skipped or ambiguous
/// DST instants resolve to the earliest valid mapping.
pub(crate) fn local_to_utc(naive: NaiveDateTime) -> Option<chrono::DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn utc_to_local(at: chrono::DateTime<Utc>) -> NaiveDateTime {
    at.with_timezone(&Local).naive_local()
}
