use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};

/// Minimum interval between progress events for one run (10 per second).
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Window over which transfer speed is averaged.
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Typed engine-to-UI event stream. The engine owns the sender; UI adapters
/// subscribe to the receiver and never call into the engine directly.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    BackupStarted {
        run_id: String,
    },
    BackupProgress {
        run_id: String,
        bytes_done: u64,
        bytes_total: u64,
        files_done: u64,
        files_total: u64,
        current_path: Option<String>,
        speed_bps: u64,
        eta_seconds: Option<u64>,
    },
    BackupCompleted {
        run_id: String,
        files_total: u64,
        size_original: u64,
        size_stored: u64,
        duration_seconds: u64,
    },
    BackupFailed {
        run_id: String,
        kind: String,
        message: String,
    },
    RestoreStarted {
        run_id: String,
    },
    RestoreProgress {
        run_id: String,
        bytes_done: u64,
        files_done: u64,
        files_total: u64,
        current_path: Option<String>,
    },
    RestoreCompleted {
        run_id: String,
        files_restored: u64,
        files_failed: u64,
    },
    RestoreFailed {
        run_id: String,
        kind: String,
        message: String,
    },
    StorageConnected {
        destination_id: String,
    },
    StorageDisconnected {
        destination_id: String,
    },
    ConfigChanged {
        kind: String,
    },
    MissedRuns {
        schedule_id: String,
        occurrences: Vec<DateTime<Utc>>,
    },
}

/// Cloneable sending half of the event stream. A sender with no subscriber
/// drops events silently.
#[derive(Clone)]
pub struct EventSender {
    tx: Option<Sender<EngineEvent>>,
}

impl EventSender {
    pub fn channel() -> (EventSender, Receiver<EngineEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (EventSender { tx: Some(tx) }, rx)
    }

    /// A sender with no subscriber, for headless runs and tests.
    pub fn disconnected() -> EventSender {
        EventSender { tx: None }
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            // A closed channel means the subscriber went away; not an error.
            let _ = tx.send(event);
        }
    }
}

/// Tracks bytes/files processed for one run and emits throttled progress
/// events with a moving-average speed and ETA.
///
/// `bytes_done` is monotonic by construction, so emitted events are in
/// nondecreasing order.
pub struct ProgressTracker {
    run_id: String,
    bytes_total: u64,
    files_total: u64,
    bytes_done: u64,
    files_done: u64,
    samples: VecDeque<(Instant, u64)>,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(run_id: &str, bytes_total: u64, files_total: u64) -> Self {
        Self {
            run_id: run_id.to_string(),
            bytes_total,
            files_total,
            bytes_done: 0,
            files_done: 0,
            samples: VecDeque::new(),
            last_emit: None,
        }
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    pub fn add_bytes(&mut self, n: u64) {
        self.bytes_done += n;
    }

    pub fn file_done(&mut self) {
        self.files_done += 1;
    }

    /// Emit a progress event unless one was emitted within the throttle
    /// interval. `force` bypasses the throttle (used at run boundaries).
    pub fn maybe_emit(&mut self, events: &EventSender, current_path: Option<&str>, force: bool) {
        let now = Instant::now();
        if !force {
            if let Some(last) = self.last_emit {
                if now.duration_since(last) < PROGRESS_MIN_INTERVAL {
                    return;
                }
            }
        }
        self.last_emit = Some(now);

        self.samples.push_back((now, self.bytes_done));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > SPEED_WINDOW && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        let speed_bps = self.current_speed(now);
        let eta_seconds = if speed_bps > 0 && self.bytes_total >= self.bytes_done {
            Some((self.bytes_total - self.bytes_done) / speed_bps)
        } else {
            None
        };

        events.emit(EngineEvent::BackupProgress {
            run_id: self.run_id.clone(),
            bytes_done: self.bytes_done,
            bytes_total: self.bytes_total,
            files_done: self.files_done,
            files_total: self.files_total,
            current_path: current_path.map(|p| p.to_string()),
            speed_bps,
            eta_seconds,
        });
    }

    fn current_speed(&self, now: Instant) -> u64 {
        let (Some(&(t0, b0)), Some(&(_, b1))) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let elapsed = now.duration_since(t0).as_secs_f64();
        if elapsed < 0.05 {
            return 0;
        }
        ((b1.saturating_sub(b0)) as f64 / elapsed) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_sender_drops_events() {
        let events = EventSender::disconnected();
        events.emit(EngineEvent::ConfigChanged { kind: "policy".into() });
    }

    #[test]
    fn progress_is_throttled() {
        let (events, rx) = EventSender::channel();
        let mut tracker = ProgressTracker::new("run1", 1000, 10);

        for _ in 0..50 {
            tracker.add_bytes(10);
            tracker.maybe_emit(&events, Some("a.txt"), false);
        }

        // 50 rapid updates collapse into a single emission.
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn forced_emit_bypasses_throttle() {
        let (events, rx) = EventSender::channel();
        let mut tracker = ProgressTracker::new("run1", 100, 1);

        tracker.add_bytes(50);
        tracker.maybe_emit(&events, None, true);
        tracker.add_bytes(50);
        tracker.file_done();
        tracker.maybe_emit(&events, None, true);

        let collected: Vec<_> = rx.try_iter().collect();
        assert_eq!(collected.len(), 2);
        match &collected[1] {
            EngineEvent::BackupProgress {
                bytes_done,
                files_done,
                ..
            } => {
                assert_eq!(*bytes_done, 100);
                assert_eq!(*files_done, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn bytes_done_is_monotonic_across_emits() {
        let (events, rx) = EventSender::channel();
        let mut tracker = ProgressTracker::new("run1", 300, 3);

        for _ in 0..3 {
            tracker.add_bytes(100);
            tracker.maybe_emit(&events, None, true);
        }

        let mut last = 0;
        for event in rx.try_iter() {
            if let EngineEvent::BackupProgress { bytes_done, .. } = event {
                assert!(bytes_done >= last);
                last = bytes_done;
            }
        }
        assert_eq!(last, 300);
    }
}
