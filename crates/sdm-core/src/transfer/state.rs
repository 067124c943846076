//! Shared state for one engine run: table, counters, speed, notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::part_file::PartFile;
use crate::retry::RetryPolicy;
use crate::sidecar::{SidecarRecord, SidecarStore};
use crate::speed::SpeedWindow;
use crate::transfer::control::TransferControl;
use crate::transfer::table::SegmentTable;

/// Live progress as shown to subscribers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub speed_bps: f64,
    pub active_workers: usize,
}

/// Events the engine pushes toward the orchestrator.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Metadata resolved; transfer is starting.
    Started {
        filename: String,
        total_bytes: u64,
        content_type: Option<String>,
        /// False means pause would lose progress; the queue rejects it.
        accepts_ranges: bool,
    },
    Progress(ProgressSnapshot),
}

pub type EngineSink = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Rate-limits progress emission to one event per interval per job.
/// Status changes bypass the limit via `emit_now`.
pub struct ProgressNotifier {
    sink: EngineSink,
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ProgressNotifier {
    pub fn new(sink: EngineSink, min_interval: Duration) -> Self {
        Self {
            sink,
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Throttled emit; `build` runs only when the event will be sent.
    pub fn maybe_emit<F>(&self, build: F)
    where
        F: FnOnce() -> ProgressSnapshot,
    {
        {
            let mut last = self.last.lock().unwrap();
            match *last {
                Some(at) if at.elapsed() < self.min_interval => return,
                _ => *last = Some(Instant::now()),
            }
        }
        (self.sink)(EngineEvent::Progress(build()));
    }

    /// Unthrottled emit for status changes.
    pub fn emit_now(&self, event: EngineEvent) {
        *self.last.lock().unwrap() = Some(Instant::now());
        (self.sink)(event);
    }
}

/// Everything a worker thread needs, behind one `Arc`.
pub(super) struct SharedTransfer {
    pub url: String,
    /// Total size in bytes; 0 when unknown.
    pub total: u64,
    /// Issue Range requests. Cleared when the engine falls back to
    /// single-stream mode.
    pub ranged: AtomicBool,
    /// Set by a worker that received 200 where 206 was required; the engine
    /// restarts in single-stream mode.
    pub switch_single: AtomicBool,
    pub control: Arc<TransferControl>,
    pub table: Mutex<SegmentTable>,
    pub received: AtomicU64,
    pub speed: Mutex<SpeedWindow>,
    /// Bytes per worker since the last adaptive tick, drained by the
    /// controller.
    pub worker_bytes: Mutex<HashMap<usize, u64>>,
    pub active_workers: AtomicUsize,
    pub part: PartFile,
    pub sidecar: SidecarStore,
    pub notifier: ProgressNotifier,
    pub retry: RetryPolicy,
    pub content_type: String,
}

impl SharedTransfer {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            received_bytes: self.received.load(Ordering::Relaxed),
            total_bytes: self.total,
            speed_bps: self.speed.lock().unwrap().bytes_per_sec(),
            active_workers: self.active_workers.load(Ordering::Relaxed),
        }
    }

    pub fn sidecar_record(&self) -> SidecarRecord {
        SidecarRecord::new(
            &self.url,
            self.total,
            &self.content_type,
            self.table.lock().unwrap().snapshot(),
        )
    }

    /// Account for `n` bytes landed by `worker_id`: job total, speed window,
    /// and the controller's per-worker tick counter.
    pub fn record_bytes(&self, worker_id: usize, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
        self.speed.lock().unwrap().record(n);
        *self
            .worker_bytes
            .lock()
            .unwrap()
            .entry(worker_id)
            .or_insert(0) += n;
    }

    /// Persist current segment state (throttled) and emit progress
    /// (throttled). Called once per chunk.
    pub fn after_chunk(&self) {
        self.sidecar.maybe_write_with(|| self.sidecar_record());
        self.notifier.maybe_emit(|| self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    #[test]
    fn notifier_throttles_but_forced_emits_pass() {
        let emitted = Arc::new(Counter::new(0));
        let sink: EngineSink = {
            let emitted = Arc::clone(&emitted);
            Arc::new(move |_| {
                emitted.fetch_add(1, Ordering::Relaxed);
            })
        };
        let n = ProgressNotifier::new(sink, Duration::from_secs(60));
        let snap = || ProgressSnapshot {
            received_bytes: 0,
            total_bytes: 0,
            speed_bps: 0.0,
            active_workers: 1,
        };
        n.maybe_emit(snap);
        n.maybe_emit(snap);
        n.maybe_emit(snap);
        assert_eq!(emitted.load(Ordering::Relaxed), 1);

        n.emit_now(EngineEvent::Progress(snap()));
        assert_eq!(emitted.load(Ordering::Relaxed), 2);
    }
}
