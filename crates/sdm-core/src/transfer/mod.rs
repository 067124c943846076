//! Per-job transfer engine.
//!
//! `run` drives one job from probe to terminal state: HEAD probe, segment
//! planning (with sidecar resume), part-file preallocation, worker spawn,
//! adaptive control, and finalization. It blocks until the job is terminal
//! or paused; the orchestrator calls it on a blocking task and forwards the
//! engine's events to subscribers.

mod control;
mod state;
mod table;
mod worker;

pub use control::TransferControl;
pub use state::{EngineEvent, EngineSink, ProgressNotifier, ProgressSnapshot};
pub use table::{SegmentSlot, SegmentTable, SlotState};

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use crate::adaptive::{AdaptiveAction, AdaptiveController};
use crate::config::{SdmConfig, MAX_WORKERS};
use crate::part_file::{part_path_for, PartFile};
use crate::planner::{self, Segment};
use crate::probe::{self, ProbeRejected};
use crate::retry::{classify_http_status, RetryDecision, RetryPolicy};
use crate::sidecar::{sidecar_path_for, SidecarStore};
use crate::speed::SpeedWindow;
use crate::url_policy;

use state::SharedTransfer;

/// Parameters for one job's transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub dest_dir: PathBuf,
    /// Explicit filename; when absent the engine derives one from the
    /// server's suggestion and the URL.
    pub filename: Option<String>,
    pub workers: usize,
    pub adaptive: bool,
}

/// How a transfer run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { final_path: PathBuf },
    /// Workers flushed and exited; part file and sidecar remain for resume.
    Paused,
    /// Part file and sidecar removed.
    Cancelled,
    /// Message is user-facing. Part file and sidecar are retained so a later
    /// run can resume.
    Failed { message: String },
}

/// Runs one job to a terminal state (or Paused). Blocking; every status and
/// progress change is pushed through `sink`.
pub fn run(
    req: &TransferRequest,
    cfg: &SdmConfig,
    ctrl: Arc<TransferControl>,
    sink: EngineSink,
) -> TransferOutcome {
    match run_inner(req, cfg, ctrl, sink) {
        Ok(outcome) => outcome,
        Err(e) => TransferOutcome::Failed {
            message: local_failure_message(e),
        },
    }
}

/// Engine-level failures are usually local I/O; give the two actionable
/// kinds the prefixes the UI layer keys on.
fn local_failure_message(e: anyhow::Error) -> String {
    for cause in e.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return match io.kind() {
                std::io::ErrorKind::PermissionDenied => format!("Permission denied: {:#}", e),
                std::io::ErrorKind::StorageFull => format!("Disk full: {:#}", e),
                _ => format!("{:#}", e),
            };
        }
    }
    format!("{:#}", e)
}

fn run_inner(
    req: &TransferRequest,
    cfg: &SdmConfig,
    ctrl: Arc<TransferControl>,
    sink: EngineSink,
) -> Result<TransferOutcome> {
    let retry = cfg.retry.policy();

    let meta = match probe_with_retry(&req.url, &retry, &ctrl) {
        Ok(meta) => meta,
        Err(ProbeFailure::Cancelled) => return Ok(TransferOutcome::Cancelled),
        Err(ProbeFailure::Failed(message)) => return Ok(TransferOutcome::Failed { message }),
    };

    let total = meta.total_bytes.unwrap_or(0);
    let accepts_ranges = meta.accepts_ranges;
    if accepts_ranges && total == 0 {
        return Ok(TransferOutcome::Failed {
            message: "server advertises ranges but no Content-Length".to_string(),
        });
    }

    let filename = req.filename.clone().unwrap_or_else(|| {
        url_policy::choose_filename(
            &req.url,
            meta.suggested_filename.as_deref(),
            meta.content_type.as_deref(),
        )
    });
    let final_path = req.dest_dir.join(&filename);
    let part_path = part_path_for(&final_path);
    let sidecar = SidecarStore::new(sidecar_path_for(&part_path), cfg.sidecar_interval());

    // Resume only against the same source; anything else starts clean.
    let same_source = sidecar.matches_url(&req.url);
    let resume = match sidecar.load() {
        Some(rec) if same_source && rec.total_bytes == total => Some(rec.segments),
        Some(_) => {
            tracing::info!(path = %part_path.display(), "sidecar does not match job, discarding partial data");
            sidecar.remove();
            let _ = std::fs::remove_file(&part_path);
            None
        }
        None => None,
    };
    let resuming = resume.is_some();

    let requested = req.workers.clamp(1, MAX_WORKERS);
    let segments = planner::plan(total, requested, accepts_ranges, resume);

    let part = PartFile::open(&part_path)?;
    if total > 0 && !resuming {
        part.preallocate(total)?;
    }

    let content_type = meta.content_type.clone().unwrap_or_default();
    let shared = Arc::new(SharedTransfer {
        url: req.url.clone(),
        total,
        ranged: AtomicBool::new(accepts_ranges),
        switch_single: AtomicBool::new(false),
        control: Arc::clone(&ctrl),
        table: Mutex::new(SegmentTable::new(segments)),
        received: AtomicU64::new(0),
        speed: Mutex::new(SpeedWindow::new(cfg.speed_window())),
        worker_bytes: Mutex::new(HashMap::new()),
        active_workers: AtomicUsize::new(0),
        part: part.clone(),
        sidecar,
        notifier: ProgressNotifier::new(Arc::clone(&sink), cfg.progress_interval()),
        retry,
        content_type,
    });
    let already = shared.table.lock().unwrap().total_written();
    shared.received.store(already, Ordering::Relaxed);

    shared.notifier.emit_now(EngineEvent::Started {
        filename: filename.clone(),
        total_bytes: total,
        content_type: meta.content_type.clone(),
        accepts_ranges,
    });

    run_workers(&shared, req, cfg, requested)?;

    // Outcome precedence: cancel, failure, pause, then completion.
    if ctrl.cancel_requested() {
        shared.part.remove()?;
        shared.sidecar.remove();
        return Ok(TransferOutcome::Cancelled);
    }
    if let Some(message) = ctrl.take_failure() {
        let _ = shared.sidecar.write_now(&shared.sidecar_record());
        return Ok(TransferOutcome::Failed { message });
    }
    if ctrl.pause_requested() {
        shared.sidecar.write_now(&shared.sidecar_record())?;
        return Ok(TransferOutcome::Paused);
    }

    let (done, written) = {
        let table = shared.table.lock().unwrap();
        (table.all_done(), table.total_written())
    };
    if !done || (total > 0 && written < total) {
        let _ = shared.sidecar.write_now(&shared.sidecar_record());
        return Ok(TransferOutcome::Failed {
            message: format!(
                "Download incomplete: {}/{} bytes received. Resume data saved.",
                written, total
            ),
        });
    }

    shared.part.sync()?;
    part.finalize(&final_path)?;
    shared.sidecar.remove();
    shared.notifier.emit_now(EngineEvent::Progress(shared.snapshot()));
    Ok(TransferOutcome::Completed { final_path })
}

/// Spawn workers and babysit them until the job settles. Handles the
/// single-stream restart and the adaptive controller's decisions.
fn run_workers(
    shared: &Arc<SharedTransfer>,
    req: &TransferRequest,
    cfg: &SdmConfig,
    requested: usize,
) -> Result<()> {
    let hint = url_policy::rate_hint_from_str(&req.url);
    let (exit_tx, exit_rx) = mpsc::channel::<usize>();
    let mut handles = Vec::new();
    let mut stops: HashMap<usize, Arc<AtomicBool>> = HashMap::new();
    let mut next_id = 0usize;

    loop {
        let initial = {
            let table = shared.table.lock().unwrap();
            if shared.ranged.load(Ordering::Relaxed) {
                table.open_slots().clamp(1, requested)
            } else {
                1
            }
        };
        for _ in 0..initial {
            spawn_worker(shared, next_id, &exit_tx, &mut stops, &mut handles);
            next_id += 1;
        }

        let mut controller = (req.adaptive && shared.ranged.load(Ordering::Relaxed))
            .then(|| AdaptiveController::new(cfg.adaptive, hint, requested));
        let mut last_tick = Instant::now();

        loop {
            match exit_rx.recv_timeout(Duration::from_millis(250)) {
                Ok(id) => {
                    stops.remove(&id);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            if let Some(controller) = controller.as_mut() {
                if last_tick.elapsed() >= controller.tick_interval()
                    && !shared.control.should_stop()
                    && !shared.switch_single.load(Ordering::Relaxed)
                {
                    let elapsed = last_tick.elapsed();
                    last_tick = Instant::now();
                    let samples: Vec<(usize, u64)> = {
                        let mut counters = shared.worker_bytes.lock().unwrap();
                        stops
                            .keys()
                            .map(|id| (*id, counters.remove(id).unwrap_or(0)))
                            .collect()
                    };
                    match controller.tick(&samples, elapsed) {
                        AdaptiveAction::RemoveWorker(id) => {
                            if let Some(stop) = stops.get(&id) {
                                stop.store(true, Ordering::Relaxed);
                            }
                        }
                        AdaptiveAction::AddWorker => {
                            let split = shared
                                .table
                                .lock()
                                .unwrap()
                                .split_largest(cfg.adaptive.min_split_bytes);
                            if split {
                                spawn_worker(shared, next_id, &exit_tx, &mut stops, &mut handles);
                                next_id += 1;
                            }
                        }
                        AdaptiveAction::None => {}
                    }
                }
            }

            // All workers can drain out while a handed-off tail is still
            // pending (the handoff landed after their last claim attempt).
            if shared.active_workers.load(Ordering::Relaxed) == 0 {
                let has_work = !shared.table.lock().unwrap().all_done();
                if has_work
                    && !shared.control.should_stop()
                    && !shared.switch_single.load(Ordering::Relaxed)
                {
                    spawn_worker(shared, next_id, &exit_tx, &mut stops, &mut handles);
                    next_id += 1;
                } else {
                    break;
                }
            }
        }

        while shared.active_workers.load(Ordering::Relaxed) > 0 {
            let _ = exit_rx.recv_timeout(Duration::from_millis(250));
        }
        for handle in handles.drain(..) {
            if handle.join().is_err() {
                shared.control.fail("worker panicked".to_string());
            }
        }
        stops.clear();

        // 200-instead-of-206: every byte written under the segmented plan is
        // suspect (each response carried the whole body). Restart as one
        // stream from offset zero.
        if shared.switch_single.swap(false, Ordering::Relaxed) && !shared.control.should_stop() {
            tracing::info!(url = %shared.url, "server ignored ranges, restarting in single-stream mode");
            shared.ranged.store(false, Ordering::Relaxed);
            shared
                .table
                .lock()
                .unwrap()
                .reset(vec![Segment::new(0, shared.total)]);
            shared.received.store(0, Ordering::Relaxed);
            shared.speed.lock().unwrap().reset();
            shared.worker_bytes.lock().unwrap().clear();
            continue;
        }
        return Ok(());
    }
}

fn spawn_worker(
    shared: &Arc<SharedTransfer>,
    id: usize,
    exit_tx: &mpsc::Sender<usize>,
    stops: &mut HashMap<usize, Arc<AtomicBool>>,
    handles: &mut Vec<std::thread::JoinHandle<()>>,
) {
    let stop = Arc::new(AtomicBool::new(false));
    stops.insert(id, Arc::clone(&stop));
    shared.active_workers.fetch_add(1, Ordering::Relaxed);
    let shared = Arc::clone(shared);
    let exit_tx = exit_tx.clone();
    handles.push(std::thread::spawn(move || {
        worker::worker_loop(shared, id, stop);
        let _ = exit_tx.send(id);
    }));
}

enum ProbeFailure {
    Cancelled,
    Failed(String),
}

/// Probe with the worker retry policy: transient statuses and network
/// errors back off and retry, permanent ones fail the job up front.
fn probe_with_retry(
    url: &str,
    policy: &RetryPolicy,
    ctrl: &TransferControl,
) -> Result<probe::ProbeResult, ProbeFailure> {
    let mut attempt = 1u32;
    loop {
        if ctrl.cancel_requested() {
            return Err(ProbeFailure::Cancelled);
        }
        match probe::probe_best_effort(url) {
            Ok(meta) => return Ok(meta),
            Err(e) => {
                let (kind, retry_after) = match e.downcast_ref::<ProbeRejected>() {
                    Some(r) => (classify_http_status(r.code), r.retry_after),
                    None => (crate::retry::ErrorKind::Connection, None),
                };
                match policy.decide(attempt, kind, retry_after) {
                    RetryDecision::NoRetry => {
                        return Err(ProbeFailure::Failed(format!("{:#}", e)));
                    }
                    RetryDecision::RetryAfter(d) => {
                        tracing::debug!(attempt, url, error = %e, "probe failed, retrying");
                        std::thread::sleep(d);
                        attempt += 1;
                    }
                }
            }
        }
    }
}
