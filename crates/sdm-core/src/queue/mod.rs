//! Queue orchestrator: admission, control operations, and broadcast.
//!
//! Jobs enter here, at most `max_concurrent_jobs` transfer at once, and
//! every observable change is fanned out to subscribers. Admission marks a
//! job Downloading and claims its slot in the same critical section that
//! picked it, so the cap holds at every instant; the asynchronous engine
//! start happens strictly after. Progress events arrive from worker threads
//! and are marshaled onto a single dispatch task; subscriber callbacks are
//! never invoked from worker threads.

mod cleanup;
mod job;

pub use job::{JobId, JobStatus, JobSummary};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{SdmConfig, MAX_WORKERS};
use crate::part_file::part_path_for;
use crate::sidecar::sidecar_path_for;
use crate::transfer::{
    self, EngineEvent, EngineSink, TransferControl, TransferOutcome, TransferRequest,
};
use crate::url_policy::{InvalidUrl, UrlRules};

use cleanup::{select_expired, TerminalJob};
use job::{unix_timestamp, QueueEntry};

/// Parameters accepted by `Queue::add`.
#[derive(Debug, Clone, Default)]
pub struct AddRequest {
    pub url: String,
    pub filename: Option<String>,
    pub connections: Option<usize>,
    pub adaptive: Option<bool>,
    pub dest_dir: Option<PathBuf>,
}

impl AddRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Errors reported synchronously by queue operations.
#[derive(Debug)]
pub enum QueueError {
    InvalidUrl(InvalidUrl),
    InvalidWorkerCount(usize),
    NotFound(JobId),
    /// Pause needs range support, otherwise resume would start over.
    PauseUnsupported(JobId),
    IllegalTransition {
        id: JobId,
        from: JobStatus,
        op: &'static str,
    },
    NotTerminal(JobId),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::InvalidUrl(e) => write!(f, "invalid URL: {}", e),
            QueueError::InvalidWorkerCount(n) => {
                write!(f, "connections must be 1..={}, got {}", MAX_WORKERS, n)
            }
            QueueError::NotFound(id) => write!(f, "no job with id {}", id),
            QueueError::PauseUnsupported(id) => {
                write!(f, "job {} cannot pause: server does not support ranges", id)
            }
            QueueError::IllegalTransition { id, from, op } => {
                write!(f, "cannot {} job {} in state {}", op, id, from.as_str())
            }
            QueueError::NotTerminal(id) => {
                write!(f, "job {} is not in a terminal state", id)
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// Event delivered to subscribers on every observable job change.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: JobSummary,
}

impl ProgressEvent {
    fn progress(data: JobSummary) -> Self {
        Self {
            kind: "progress",
            data,
        }
    }
}

/// Opaque handle returned by `subscribe`, used for O(1) deregistration.
pub type SubscriberId = u64;

/// Subscriber callback. Runs on the dispatch task; an Err deregisters the
/// subscriber without affecting the others.
pub type SubscriberCallback = Box<dyn Fn(&ProgressEvent) -> Result<()> + Send>;

enum QueueMsg {
    Subscribe(SubscriberId, SubscriberCallback),
    Unsubscribe(SubscriberId),
    Broadcast(JobSummary),
}

struct QueueState {
    jobs: HashMap<JobId, QueueEntry>,
    /// Insertion order, for listings.
    order: Vec<JobId>,
    /// FIFO of jobs awaiting a slot: Queued jobs and resumed Paused jobs.
    ready: VecDeque<JobId>,
    /// Jobs currently owned by a transfer engine.
    active: HashSet<JobId>,
    next_job_id: JobId,
    next_subscriber_id: SubscriberId,
}

struct Inner {
    cfg: SdmConfig,
    rules: UrlRules,
    dest_dir: PathBuf,
    state: Mutex<QueueState>,
    events_tx: mpsc::UnboundedSender<QueueMsg>,
}

/// The download queue. Cheap to clone; all clones share state.
///
/// Must be created and used inside a tokio runtime: admission spawns the
/// per-job engine tasks and broadcast runs on a dispatch task.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl Queue {
    pub fn new(cfg: SdmConfig, dest_dir: PathBuf) -> Self {
        let rules = UrlRules::new(cfg.allowed_host_suffixes.clone(), cfg.allow_insecure);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            cfg,
            rules,
            dest_dir,
            state: Mutex::new(QueueState {
                jobs: HashMap::new(),
                order: Vec::new(),
                ready: VecDeque::new(),
                active: HashSet::new(),
                next_job_id: 1,
                next_subscriber_id: 1,
            }),
            events_tx,
        });
        tokio::spawn(dispatch_loop(events_rx));
        tokio::spawn(cleanup_loop(Arc::downgrade(&inner)));
        Queue { inner }
    }

    /// Validate and enqueue a new job. Nothing is mutated on a validation
    /// failure.
    pub fn add(&self, req: AddRequest) -> Result<JobId, QueueError> {
        self.inner
            .rules
            .validate(&req.url)
            .map_err(QueueError::InvalidUrl)?;
        let connections = req.connections.unwrap_or(self.inner.cfg.default_workers);
        if !(1..=MAX_WORKERS).contains(&connections) {
            return Err(QueueError::InvalidWorkerCount(connections));
        }
        let adaptive = req.adaptive.unwrap_or(false);
        let dest_dir = req.dest_dir.unwrap_or_else(|| self.inner.dest_dir.clone());

        let summary = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.next_job_id;
            state.next_job_id += 1;
            let summary = JobSummary {
                id,
                url: req.url,
                filename: req.filename.clone().unwrap_or_default(),
                dest_path: dest_dir.display().to_string(),
                status: JobStatus::Queued,
                total_bytes: 0,
                received_bytes: 0,
                speed_bps: 0.0,
                connections,
                adaptive,
                error_message: None,
                created_at: unix_timestamp(),
                completed_at: None,
            };
            state.jobs.insert(
                id,
                QueueEntry {
                    summary: summary.clone(),
                    dest_dir,
                    filename_override: req.filename,
                    control: None,
                    accepts_ranges: false,
                },
            );
            state.order.push(id);
            state.ready.push_back(id);
            self.inner.broadcast(summary.clone());
            summary
        };

        schedule(&self.inner);
        Ok(summary.id)
    }

    /// Snapshot of all jobs in insertion order.
    pub fn list(&self) -> Vec<JobSummary> {
        let state = self.inner.state.lock().unwrap();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .map(|e| e.summary.clone())
            .collect()
    }

    pub fn get(&self, id: JobId) -> Result<JobSummary, QueueError> {
        let state = self.inner.state.lock().unwrap();
        state
            .jobs
            .get(&id)
            .map(|e| e.summary.clone())
            .ok_or(QueueError::NotFound(id))
    }

    /// Ask a running job to pause. Workers flush and exit; the slot frees
    /// once they have.
    pub fn pause(&self, id: JobId) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            let entry = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
            if entry.summary.status == JobStatus::Downloading && !entry.accepts_ranges {
                return Err(QueueError::PauseUnsupported(id));
            }
            try_transition(entry, JobStatus::Paused, "pause")?;
            if let Some(control) = &entry.control {
                control.request_pause();
            }
            entry.summary.speed_bps = 0.0;
            self.inner.broadcast(entry.summary.clone());
        }
        Ok(())
    }

    /// Re-admit a paused job. It keeps Paused status until a slot picks it
    /// up, in FIFO order with queued jobs.
    pub fn resume(&self, id: JobId) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            let entry = state.jobs.get(&id).ok_or(QueueError::NotFound(id))?;
            // legal exactly when the machine can reach Downloading from
            // here: Paused (the real resume) or Queued (no-op, the job is
            // already in the ready queue)
            if !entry.summary.status.may_transition_to(JobStatus::Downloading) {
                return Err(QueueError::IllegalTransition {
                    id,
                    from: entry.summary.status,
                    op: "resume",
                });
            }
            if !state.ready.contains(&id) {
                state.ready.push_back(id);
            }
        }
        schedule(&self.inner);
        Ok(())
    }

    /// Cancel a job. Terminal jobs are a successful no-op. Part file and
    /// sidecar are removed.
    pub fn cancel(&self, id: JobId) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            let entry = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
            if entry.summary.status.is_terminal() {
                return Ok(());
            }
            let was_running = entry.control.is_some();
            if let Some(control) = &entry.control {
                control.request_cancel();
            }
            try_transition(entry, JobStatus::Cancelled, "cancel")?;
            entry.summary.error_message = Some("Cancelled by user".to_string());
            entry.summary.completed_at = Some(unix_timestamp());
            entry.summary.speed_bps = 0.0;
            if !was_running {
                // no engine to do it (Queued or fully parked Paused job)
                remove_partial_files(entry);
            }
            self.inner.broadcast(entry.summary.clone());
            state.ready.retain(|r| *r != id);
        }
        Ok(())
    }

    /// Drop a terminal job from the queue.
    pub fn remove(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().unwrap();
        let entry = state.jobs.get(&id).ok_or(QueueError::NotFound(id))?;
        if !entry.summary.status.is_terminal() {
            return Err(QueueError::NotTerminal(id));
        }
        state.jobs.remove(&id);
        state.order.retain(|o| *o != id);
        Ok(())
    }

    /// Apply the retention policy now. Returns how many entries were
    /// dropped.
    pub fn cleanup(&self) -> usize {
        match self.inner.try_cleanup() {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "cleanup failed");
                0
            }
        }
    }

    /// Register a progress callback; the returned id deregisters it.
    pub fn subscribe(&self, callback: SubscriberCallback) -> SubscriberId {
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.next_subscriber_id;
            state.next_subscriber_id += 1;
            id
        };
        let _ = self.inner.events_tx.send(QueueMsg::Subscribe(id, callback));
        id
    }

    /// Channel-flavored subscription: events arrive on the receiver, and
    /// dropping it deregisters on the next delivery.
    pub fn subscribe_channel(&self) -> (SubscriberId, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(Box::new(move |event| {
            tx.send(event.clone())
                .map_err(|_| anyhow::anyhow!("subscriber receiver dropped"))
        }));
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.inner.events_tx.send(QueueMsg::Unsubscribe(id));
    }
}

impl Inner {
    fn broadcast(&self, summary: JobSummary) {
        let _ = self.events_tx.send(QueueMsg::Broadcast(summary));
    }

    /// Engine event from a worker thread: fold into the job record and
    /// relay toward the dispatch task. The send happens under the state
    /// lock so deliveries for one job arrive in the order the record
    /// changed; subscribers then see received_bytes only ever grow.
    fn on_engine_event(&self, id: JobId, event: EngineEvent) {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.jobs.get_mut(&id) else {
            return;
        };
        match event {
            EngineEvent::Started {
                filename,
                total_bytes,
                content_type: _,
                accepts_ranges,
            } => {
                entry.summary.dest_path = entry.dest_dir.join(&filename).display().to_string();
                entry.summary.filename = filename;
                entry.summary.total_bytes = total_bytes;
                entry.accepts_ranges = accepts_ranges;
            }
            EngineEvent::Progress(p) => {
                // workers snapshot concurrently; never let a stale snapshot
                // roll the published count backwards
                entry.summary.received_bytes = entry.summary.received_bytes.max(p.received_bytes);
                entry.summary.speed_bps = p.speed_bps;
                if p.total_bytes > 0 {
                    entry.summary.total_bytes = p.total_bytes;
                }
            }
        }
        self.broadcast(entry.summary.clone());
    }

    /// Terminal (or paused) outcome from the engine: fold in, release the
    /// slot, retrigger admission.
    fn finish_job(self: &Arc<Self>, id: JobId, outcome: TransferOutcome) {
        {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.jobs.get_mut(&id) else {
                return;
            };
            entry.control = None;
            match outcome {
                TransferOutcome::Completed { final_path } => {
                    if apply_engine_status(entry, JobStatus::Completed) {
                        entry.summary.dest_path = final_path.display().to_string();
                        entry.summary.received_bytes =
                            entry.summary.total_bytes.max(entry.summary.received_bytes);
                        entry.summary.error_message = None;
                        entry.summary.completed_at = Some(unix_timestamp());
                        entry.summary.speed_bps = 0.0;
                    }
                }
                TransferOutcome::Paused => {
                    if entry.summary.status == JobStatus::Cancelled {
                        // cancel raced the pause; engine preserved the files
                        remove_partial_files(entry);
                    } else if apply_engine_status(entry, JobStatus::Paused) {
                        entry.summary.speed_bps = 0.0;
                    }
                }
                TransferOutcome::Cancelled => {
                    if apply_engine_status(entry, JobStatus::Cancelled) {
                        entry.summary.error_message = Some("Cancelled by user".to_string());
                        entry.summary.completed_at = Some(unix_timestamp());
                        entry.summary.speed_bps = 0.0;
                    }
                }
                TransferOutcome::Failed { message } => {
                    if apply_engine_status(entry, JobStatus::Failed) {
                        entry.summary.error_message = Some(message);
                        entry.summary.completed_at = Some(unix_timestamp());
                        entry.summary.speed_bps = 0.0;
                    }
                }
            }
            state.active.remove(&id);
            if let Some(entry) = state.jobs.get(&id) {
                self.broadcast(entry.summary.clone());
            }
        }
        schedule(self);
    }

    fn try_cleanup(&self) -> Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("queue state lock poisoned"))?;
        let now = unix_timestamp();
        let candidates: Vec<TerminalJob> = state
            .jobs
            .values()
            .filter(|e| e.summary.status.is_terminal())
            .filter(|e| !state.active.contains(&e.summary.id))
            .map(|e| TerminalJob {
                id: e.summary.id,
                status: e.summary.status,
                finished_at: e.summary.completed_at.unwrap_or(e.summary.created_at),
            })
            .collect();
        let expired = select_expired(
            candidates,
            now,
            self.cfg.cleanup_age_hours as i64 * 3600,
            self.cfg.max_completed,
        );
        for id in &expired {
            state.jobs.remove(id);
            state.order.retain(|o| o != id);
        }
        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "cleaned up old jobs");
        }
        Ok(expired.len())
    }
}

/// Admission: fill free slots from the ready queue in FIFO order. Status
/// flips to Downloading and the slot is claimed before the lock drops; the
/// engine task spawn follows.
fn schedule(inner: &Arc<Inner>) {
    let mut to_start = Vec::new();
    {
        let mut state = inner.state.lock().unwrap();
        while state.active.len() < inner.cfg.max_concurrent_jobs.max(1) {
            let Some(id) = state.ready.pop_front() else {
                break;
            };
            if state.active.contains(&id) {
                // prior engine still releasing the slot; keep FIFO position
                state.ready.push_front(id);
                break;
            }
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            // admission is the machine's Queued/Paused -> Downloading edge
            if try_transition(entry, JobStatus::Downloading, "admit").is_err() {
                continue;
            }
            entry.summary.error_message = None;
            let control = Arc::new(TransferControl::new());
            entry.control = Some(Arc::clone(&control));
            let filename = entry
                .filename_override
                .clone()
                .or_else(|| {
                    let name = &entry.summary.filename;
                    (!name.is_empty()).then(|| name.clone())
                });
            let req = TransferRequest {
                url: entry.summary.url.clone(),
                dest_dir: entry.dest_dir.clone(),
                filename,
                workers: entry.summary.connections,
                adaptive: entry.summary.adaptive,
            };
            inner.broadcast(entry.summary.clone());
            to_start.push((id, req, control));
            state.active.insert(id);
        }
    }
    for (id, req, control) in to_start {
        let inner = Arc::clone(inner);
        tokio::spawn(job_task(inner, id, req, control));
    }
}

/// Owns one engine run on the blocking pool and folds its outcome back in.
async fn job_task(
    inner: Arc<Inner>,
    id: JobId,
    req: TransferRequest,
    control: Arc<TransferControl>,
) {
    let sink: EngineSink = {
        let inner = Arc::downgrade(&inner);
        Arc::new(move |event| {
            if let Some(inner) = inner.upgrade() {
                inner.on_engine_event(id, event);
            }
        })
    };
    let cfg = inner.cfg.clone();
    let outcome = match tokio::task::spawn_blocking(move || {
        transfer::run(&req, &cfg, control, sink)
    })
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(job = id, error = %e, "engine task aborted");
            TransferOutcome::Failed {
                message: format!("download task failed: {}", e),
            }
        }
    };
    inner.finish_job(id, outcome);
}

/// Apply a status change if the machine allows it.
fn try_transition(entry: &mut QueueEntry, to: JobStatus, op: &'static str) -> Result<(), QueueError> {
    let from = entry.summary.status;
    if !from.may_transition_to(to) {
        return Err(QueueError::IllegalTransition {
            id: entry.summary.id,
            from,
            op,
        });
    }
    entry.summary.status = to;
    Ok(())
}

/// Engine outcomes are authoritative for any non-terminal job: a
/// provisional Paused set by a control call can be overtaken by the
/// completion or failure that was already in flight when the request
/// landed. Returns false when the job is terminal and nothing may change.
fn apply_engine_status(entry: &mut QueueEntry, to: JobStatus) -> bool {
    let from = entry.summary.status;
    if from.is_terminal() {
        return false;
    }
    if from != to && !from.may_transition_to(to) {
        tracing::debug!(
            job = entry.summary.id,
            from = from.as_str(),
            to = to.as_str(),
            "engine outcome overtakes provisional status"
        );
    }
    entry.summary.status = to;
    true
}

/// Best-effort removal of a job's `.part` and sidecar, for cancels the
/// engine didn't get to clean up.
fn remove_partial_files(entry: &QueueEntry) {
    if entry.summary.filename.is_empty() {
        return;
    }
    let final_path = entry.dest_dir.join(&entry.summary.filename);
    let part = part_path_for(&final_path);
    let sidecar = sidecar_path_for(&part);
    for path in [part, sidecar] {
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "could not remove partial file");
            }
        }
    }
}

/// Dispatch task: owns the subscriber map, invokes callbacks sequentially.
/// A failing subscriber is logged and dropped without affecting the rest.
async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<QueueMsg>) {
    let mut subscribers: HashMap<SubscriberId, SubscriberCallback> = HashMap::new();
    while let Some(msg) = rx.recv().await {
        match msg {
            QueueMsg::Subscribe(id, callback) => {
                subscribers.insert(id, callback);
            }
            QueueMsg::Unsubscribe(id) => {
                subscribers.remove(&id);
            }
            QueueMsg::Broadcast(summary) => {
                let event = ProgressEvent::progress(summary);
                let mut dead = Vec::new();
                for (id, callback) in &subscribers {
                    if let Err(e) = callback(&event) {
                        tracing::warn!(subscriber = *id, error = %e, "subscriber failed, deregistering");
                        dead.push(*id);
                    }
                }
                for id in dead {
                    subscribers.remove(&id);
                }
            }
        }
    }
}

/// Hourly retention sweep with bounded retries per tick.
async fn cleanup_loop(inner: Weak<Inner>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    ticker.tick().await; // immediate first tick is not a real interval
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        for attempt in 1..=3u32 {
            match inner.try_cleanup() {
                Ok(_) => break,
                Err(e) => {
                    tracing::error!(attempt, error = %e, "periodic cleanup failed");
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            }
        }
    }
}
