//! Job records, status machine, and the summary view sent to subscribers.

use serde::Serialize;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque job identifier, unique within one queue.
pub type JobId = u64;

/// Lifecycle of a job. Completed, Failed, and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal edges of the status machine. Terminal states accept nothing.
    pub fn may_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Queued, Downloading) | (Queued, Cancelled) => true,
            (Downloading, Paused)
            | (Downloading, Completed)
            | (Downloading, Failed)
            | (Downloading, Cancelled) => true,
            (Paused, Downloading) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

/// Snapshot of one job for listings and progress events.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub url: String,
    /// Empty until the probe resolves a name (or the caller supplied one).
    pub filename: String,
    pub dest_path: String,
    pub status: JobStatus,
    pub total_bytes: u64,
    pub received_bytes: u64,
    pub speed_bps: f64,
    pub connections: usize,
    pub adaptive: bool,
    pub error_message: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// One queue slot: the job snapshot plus runtime bookkeeping.
#[derive(Debug)]
pub(super) struct QueueEntry {
    pub summary: JobSummary,
    pub dest_dir: PathBuf,
    pub filename_override: Option<String>,
    /// Control handle of the running engine, if any.
    pub control: Option<std::sync::Arc<crate::transfer::TransferControl>>,
    /// Known after the probe; pause is refused without range support.
    pub accepts_ranges: bool,
}

/// Current time as Unix seconds.
pub(super) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::JobStatus::*;

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for to in [Queued, Downloading, Paused, Completed, Failed, Cancelled] {
                assert!(!terminal.may_transition_to(to), "{terminal:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn pause_resume_edges() {
        assert!(Downloading.may_transition_to(Paused));
        assert!(Paused.may_transition_to(Downloading));
        assert!(Paused.may_transition_to(Cancelled));
        assert!(!Paused.may_transition_to(Completed));
        assert!(!Queued.may_transition_to(Paused));
    }

    #[test]
    fn admission_and_terminal_edges() {
        assert!(Queued.may_transition_to(Downloading));
        assert!(Queued.may_transition_to(Cancelled));
        assert!(Downloading.may_transition_to(Completed));
        assert!(Downloading.may_transition_to(Failed));
        assert!(Downloading.may_transition_to(Cancelled));
        assert!(!Queued.may_transition_to(Completed));
    }
}
