//! Retention policy for terminal jobs.

use super::job::{JobId, JobStatus};

/// Candidate view of a terminal job for the retention decision.
#[derive(Debug, Clone, Copy)]
pub(super) struct TerminalJob {
    pub id: JobId,
    pub status: JobStatus,
    /// completed_at, falling back to created_at when absent.
    pub finished_at: i64,
}

/// Picks terminal jobs to drop: everything older than `max_age_secs`, plus
/// the oldest beyond `max_kept` (newest retained). Non-terminal jobs are
/// never candidates; callers filter them out.
pub(super) fn select_expired(
    mut terminal: Vec<TerminalJob>,
    now: i64,
    max_age_secs: i64,
    max_kept: usize,
) -> Vec<JobId> {
    debug_assert!(terminal.iter().all(|t| t.status.is_terminal()));

    let mut drop: Vec<JobId> = terminal
        .iter()
        .filter(|t| now - t.finished_at >= max_age_secs)
        .map(|t| t.id)
        .collect();

    terminal.retain(|t| !drop.contains(&t.id));
    if terminal.len() > max_kept {
        terminal.sort_by_key(|t| t.finished_at);
        let excess = terminal.len() - max_kept;
        drop.extend(terminal.iter().take(excess).map(|t| t.id));
    }

    drop
}
