//! Adaptive worker-count control.
//!
//! Runs on a fixed tick while a job transfers. Each tick it reads how many
//! bytes every worker moved since the last tick and decides to add a worker,
//! remove a straggler, or leave the pool alone. Per-connection throttling is
//! common; parallelism past the server's per-connection rate hint wastes
//! connections, and a persistently slow worker holds a segment hostage that
//! a faster worker could finish.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::AdaptiveConfig;

/// What the engine should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveAction {
    None,
    /// Stop this worker; its unwritten tail is handed back to the pool.
    RemoveWorker(usize),
    /// Split the largest remaining segment and start one more worker.
    AddWorker,
}

/// Per-job controller state across ticks.
#[derive(Debug)]
pub struct AdaptiveController {
    cfg: AdaptiveConfig,
    /// Per-connection cap hinted by the server (`rate=` query parameter),
    /// bytes/sec.
    hint_bps: Option<f64>,
    /// Upper bound on worker count (the job's requested connections).
    requested: usize,
    slow_ticks: HashMap<usize, u32>,
    prev_median: Option<f64>,
}

impl AdaptiveController {
    pub fn new(cfg: AdaptiveConfig, hint_bps: Option<f64>, requested: usize) -> Self {
        Self {
            cfg,
            hint_bps,
            requested: requested.max(1),
            slow_ticks: HashMap::new(),
            prev_median: None,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.tick_secs)
    }

    /// Evaluate one tick. `samples` holds `(worker_id, bytes_since_last_tick)`
    /// for every live worker.
    pub fn tick(&mut self, samples: &[(usize, u64)], elapsed: Duration) -> AdaptiveAction {
        let secs = elapsed.as_secs_f64();
        if samples.is_empty() || secs <= 0.0 {
            return AdaptiveAction::None;
        }

        let mut rates: Vec<(usize, f64)> = samples
            .iter()
            .map(|(id, bytes)| (*id, *bytes as f64 / secs))
            .collect();
        rates.sort_by(|a, b| a.1.total_cmp(&b.1));
        let median = rates[rates.len() / 2].1;

        self.slow_ticks.retain(|id, _| rates.iter().any(|(rid, _)| rid == id));
        let threshold = self.cfg.straggler_ratio * median;
        for (id, bps) in &rates {
            if *bps < threshold {
                *self.slow_ticks.entry(*id).or_insert(0) += 1;
            } else {
                self.slow_ticks.remove(id);
            }
        }

        let prev = self.prev_median.replace(median);

        // Removal first: a straggler slow for enough consecutive ticks goes,
        // as long as at least one worker remains.
        if rates.len() > 1 {
            let victim = rates.iter().find(|(id, _)| {
                self.slow_ticks.get(id).copied().unwrap_or(0) >= self.cfg.straggler_ticks
            });
            if let Some((id, bps)) = victim {
                tracing::debug!(worker = id, bps, median, "removing straggler worker");
                self.slow_ticks.remove(id);
                return AdaptiveAction::RemoveWorker(*id);
            }
        }

        if rates.len() >= self.requested {
            return AdaptiveAction::None;
        }

        let near_hint = self
            .hint_bps
            .map(|h| median > self.cfg.hint_headroom * h)
            .unwrap_or(false);
        let plateaued = prev
            .map(|p| p > 0.0 && ((median - p) / p).abs() <= self.cfg.plateau_tolerance)
            .unwrap_or(false);

        if near_hint || plateaued {
            tracing::debug!(median, near_hint, plateaued, "adding worker");
            return AdaptiveAction::AddWorker;
        }

        AdaptiveAction::None
    }
}
