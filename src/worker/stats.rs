use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Lifecycle phase a worker reports to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Idle,
    GpuBusy,
    Working,
    Retrying,
    Paused,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::GpuBusy => "gpu_busy",
            WorkerState::Working => "working",
            WorkerState::Retrying => "retrying",
            WorkerState::Paused => "paused",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Running counters for one worker session.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    started: Instant,
    jobs_completed: u64,
    jobs_failed: u64,
    total_job_time: Duration,
    current_job_id: Option<String>,
    job_started_at: Option<Instant>,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            jobs_completed: 0,
            jobs_failed: 0,
            total_job_time: Duration::ZERO,
            current_job_id: None,
            job_started_at: None,
        }
    }
}

impl WorkerStats {
    pub fn begin_job(&mut self, job_id: &str) {
        self.current_job_id = Some(job_id.to_string());
        self.job_started_at = Some(Instant::now());
    }

    /// Only successful jobs count toward the average processing time.
    pub fn record_success(&mut self) {
        if let Some(started) = self.job_started_at.take() {
            self.total_job_time += started.elapsed();
        }
        self.jobs_completed += 1;
        self.current_job_id = None;
    }

    pub fn record_failure(&mut self) {
        self.job_started_at = None;
        self.jobs_failed += 1;
        self.current_job_id = None;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let avg_job_time = if self.jobs_completed == 0 {
            0.0
        } else {
            self.total_job_time.as_secs_f64() / self.jobs_completed as f64
        };
        StatsSnapshot {
            uptime: self.started.elapsed().as_secs_f64(),
            jobs_completed: self.jobs_completed,
            jobs_failed: self.jobs_failed,
            current_job_id: self.current_job_id.clone(),
            avg_job_time,
            away_remaining: None,
        }
    }
}

/// Point-in-time copy of [`WorkerStats`], in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub uptime: f64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub current_job_id: Option<String>,
    pub avg_job_time: f64,
    /// Seconds left in away mode, when active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub away_remaining: Option<f64>,
}

struct Status {
    state: WorkerState,
    stats: WorkerStats,
}

/// Shared view of a worker's phase and counters.
///
/// The loop writes through it; stats publishers and UIs only read.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<Status>>,
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Status {
                state: WorkerState::Stopped,
                stats: WorkerStats::default(),
            })),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
            .snapshot()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }

    pub(crate) fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut status = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn average_counts_only_successes() {
        let mut stats = WorkerStats::default();

        stats.begin_job("a");
        tokio::time::advance(Duration::from_secs(4)).await;
        stats.record_success();

        stats.begin_job("b");
        tokio::time::advance(Duration::from_secs(10)).await;
        stats.record_failure();

        stats.begin_job("c");
        tokio::time::advance(Duration::from_secs(2)).await;
        stats.record_success();

        let snap = stats.snapshot();
        assert_eq!(snap.jobs_completed, 2);
        assert_eq!(snap.jobs_failed, 1);
        assert!(snap.current_job_id.is_none());
        assert!((snap.avg_job_time - 3.0).abs() < 1e-6);
        assert!(snap.uptime >= 16.0);
    }

    #[test]
    fn empty_stats_have_zero_average() {
        let snap = WorkerStats::default().snapshot();
        assert_eq!(snap.avg_job_time, 0.0);
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("away_remaining").is_none());
        assert_eq!(json["current_job_id"], serde_json::Value::Null);
    }

    #[test]
    fn state_names_match_wire_format() {
        assert_eq!(WorkerState::GpuBusy.to_string(), "gpu_busy");
        assert_eq!(
            serde_json::to_value(WorkerState::GpuBusy).unwrap(),
            serde_json::json!("gpu_busy")
        );
    }

    #[test]
    fn handle_tracks_current_job() {
        let handle = StatusHandle::new();
        assert_eq!(handle.state(), WorkerState::Stopped);

        handle.set_state(WorkerState::Working);
        handle.update_stats(|s| s.begin_job("job-1"));
        assert_eq!(handle.state(), WorkerState::Working);
        assert_eq!(handle.snapshot().current_job_id.as_deref(), Some("job-1"));
    }
}
