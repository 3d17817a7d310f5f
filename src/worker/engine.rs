//! Threaded wrapper around [`WorkerCore`] for UIs and long-lived hosts.
//!
//! The engine owns no loop logic. It runs the core on a dedicated thread,
//! republishes observer calls as [`WorkerEvent`]s, and adds a periodic stats
//! publisher plus timed "away" pauses.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use super::control::WorkerControl;
use super::core::WorkerCore;
use super::events::{BroadcastObserver, WorkerEvent};
use super::stats::{StatsSnapshot, StatusHandle, WorkerState};
use crate::config::WorkerConfig;
use crate::error::WorkerError;

const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 256;

/// Builds the core for each (re)start.
pub type CoreFactory = Arc<dyn Fn(WorkerConfig) -> Result<WorkerCore, WorkerError> + Send + Sync>;

type AwayDeadline = Arc<Mutex<Option<Instant>>>;

pub struct WorkerEngine {
    config: WorkerConfig,
    factory: CoreFactory,
    events: broadcast::Sender<WorkerEvent>,
    stats_interval: Duration,
    control: WorkerControl,
    status: StatusHandle,
    away_until: AwayDeadline,
    thread: Option<JoinHandle<()>>,
}

impl WorkerEngine {
    pub fn new(config: WorkerConfig) -> Self {
        Self::with_core_factory(config, Arc::new(WorkerCore::new))
    }

    pub fn with_core_factory(config: WorkerConfig, factory: CoreFactory) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            factory,
            events,
            stats_interval: DEFAULT_STATS_INTERVAL,
            control: WorkerControl::new(),
            status: StatusHandle::new(),
            away_until: Arc::new(Mutex::new(None)),
            thread: None,
        }
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Spawn the worker thread. No-op if already running.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        if self.is_running() {
            return Ok(());
        }
        self.reap();

        let control = WorkerControl::new();
        let core = (self.factory)(self.config.clone())?
            .with_observer(Arc::new(BroadcastObserver::new(self.events.clone())))
            .with_control(control.clone());
        self.control = control.clone();
        self.status = core.status();

        let publisher = StatsPublisher {
            status: core.status(),
            control,
            away_until: Arc::clone(&self.away_until),
            events: self.events.clone(),
            interval: self.stats_interval,
        };
        let events = self.events.clone();

        let thread = std::thread::Builder::new()
            .name(format!("worker-{}", self.config.worker_id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to build worker runtime");
                        let _ = events.send(WorkerEvent::Error(format!(
                            "Failed to start worker runtime: {}",
                            e
                        )));
                        return;
                    }
                };

                runtime.block_on(async move {
                    tokio::select! {
                        _ = core.run() => {}
                        _ = publisher.run() => {}
                    }
                });
            })
            .map_err(|e| WorkerError::Config(format!("Failed to spawn worker thread: {}", e)))?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Shut the core down and wait for its thread. Blocks the caller.
    pub fn stop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        self.control.shutdown();
        self.reap();
    }

    pub fn pause(&self) {
        if self.control.pause() {
            tracing::info!(worker_id = %self.config.worker_id, "Pausing worker");
        }
        let _ = self.events.send(WorkerEvent::Status(WorkerState::Paused));
    }

    /// Resume and cancel any pending away deadline.
    pub fn resume(&self) {
        self.clear_away();
        if self.control.resume() {
            tracing::info!(worker_id = %self.config.worker_id, "Resuming worker");
        }
        let _ = self.events.send(WorkerEvent::Status(self.state()));
    }

    /// Away mode: pause now, resume automatically once `duration` has passed.
    ///
    /// The deadline is checked on each stats tick, so the resume lands up to
    /// one stats interval late.
    pub fn pause_for(&self, duration: Duration) {
        self.pause();
        *self.away_until.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Instant::now() + duration);
    }

    /// Replace the configuration, restarting the worker if it was running.
    pub fn update(&mut self, config: WorkerConfig) -> Result<(), WorkerError> {
        let was_running = self.is_running();
        self.stop();
        self.config = config;
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.status.snapshot();
        snapshot.away_remaining = away_remaining(&self.away_until);
        snapshot
    }

    pub fn state(&self) -> WorkerState {
        self.status.state()
    }

    fn clear_away(&self) {
        *self.away_until.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn reap(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(worker_id = %self.config.worker_id, "Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn away_remaining(away_until: &AwayDeadline) -> Option<f64> {
    away_until
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs_f64())
}

struct StatsPublisher {
    status: StatusHandle,
    control: WorkerControl,
    away_until: AwayDeadline,
    events: broadcast::Sender<WorkerEvent>,
    interval: Duration,
}

impl StatsPublisher {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let mut snapshot = self.status.snapshot();
            snapshot.away_remaining = away_remaining(&self.away_until);

            if snapshot.away_remaining == Some(0.0) {
                *self.away_until.lock().unwrap_or_else(PoisonError::into_inner) = None;
                snapshot.away_remaining = None;
                self.control.resume();
                tracing::info!("Away mode ended, resuming worker");
                let _ = self.events.send(WorkerEvent::Error(
                    "Away mode ended, worker resumed.".to_string(),
                ));
            }

            let _ = self.events.send(WorkerEvent::Stats(snapshot));
        }
    }
}
