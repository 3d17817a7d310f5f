use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::Instrument;

use super::backend::{ChatBackend, OllamaBackend};
use super::client::{HttpQueueClient, JobReport, QueueApi};
use super::control::WorkerControl;
use super::events::{NoopObserver, WorkerObserver};
use super::gpu::{NvidiaSmiSampler, ResourceSampler};
use super::stats::{StatsSnapshot, StatusHandle, WorkerState};
use crate::config::WorkerConfig;
use crate::error::WorkerError;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Lower bound on every loop wait, whatever the config says.
const MIN_WAIT: Duration = Duration::from_millis(10);
const NO_RESULT: &str = "Job processing failed without result.";
const MALFORMED_RESPONSE: &str = "Malformed response from model backend.";

/// Headless polling loop: admission check, fetch, execute, report.
///
/// Runs until its [`WorkerControl`] is shut down. Every accepted job gets
/// exactly one report, retried with capped exponential backoff until the
/// manager accepts it or shutdown interrupts the wait.
pub struct WorkerCore {
    config: WorkerConfig,
    queue: Arc<dyn QueueApi>,
    backend: Arc<dyn ChatBackend>,
    sampler: Arc<dyn ResourceSampler>,
    observer: Arc<dyn WorkerObserver>,
    control: WorkerControl,
    status: StatusHandle,
}

impl WorkerCore {
    /// Worker wired to the HTTP manager, an Ollama backend and `nvidia-smi`.
    pub fn new(config: WorkerConfig) -> Result<Self, WorkerError> {
        let queue = Arc::new(HttpQueueClient::new(&config)?);
        let backend = Arc::new(OllamaBackend::new(&config)?);
        Ok(Self::with_parts(config, queue, backend, Arc::new(NvidiaSmiSampler)))
    }

    pub fn with_parts(
        config: WorkerConfig,
        queue: Arc<dyn QueueApi>,
        backend: Arc<dyn ChatBackend>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        Self {
            config,
            queue,
            backend,
            sampler,
            observer: Arc::new(NoopObserver),
            control: WorkerControl::new(),
            status: StatusHandle::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkerObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_control(mut self, control: WorkerControl) -> Self {
        self.control = control;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.status.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.status.snapshot()
    }

    pub fn pause(&self) {
        if self.control.pause() {
            tracing::info!(worker_id = %self.config.worker_id, "Pausing worker");
            self.set_state(WorkerState::Paused);
        }
    }

    pub fn resume(&self) {
        if self.control.resume() {
            tracing::info!(worker_id = %self.config.worker_id, "Resuming worker");
        }
    }

    pub fn shutdown(&self) {
        tracing::info!(worker_id = %self.config.worker_id, "Shutdown signal received");
        self.control.shutdown();
    }

    /// Register, poll until shutdown, then deregister.
    pub async fn run(&self) {
        let worker_id = self.config.worker_id.clone();
        self.set_state(WorkerState::Starting);
        tracing::info!(
            worker_id = %worker_id,
            queue = %self.config.queue_url,
            model = %self.config.model_name,
            "Worker started"
        );

        self.register().await;
        self.run_loop().await;

        self.set_state(WorkerState::Stopped);
        self.deregister().await;
        tracing::info!(worker_id = %worker_id, "Worker shutdown complete");
    }

    async fn run_loop(&self) {
        let worker_id = self.config.worker_id.as_str();

        while !self.control.is_cancelled() {
            if !self.pass_gate().await {
                break;
            }

            if self.config.check_gpu {
                if let Some(utilization) = self.sampler.sample().await {
                    if utilization > self.config.gpu_threshold {
                        self.set_state(WorkerState::GpuBusy);
                        tracing::info!(
                            worker_id,
                            utilization,
                            threshold = self.config.gpu_threshold,
                            "GPU utilization above threshold; waiting before retry"
                        );
                        self.control.sleep(self.poll_interval()).await;
                        continue;
                    }
                }
            }

            let Some(job) = self.fetch_with_retry().await else {
                if self.control.is_cancelled() {
                    break;
                }
                self.set_state(WorkerState::Idle);
                tracing::debug!(worker_id, "No job available; sleeping before next poll");
                self.control.sleep(self.poll_interval()).await;
                continue;
            };

            let job_id = job
                .get("job_id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string);
            let Some(job_id) = job_id else {
                tracing::error!(worker_id, "Received malformed job payload without job_id");
                self.control.sleep(self.poll_interval()).await;
                continue;
            };

            let span = tracing::info_span!("job", worker_id, job_id = %job_id);
            self.handle_job(&job_id, job).instrument(span).await;
        }
    }

    async fn handle_job(&self, job_id: &str, job: Value) {
        self.set_state(WorkerState::Working);
        self.status.update_stats(|s| s.begin_job(job_id));
        self.observer.on_job_started(job_id);
        tracing::info!(status = "received", "Received job");

        match self.execute(job).await {
            Ok(result) => {
                self.report(JobReport::completed(job_id, result.clone())).await;
                self.status.update_stats(|s| s.record_success());
                self.observer.on_job_completed(job_id, &result);
            }
            Err(message) => {
                tracing::warn!(status = "failed", error = %message, "Job failed");
                self.report(JobReport::failed(job_id, &message)).await;
                self.status.update_stats(|s| s.record_failure());
                self.observer.on_job_failed(job_id, &message);
            }
        }
    }

    /// Run the job against the backend. `Err` carries the failure message to
    /// report. Backend errors are never retried here.
    async fn execute(&self, job: Value) -> Result<Value, String> {
        let messages = match job.get("messages") {
            Some(Value::Array(messages)) if !messages.is_empty() => messages.clone(),
            _ => {
                tracing::error!(status = "error", "Job payload missing `messages` array");
                return Err(NO_RESULT.to_string());
            }
        };

        let backend = Arc::clone(&self.backend);
        let call = tokio::spawn(async move { backend.chat(&messages).await }.in_current_span());

        match call.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(WorkerError::MalformedPayload(detail))) => {
                tracing::error!(status = "backend_error", detail = %detail, "Malformed backend response");
                Err(MALFORMED_RESPONSE.to_string())
            }
            Ok(Err(e)) => {
                tracing::error!(status = "backend_error", error = %e, "Model backend request failed");
                Err(e.to_string())
            }
            Err(e) => {
                let detail = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    "backend task was cancelled".to_string()
                };
                tracing::error!(status = "failed", error = %detail, "Job execution crashed");
                Err(format!("Unexpected error while processing job: {}", detail))
            }
        }
    }

    async fn fetch_with_retry(&self) -> Option<Value> {
        let mut backoff = self.first_backoff();
        loop {
            if !self.pass_gate().await {
                return None;
            }

            match self.queue.fetch_job().await {
                Ok(job) => return job,
                Err(e) => {
                    self.set_state(WorkerState::Retrying);
                    tracing::warn!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        retry_in = ?backoff,
                        "Network error fetching job"
                    );
                    self.observer.on_error(&e.to_string());
                    if !self.control.sleep(backoff).await {
                        return None;
                    }
                    backoff = self.next_backoff(backoff);
                }
            }
        }
    }

    /// Deliver `report`, retrying transient failures. Returns `false` if the
    /// outcome was dropped.
    async fn report(&self, report: JobReport) -> bool {
        let mut backoff = self.first_backoff();
        loop {
            if !self.pass_gate().await {
                tracing::warn!(status = %report.status, "Shutdown before job outcome was reported; dropping it");
                return false;
            }

            match self.queue.report(&report).await {
                Ok(()) => {
                    tracing::info!(status = %report.status, "Reported job status to manager");
                    return true;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        status = %report.status,
                        error = %e,
                        retry_in = ?backoff,
                        "Failed to report job status"
                    );
                    self.observer.on_error(&e.to_string());
                    if !self.control.sleep(backoff).await {
                        tracing::warn!(status = %report.status, "Shutdown before job outcome was reported; dropping it");
                        return false;
                    }
                    backoff = self.next_backoff(backoff);
                }
                Err(e) => {
                    tracing::error!(status = %report.status, error = %e, "Manager rejected job report");
                    self.observer.on_error(&e.to_string());
                    return false;
                }
            }
        }
    }

    fn poll_interval(&self) -> Duration {
        self.config.poll_interval.max(MIN_WAIT)
    }

    fn max_backoff(&self) -> Duration {
        self.config.max_backoff.max(MIN_WAIT)
    }

    fn first_backoff(&self) -> Duration {
        INITIAL_BACKOFF.min(self.max_backoff())
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff())
    }

    /// Wait out a pause. Returns `false` once shutdown is requested.
    async fn pass_gate(&self) -> bool {
        if self.control.is_paused() && !self.control.is_cancelled() {
            self.set_state(WorkerState::Paused);
        }
        self.control.wait_resumed().await
    }

    async fn register(&self) {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        match self.queue.register(&hostname, &self.config.model_name).await {
            Ok(()) => tracing::info!(worker_id = %self.config.worker_id, "Registered worker with manager"),
            Err(e) => tracing::warn!(worker_id = %self.config.worker_id, error = %e, "Failed to register worker"),
        }
    }

    async fn deregister(&self) {
        match self.queue.deregister().await {
            Ok(()) => tracing::info!(worker_id = %self.config.worker_id, "Deregistered worker from manager"),
            Err(e) => tracing::warn!(worker_id = %self.config.worker_id, error = %e, "Failed to deregister worker"),
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.status.set_state(state);
        self.observer.on_status(state);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in model backend".to_string()
    }
}
