use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::ManagerConfig;
use crate::error::{QueueError, Result, StoreError};
use crate::scheduler::job::{ChatMessage, JobRecord, JobStatus, JobView, QueueStats};
use crate::store::{JobStore, StoreOp};

const MAX_RECENT_JOBS: usize = 100;

/// Store key names, all under one namespace prefix.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    pub fn pending(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    pub fn processing(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    pub fn history(&self) -> String {
        format!("{}:history", self.prefix)
    }

    pub fn worker(&self, worker_id: &str) -> String {
        format!("{}:worker:{}", self.prefix, worker_id)
    }

    pub fn workers(&self) -> String {
        format!("{}:workers", self.prefix)
    }
}

/// FIFO job queue over a shared [`JobStore`].
///
/// Holds no job state of its own, so any number of instances (one per API
/// process) can share a store. The store's atomic pop hands each pending id
/// to exactly one caller. No operation retries; retry is the caller's job.
#[derive(Clone)]
pub struct JobQueue {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) keys: KeyLayout,
    job_ttl: Duration,
    block_timeout: Duration,
    history_size: usize,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: &ManagerConfig) -> Self {
        Self {
            store,
            keys: KeyLayout::new(&config.key_prefix),
            job_ttl: config.job_ttl,
            block_timeout: config.block_timeout,
            history_size: config.history_size.max(1),
        }
    }

    /// Create a job and append it to the pending list in one atomic batch.
    pub async fn submit(&self, messages: Vec<ChatMessage>, metadata: Option<Value>) -> Result<String> {
        if messages.is_empty() {
            return Err(QueueError::InvalidInput(
                "`messages` must be a non-empty list.".to_string(),
            ));
        }

        let record = JobRecord::new(messages, metadata);
        let job_id = record.job_id.clone();
        let ops = vec![
            self.save_op(&record)?,
            StoreOp::PushBack {
                list: self.keys.pending(),
                value: job_id.clone(),
            },
        ];

        self.store.execute(ops).await.map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to submit job");
            QueueError::from(e)
        })?;

        tracing::info!(job_id = %job_id, "Submitted job");
        Ok(job_id)
    }

    /// Dequeue using the configured block timeout.
    pub async fn dequeue(&self) -> Result<Option<JobView>> {
        self.dequeue_with_timeout(self.block_timeout).await
    }

    /// Pop the head of the pending list and mark it `processing`.
    ///
    /// Returns `None` when nothing arrives within `block_timeout`, and also when
    /// the popped id has no record (expired or deleted); callers poll again.
    pub async fn dequeue_with_timeout(&self, block_timeout: Duration) -> Result<Option<JobView>> {
        let popped = self
            .store
            .pop_front(&self.keys.pending(), block_timeout)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to fetch next job");
                QueueError::from(e)
            })?;

        let Some(job_id) = popped else {
            return Ok(None);
        };

        let Some(mut record) = self.load(&job_id).await? else {
            tracing::warn!(job_id = %job_id, "Job was missing after dequeue; skipping");
            return Ok(None);
        };

        record.mark_processing();
        self.save(&record).await?;

        self.best_effort(
            StoreOp::SetAdd {
                set: self.keys.processing(),
                member: job_id.clone(),
            },
            &job_id,
            "add job to processing set",
        )
        .await;

        tracing::info!(job_id = %job_id, "Dequeued job for processing");
        Ok(Some(record.view()))
    }

    /// Record the terminal outcome of a job.
    pub async fn complete(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<JobRecord> {
        if !status.is_terminal() {
            return Err(QueueError::InvalidStatus(
                "Completion requires completed or failed status.".to_string(),
            ));
        }

        let mut record = self
            .load(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        record.mark_finished(status, result, error);

        let history = self.keys.history();
        let ops = vec![
            self.save_op(&record)?,
            StoreOp::PushFront {
                list: history.clone(),
                value: job_id.to_string(),
            },
            StoreOp::Trim {
                list: history,
                start: 0,
                stop: self.history_size as i64 - 1,
            },
        ];
        self.store.execute(ops).await.map_err(|e| {
            tracing::error!(job_id, error = %e, "Failed to persist job");
            QueueError::from(e)
        })?;

        self.best_effort(
            StoreOp::SetRemove {
                set: self.keys.processing(),
                member: job_id.to_string(),
            },
            job_id,
            "remove job from processing set",
        )
        .await;

        tracing::info!(job_id, status = %status, "Marked job finished");
        Ok(record)
    }

    pub async fn inspect(&self, job_id: &str) -> Result<JobRecord> {
        self.load(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let counts = async {
            let queued = self.store.list_len(&self.keys.pending()).await?;
            let processing = self.store.set_card(&self.keys.processing()).await?;
            Ok::<_, StoreError>(QueueStats {
                queued_count: queued,
                processing_count: processing,
            })
        };
        counts.await.map_err(|e| {
            tracing::error!(error = %e, "Failed to retrieve stats");
            QueueError::from(e)
        })
    }

    pub async fn health(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Job store health check failed");
                false
            }
        }
    }

    /// Most recently finished jobs, newest first. Expired records are skipped.
    pub async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let limit = limit.clamp(1, MAX_RECENT_JOBS);
        let ids = self
            .store
            .list_range(&self.keys.history(), 0, limit as i64 - 1)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load(&id).await? {
                jobs.push(record);
            }
        }
        Ok(jobs)
    }

    async fn load(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let raw = self.store.get(&self.keys.job(job_id)).await.map_err(|e| {
            tracing::error!(job_id, error = %e, "Failed to load job");
            QueueError::from(e)
        })?;

        raw.map(|data| {
            serde_json::from_str(&data).map_err(|e| {
                tracing::error!(job_id, error = %e, "Stored job record is corrupt");
                QueueError::from(StoreError::Corrupt(format!("job {}: {}", job_id, e)))
            })
        })
        .transpose()
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        let op = self.save_op(record)?;
        self.store.execute(vec![op]).await.map_err(|e| {
            tracing::error!(job_id = %record.job_id, error = %e, "Failed to persist job");
            QueueError::from(e)
        })
    }

    fn save_op(&self, record: &JobRecord) -> Result<StoreOp> {
        let value = serde_json::to_string(record)
            .map_err(|e| QueueError::Unavailable(format!("failed to encode job: {}", e)))?;
        Ok(StoreOp::Set {
            key: self.keys.job(&record.job_id),
            value,
            ttl: Some(self.job_ttl),
        })
    }

    /// Secondary write whose failure only degrades stats accuracy: logged, never
    /// propagated.
    pub(crate) async fn best_effort(&self, op: StoreOp, subject: &str, what: &str) {
        if let Err(e) = self.store.execute(vec![op]).await {
            tracing::warn!(subject, error = %e, "Failed to {}", what);
        }
    }
}
