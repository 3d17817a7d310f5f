use serde_json::{Map, Value};

use crate::error::{QueueError, Result};
use crate::scheduler::job::{timestamp, WorkerRecord};
use crate::scheduler::queue::JobQueue;
use crate::store::StoreOp;

/// Connected-worker bookkeeping. Observability only: dispatch never consults
/// it, and a worker that dies without deregistering stays listed.
impl JobQueue {
    pub async fn register_worker(
        &self,
        worker_id: &str,
        metadata: Map<String, Value>,
    ) -> Result<WorkerRecord> {
        if worker_id.trim().is_empty() {
            return Err(QueueError::InvalidInput("`worker_id` is required.".to_string()));
        }

        let record = WorkerRecord {
            worker_id: worker_id.to_string(),
            metadata,
            registered_at: timestamp(),
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| QueueError::Unavailable(format!("failed to encode worker: {}", e)))?;

        self.store
            .execute(vec![
                StoreOp::Set {
                    key: self.keys.worker(worker_id),
                    value,
                    ttl: None,
                },
                StoreOp::SetAdd {
                    set: self.keys.workers(),
                    member: worker_id.to_string(),
                },
            ])
            .await
            .map_err(|e| {
                tracing::error!(worker_id, error = %e, "Failed to register worker");
                QueueError::from(e)
            })?;

        tracing::info!(worker_id, "Worker registered");
        Ok(record)
    }

    pub async fn deregister_worker(&self, worker_id: &str) -> Result<()> {
        if worker_id.trim().is_empty() {
            return Err(QueueError::InvalidInput("`worker_id` is required.".to_string()));
        }

        self.store
            .execute(vec![
                StoreOp::Delete {
                    key: self.keys.worker(worker_id),
                },
                StoreOp::SetRemove {
                    set: self.keys.workers(),
                    member: worker_id.to_string(),
                },
            ])
            .await
            .map_err(|e| {
                tracing::error!(worker_id, error = %e, "Failed to deregister worker");
                QueueError::from(e)
            })?;

        tracing::info!(worker_id, "Worker deregistered");
        Ok(())
    }

    /// All registered workers, sorted by id. Set members whose record is gone
    /// or unreadable are skipped.
    pub async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let ids = self.store.set_members(&self.keys.workers()).await?;

        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(raw) = self.store.get(&self.keys.worker(&id)).await? else {
                continue;
            };
            match serde_json::from_str::<WorkerRecord>(&raw) {
                Ok(record) => workers.push(record),
                Err(e) => tracing::warn!(worker_id = %id, error = %e, "Skipping unreadable worker record"),
            }
        }
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }
}
