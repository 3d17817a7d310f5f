use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::scheduler::JobStatus;

const WORKER_HEADER: &str = "X-Worker-ID";

/// Terminal outcome a worker sends to `/complete_job`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    pub fn completed(job_id: &str, result: Value) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(job_id: &str, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
            result: None,
            error: Some(message.to_string()),
        }
    }
}

/// The worker's view of the queue manager.
#[async_trait]
pub trait QueueApi: Send + Sync {
    /// Ask for the next job. `Ok(None)` means nothing to do this interval;
    /// `Err` means the manager could not be reached.
    async fn fetch_job(&self) -> Result<Option<Value>, WorkerError>;

    async fn report(&self, report: &JobReport) -> Result<(), WorkerError>;

    async fn register(&self, hostname: &str, model: &str) -> Result<(), WorkerError>;

    async fn deregister(&self) -> Result<(), WorkerError>;
}

/// [`QueueApi`] over the manager's HTTP endpoints.
pub struct HttpQueueClient {
    client: Client,
    base_url: String,
    worker_id: String,
}

impl HttpQueueClient {
    pub fn new(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| WorkerError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.queue_url.clone(),
            worker_id: config.worker_id.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> Result<(), WorkerError> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .header(WORKER_HEADER, &self.worker_id)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            return Err(WorkerError::Rejected {
                status: status.to_string(),
                url,
            });
        }
        if !status.is_success() {
            return Err(WorkerError::Http {
                status: status.to_string(),
                url,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QueueApi for HttpQueueClient {
    async fn fetch_job(&self) -> Result<Option<Value>, WorkerError> {
        let url = self.url("get_job");
        let response = self
            .client
            .post(&url)
            .header(WORKER_HEADER, &self.worker_id)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            tracing::warn!(status = %status, url = %url, "Manager returned an error for job fetch");
            return Ok(None);
        }

        match response.json::<Value>().await {
            Ok(job) => Ok(Some(job)),
            Err(e) if e.is_decode() => {
                tracing::error!(error = %e, "Failed to decode job JSON");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn report(&self, report: &JobReport) -> Result<(), WorkerError> {
        self.post("complete_job", report).await
    }

    async fn register(&self, hostname: &str, model: &str) -> Result<(), WorkerError> {
        let body = json!({
            "worker_id": self.worker_id,
            "hostname": hostname,
            "model": model,
        });
        self.post("register_worker", &body).await
    }

    async fn deregister(&self) -> Result<(), WorkerError> {
        self.post("deregister_worker", &json!({ "worker_id": self.worker_id }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_omit_absent_fields() {
        let ok = serde_json::to_value(JobReport::completed("j1", json!({"message": {}}))).unwrap();
        assert_eq!(ok["status"], "completed");
        assert!(ok.get("error").is_none());

        let failed = serde_json::to_value(JobReport::failed("j1", "boom")).unwrap();
        assert_eq!(failed, json!({"job_id": "j1", "status": "failed", "error": "boom"}));
    }
}
