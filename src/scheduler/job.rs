use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status `{}`", other)),
        }
    }
}

/// One chat turn. Fields beyond `role`/`content` (images, tool calls) are
/// carried through untouched. A missing role stays absent on the wire, and
/// a missing or null content reads as empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            extra: Map::new(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self::new("user", content)
    }
}

/// Authoritative job state as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub metadata: Option<Value>,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub completed_at: Option<f64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(messages: Vec<ChatMessage>, metadata: Option<Value>) -> Self {
        let now = timestamp();
        Self {
            job_id: Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            messages,
            metadata,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// `queued -> processing`. Sets `started_at` and `updated_at` together.
    pub fn mark_processing(&mut self) {
        let now = timestamp();
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// `processing -> completed|failed`. Sets `completed_at` with the status.
    pub fn mark_finished(&mut self, status: JobStatus, result: Option<Value>, error: Option<String>) {
        let now = timestamp();
        self.status = status;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.result = result;
        self.error = error;
    }

    /// The reduced view handed to a worker on dequeue.
    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.job_id.clone(),
            messages: self.messages.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    pub messages: Vec<ChatMessage>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    #[serde(rename = "queued")]
    pub queued_count: usize,
    #[serde(rename = "processing")]
    pub processing_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub registered_at: f64,
}

/// Seconds since the Unix epoch with microsecond precision.
pub fn timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
