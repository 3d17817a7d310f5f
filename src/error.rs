use thiserror::Error;

/// Failures raised by a [`JobStore`](crate::store::JobStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Corrupt store entry: {0}")]
    Corrupt(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        QueueError::Unavailable(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status} from {url}")]
    Http { status: String, url: String },

    /// The manager refused the request outright (4xx); resending cannot help.
    #[error("Request to {url} rejected with HTTP {status}")]
    Rejected { status: String, url: String },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Startup check failed: {0}")]
    Startup(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    /// Connectivity failures that the fetch/report boundary retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::Network(_) | WorkerError::Http { .. })
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            WorkerError::MalformedPayload(e.to_string())
        } else {
            WorkerError::Network(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
