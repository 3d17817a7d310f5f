use std::net::SocketAddr;
use std::time::Duration;

use crate::error::WorkerError;

/// Which job store backend the manager talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Shared Redis instance; required when several managers share a queue.
    Redis,
    /// Process-local store. Jobs do not survive a restart.
    Memory,
}

/// Configuration for the queue manager (HTTP API + job store).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreKind,
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379/0`
    pub redis_url: String,
    /// How long `/get_job` blocks waiting for work. Zero means non-blocking.
    pub block_timeout: Duration,
    /// Expiry applied to every job record write
    pub job_ttl: Duration,
    /// Number of finished job ids kept for `/recent_jobs`
    pub history_size: usize,
    /// Namespace for all store keys
    pub key_prefix: String,
    /// Log full payloads and results instead of previews
    pub debug_payloads: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "0.0.0.0:5000"
                .parse()
                .expect("default listen address is valid"),
            store: StoreKind::Redis,
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            block_timeout: Duration::from_secs(5),
            job_ttl: Duration::from_secs(3600),
            history_size: 50,
            key_prefix: "infer".to_string(),
            debug_payloads: false,
        }
    }
}

impl ManagerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_job_ttl(mut self, ttl: Duration) -> Self {
        self.job_ttl = ttl;
        self
    }

    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }
}

/// Runtime configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the queue manager
    pub queue_url: String,
    /// Chat endpoint of the model-serving backend
    pub backend_url: String,
    pub model_name: String,
    pub worker_id: String,
    pub poll_interval: Duration,
    /// GPU utilization percentage above which polling is deferred
    pub gpu_threshold: f64,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
    pub check_gpu: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_url: "http://localhost:5000".to_string(),
            backend_url: "http://localhost:11434/api/chat".to_string(),
            model_name: "phi4-mini".to_string(),
            worker_id: default_worker_id(),
            poll_interval: Duration::from_secs(2),
            gpu_threshold: 30.0,
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            check_gpu: true,
        }
    }
}

impl WorkerConfig {
    pub fn new(queue_url: &str, backend_url: &str, model_name: &str) -> Self {
        Self {
            queue_url: trim_url(queue_url),
            backend_url: trim_url(backend_url),
            model_name: model_name.to_string(),
            ..Default::default()
        }
    }

    /// Use `worker_id` unless it is blank, in which case keep the hostname default.
    pub fn with_worker_id(mut self, worker_id: &str) -> Self {
        if !worker_id.trim().is_empty() {
            self.worker_id = worker_id.trim().to_string();
        }
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_gpu_threshold(mut self, threshold: f64) -> Self {
        self.gpu_threshold = threshold;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_gpu_check(mut self, enabled: bool) -> Self {
        self.check_gpu = enabled;
        self
    }
}

/// Parse a duration given in seconds. Zero, negative, non-finite and
/// out-of-range values are rejected.
pub fn parse_seconds(name: &str, value: f64) -> Result<Duration, WorkerError> {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| {
            WorkerError::Config(format!("`{}` must be a positive number of seconds", name))
        })
}

fn default_worker_id() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn trim_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_config_default() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:5000");
        assert_eq!(cfg.store, StoreKind::Redis);
        assert_eq!(cfg.block_timeout, Duration::from_secs(5));
        assert_eq!(cfg.job_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.history_size, 50);
        assert_eq!(cfg.key_prefix, "infer");
        assert!(!cfg.debug_payloads);
    }

    #[test]
    fn manager_config_builders() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = ManagerConfig::new(addr)
            .with_block_timeout(Duration::ZERO)
            .with_job_ttl(Duration::from_secs(60))
            .with_history_size(5);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.block_timeout, Duration::ZERO);
        assert_eq!(cfg.job_ttl, Duration::from_secs(60));
        assert_eq!(cfg.history_size, 5);
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.queue_url, "http://localhost:5000");
        assert_eq!(cfg.backend_url, "http://localhost:11434/api/chat");
        assert_eq!(cfg.model_name, "phi4-mini");
        assert!(!cfg.worker_id.is_empty());
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.gpu_threshold, 30.0);
        assert_eq!(cfg.max_backoff, Duration::from_secs(30));
        assert!(cfg.check_gpu);
    }

    #[test]
    fn worker_config_trims_trailing_slashes() {
        let cfg = WorkerConfig::new("http://manager:5000/", "http://gpu:11434/api/chat/", "llama3");
        assert_eq!(cfg.queue_url, "http://manager:5000");
        assert_eq!(cfg.backend_url, "http://gpu:11434/api/chat");
        assert_eq!(cfg.model_name, "llama3");
    }

    #[test]
    fn parse_seconds_accepts_positive_values() {
        assert_eq!(parse_seconds("poll_interval", 2.0).unwrap(), Duration::from_secs(2));
        assert_eq!(
            parse_seconds("poll_interval", 0.25).unwrap(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn parse_seconds_rejects_zero_and_out_of_range() {
        for value in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e30, 1e-12] {
            let err = parse_seconds("max_backoff", value).unwrap_err();
            assert!(matches!(err, WorkerError::Config(ref msg) if msg.contains("max_backoff")));
        }
    }

    #[test]
    fn blank_worker_id_keeps_hostname() {
        let host = WorkerConfig::default().worker_id;
        let cfg = WorkerConfig::default().with_worker_id("   ");
        assert_eq!(cfg.worker_id, host);

        let cfg = WorkerConfig::default().with_worker_id("gpu-box-1");
        assert_eq!(cfg.worker_id, "gpu-box-1");
    }
}
