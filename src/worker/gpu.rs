use async_trait::async_trait;
use tokio::process::Command;

/// Source of the local utilization figure used for admission control.
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    /// Utilization percentage, or `None` when it cannot be measured.
    async fn sample(&self) -> Option<f64>;
}

/// Reads GPU utilization from `nvidia-smi`.
pub struct NvidiaSmiSampler;

#[async_trait]
impl ResourceSampler for NvidiaSmiSampler {
    async fn sample(&self) -> Option<f64> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=utilization.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await;

        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                tracing::debug!(status = %output.status, "nvidia-smi failed");
                return None;
            }
            Err(e) => {
                tracing::debug!(error = %e, "nvidia-smi unavailable");
                return None;
            }
        };

        let text = String::from_utf8_lossy(&output.stdout);
        let utilization = parse_utilization(&text);
        if utilization.is_none() {
            tracing::debug!(output = %text.trim(), "Could not parse GPU utilization");
        }
        utilization
    }
}

/// Highest per-GPU value in `nvidia-smi` CSV output, one number per line.
///
/// Any unparseable line makes the whole sample unknown.
pub fn parse_utilization(output: &str) -> Option<f64> {
    let mut highest: Option<f64> = None;
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let value: f64 = line.parse().ok()?;
        highest = Some(highest.map_or(value, |h| h.max(value)));
    }
    highest
}
