use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Pause gate and cancellation flag shared between a worker loop and whoever
/// drives it.
///
/// Every wait in the loop goes through [`WorkerControl::sleep`] or
/// [`WorkerControl::wait_resumed`], both of which return as soon as shutdown
/// is requested.
#[derive(Clone)]
pub struct WorkerControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Tie the worker's lifetime to an existing token (e.g. a signal handler).
    pub fn with_token(cancel: CancellationToken) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel,
            paused: Arc::new(paused),
        }
    }

    /// Returns `true` if the worker was running.
    pub fn pause(&self) -> bool {
        !self.paused.send_replace(true)
    }

    /// Returns `true` if the worker was paused.
    pub fn resume(&self) -> bool {
        self.paused.send_replace(false)
    }

    /// Request shutdown and open the pause gate so a paused loop can exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Block while paused. Returns `false` if shutdown was requested.
    pub async fn wait_resumed(&self) -> bool {
        let mut paused = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return !self.cancel.is_cancelled();
                    }
                }
            }
        }
    }

    /// Sleep for `duration`. Returns `false` if interrupted by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => !self.cancel.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_is_interrupted_by_shutdown() {
        let control = WorkerControl::new();
        let sleeper = control.clone();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        control.shutdown();
        assert!(!handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_when_not_cancelled() {
        let control = WorkerControl::new();
        assert!(control.sleep(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn paused_gate_releases_on_resume() {
        let control = WorkerControl::new();
        assert!(control.pause());
        assert!(!control.pause());

        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_resumed().await });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        assert!(control.resume());
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_opens_paused_gate() {
        let control = WorkerControl::new();
        control.pause();

        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_resumed().await });
        control.shutdown();

        assert!(!handle.await.unwrap());
        assert!(!control.is_paused());
    }
}
