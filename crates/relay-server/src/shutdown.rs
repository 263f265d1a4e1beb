//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use relay_hub::Hub;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Stops the HTTP listener and the hub together, then bounds the wait for
/// in-flight sessions.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    hub: Hub,
}

impl ShutdownCoordinator {
    /// Coordinator for `hub`.
    pub fn new(hub: Hub) -> Self {
        Self {
            token: CancellationToken::new(),
            hub,
        }
    }

    /// Token cancelled when shutdown starts. The listener stops accepting
    /// once it fires.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start shutdown: stop accepting, refuse admissions, close every live
    /// connection. Idempotent.
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        self.hub.shutdown();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Shut down and wait up to `timeout` for `handles`. Tasks still running
    /// afterwards are aborted. Returns `true` if everything finished in time.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Duration) -> bool {
        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for tasks to complete"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drained = tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_ok();
        if !drained {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for handle in aborts {
                handle.abort();
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{AdmissionError, Identity};
    use relay_settings::HubSettings;

    fn coordinator() -> (ShutdownCoordinator, Hub) {
        let hub = Hub::new(HubSettings::default());
        (ShutdownCoordinator::new(hub.clone()), hub)
    }

    #[test]
    fn initial_state_not_shutting_down() {
        let (coord, hub) = coordinator();
        assert!(!coord.is_shutting_down());
        assert!(!hub.is_shutting_down());
    }

    #[test]
    fn shutdown_cascades_to_hub() {
        let (coord, hub) = coordinator();
        let admission = hub.admit_duplex(Identity::new("u1")).unwrap();
        let token = coord.token();

        coord.shutdown();
        coord.shutdown();

        assert!(token.is_cancelled());
        assert!(hub.is_shutting_down());
        assert!(admission.connection.is_cancelled());
        assert_eq!(
            hub.admit_stream(Identity::new("u2")).unwrap_err(),
            AdmissionError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn graceful_shutdown_waits_for_tasks() {
        let (coord, _hub) = coordinator();
        let token = coord.token();
        let handle = tokio::spawn(async move { token.cancelled().await });
        assert!(coord.graceful_shutdown(vec![handle], Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_times_out() {
        let (coord, _hub) = coordinator();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert!(!coord.graceful_shutdown(vec![handle], Duration::from_secs(5)).await);
    }
}
