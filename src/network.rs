//! Connectivity state shared by the facade and the scheduler.
//!
//! The host feeds its own signals in through [`NetworkStatus::set_online`];
//! terminals without one can run a [`spawn_connectivity_probe`] loop that
//! polls the admin health endpoint instead.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::RemoteApi;

/// Reactive online/offline flag.
#[derive(Clone)]
pub struct NetworkStatus {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkStatus {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the flag. Returns `true` when the value actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("Network restored; resuming queued sync");
            } else {
                info!("Network offline; deferring remote sync and keeping queue pending");
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Poll `api.health_check()` every `interval` and mirror the result into
/// `status` until `cancel` fires.
pub fn spawn_connectivity_probe(
    api: Arc<dyn RemoteApi>,
    status: NetworkStatus,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Connectivity probe started (interval: {}s)", interval.as_secs());
        loop {
            let online = tokio::select! {
                _ = cancel.cancelled() => break,
                online = api.health_check() => online,
            };
            status.set_online(online);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Connectivity probe stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;

    #[test]
    fn test_set_online_reports_changes_only() {
        let status = NetworkStatus::new(false);
        assert!(!status.is_online());
        assert!(status.set_online(true));
        assert!(!status.set_online(true));
        assert!(status.is_online());
        assert!(status.set_online(false));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let status = NetworkStatus::new(false);
        let mut rx = status.subscribe();
        status.set_online(true);
        rx.changed().await.expect("sender alive");
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_probe_mirrors_health_check() {
        let server = Arc::new(FakeServer::new());
        server.set_reachable(true);
        let status = NetworkStatus::new(false);
        let mut rx = status.subscribe();
        let cancel = CancellationToken::new();

        let handle = spawn_connectivity_probe(
            server.clone(),
            status.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );
        rx.changed().await.expect("probe update");
        assert!(status.is_online());

        server.set_reachable(false);
        rx.changed().await.expect("probe update");
        assert!(!status.is_online());

        cancel.cancel();
        handle.await.expect("probe exits cleanly");
    }
}
