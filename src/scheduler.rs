//! Trigger fan-in for the sync engine.
//!
//! Every [`TriggerSource`] is forwarded into one queue and each trigger
//! starts `SyncEngine::sync_all`. Bursts (Wi-Fi reconnect firing several
//! signals at once) collapse into a single cycle through the engine's
//! single-flight guard.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::network::NetworkStatus;
use crate::sync::{SyncEngine, SyncOutcome};

const TRIGGER_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Interval,
    Reconnected,
    BecameVisible,
    Manual,
}

/// Anything that can ask for a sync. `None` means the source is exhausted.
#[async_trait]
pub trait TriggerSource: Send {
    async fn next_trigger(&mut self) -> Option<SyncTrigger>;
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Fixed-period timer that stays silent while the network is down.
pub struct IntervalSource {
    interval: tokio::time::Interval,
    network: NetworkStatus,
}

impl IntervalSource {
    pub fn new(period: Duration, network: NetworkStatus) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, network }
    }
}

#[async_trait]
impl TriggerSource for IntervalSource {
    async fn next_trigger(&mut self) -> Option<SyncTrigger> {
        loop {
            self.interval.tick().await;
            if self.network.is_online() {
                return Some(SyncTrigger::Interval);
            }
        }
    }
}

/// Fires on every offline -> online edge of a [`NetworkStatus`].
pub struct ReconnectSource {
    rx: watch::Receiver<bool>,
    online: bool,
}

impl ReconnectSource {
    pub fn new(network: &NetworkStatus) -> Self {
        let rx = network.subscribe();
        let online = *rx.borrow();
        Self { rx, online }
    }
}

#[async_trait]
impl TriggerSource for ReconnectSource {
    async fn next_trigger(&mut self) -> Option<SyncTrigger> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            let now = *self.rx.borrow_and_update();
            let was = std::mem::replace(&mut self.online, now);
            if now && !was {
                return Some(SyncTrigger::Reconnected);
            }
        }
    }
}

/// Host-driven triggers (visibility changes, manual "sync now" buttons,
/// OS connectivity callbacks).
pub struct ChannelSource {
    rx: mpsc::Receiver<SyncTrigger>,
}

/// Sending half of a [`ChannelSource`].
#[derive(Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<SyncTrigger>,
}

impl ChannelSource {
    pub fn new() -> (TriggerHandle, ChannelSource) {
        let (tx, rx) = mpsc::channel(TRIGGER_QUEUE);
        (TriggerHandle { tx }, ChannelSource { rx })
    }
}

#[async_trait]
impl TriggerSource for ChannelSource {
    async fn next_trigger(&mut self) -> Option<SyncTrigger> {
        self.rx.recv().await
    }
}

impl TriggerHandle {
    /// Queue a trigger. Returns `false` when the scheduler is gone or
    /// already has a full backlog, which the single-flight guard would
    /// collapse anyway.
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        match self.tx.try_send(trigger) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(?trigger, "Trigger backlog full; dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn became_visible(&self) -> bool {
        self.trigger(SyncTrigger::BecameVisible)
    }

    pub fn manual(&self) -> bool {
        self.trigger(SyncTrigger::Manual)
    }

    pub fn reconnected(&self) -> bool {
        self.trigger(SyncTrigger::Reconnected)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Running scheduler. Dropping it cancels the loop; [`shutdown`](Self::shutdown)
/// also waits for in-flight cycles to finish.
pub struct SyncScheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncScheduler {
    pub fn start(engine: Arc<SyncEngine>, sources: Vec<Box<dyn TriggerSource>>) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(TRIGGER_QUEUE);
        let mut tasks = Vec::with_capacity(sources.len() + 1);

        info!(sources = sources.len(), "Sync scheduler started");
        for source in sources {
            tasks.push(tokio::spawn(forward(source, tx.clone(), cancel.clone())));
        }
        drop(tx);
        tasks.push(tokio::spawn(run_loop(engine, rx, cancel.clone())));

        Self { cancel, tasks }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        info!("Sync scheduler stopped");
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward(
    mut source: Box<dyn TriggerSource>,
    tx: mpsc::Sender<SyncTrigger>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = source.next_trigger() => next,
        };
        match next {
            Some(trigger) => {
                if tx.send(trigger).await.is_err() {
                    break;
                }
            }
            None => break,
        }
    }
}

async fn run_loop(
    engine: Arc<SyncEngine>,
    mut rx: mpsc::Receiver<SyncTrigger>,
    cancel: CancellationToken,
) {
    let mut cycles = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = cycles.join_next(), if !cycles.is_empty() => {}
            trigger = rx.recv() => {
                let Some(trigger) = trigger else { break };
                debug!(?trigger, "Sync triggered");
                let engine = engine.clone();
                cycles.spawn(async move {
                    if engine.sync_all().await == SyncOutcome::NotStarted {
                        debug!(?trigger, "Sync already running; trigger absorbed");
                    }
                });
            }
        }
    }
    while cycles.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::db::memory_store;
    use crate::testing::{product, FakeServer};

    const WAIT: Duration = Duration::from_millis(200);

    fn engine(server: &Arc<FakeServer>) -> Arc<SyncEngine> {
        Arc::new(SyncEngine::new(
            Arc::new(memory_store()),
            server.clone(),
            SyncConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_interval_source_silent_while_offline() {
        let network = NetworkStatus::new(false);
        let mut source = IntervalSource::new(Duration::from_millis(10), network.clone());

        assert!(tokio::time::timeout(Duration::from_millis(60), source.next_trigger())
            .await
            .is_err());

        network.set_online(true);
        let fired = tokio::time::timeout(WAIT, source.next_trigger()).await;
        assert_eq!(fired.ok().flatten(), Some(SyncTrigger::Interval));
    }

    #[tokio::test]
    async fn test_reconnect_source_fires_on_rising_edge_only() {
        let network = NetworkStatus::new(true);
        let mut source = ReconnectSource::new(&network);

        network.set_online(false);
        assert!(tokio::time::timeout(Duration::from_millis(30), source.next_trigger())
            .await
            .is_err());

        network.set_online(true);
        let fired = tokio::time::timeout(WAIT, source.next_trigger()).await;
        assert_eq!(fired.ok().flatten(), Some(SyncTrigger::Reconnected));
    }

    #[tokio::test]
    async fn test_channel_source_yields_host_triggers() {
        let (handle, mut source) = ChannelSource::new();
        assert!(handle.became_visible());
        assert!(handle.manual());
        assert_eq!(source.next_trigger().await, Some(SyncTrigger::BecameVisible));
        assert_eq!(source.next_trigger().await, Some(SyncTrigger::Manual));

        drop(handle);
        assert_eq!(source.next_trigger().await, None);
    }

    #[tokio::test]
    async fn test_manual_trigger_runs_a_cycle() {
        let server = Arc::new(FakeServer::with_catalog(vec![product("p1", "Milk", 5.0)]));
        let engine = engine(&server);
        let mut results = engine.subscribe();
        let (handle, source) = ChannelSource::new();
        let scheduler = SyncScheduler::start(engine.clone(), vec![Box::new(source)]);

        handle.manual();
        let result = tokio::time::timeout(WAIT, results.recv())
            .await
            .expect("cycle finished in time")
            .expect("result delivered");

        assert!(result.success);
        assert_eq!(result.catalog_size, Some(1));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_burst_collapses_into_one_cycle() {
        let server = Arc::new(FakeServer::new());
        let (entered, release) = server.gate_catalog();
        let engine = engine(&server);
        let (handle, source) = ChannelSource::new();
        let scheduler = SyncScheduler::start(engine.clone(), vec![Box::new(source)]);

        handle.reconnected();
        entered.notified().await;
        handle.became_visible();
        handle.manual();
        handle.reconnected();
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();

        scheduler.shutdown().await;
        assert_eq!(server.catalog_calls(), 1);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_shutdown_stops_forwarding() {
        let server = Arc::new(FakeServer::new());
        let engine = engine(&server);
        let (handle, source) = ChannelSource::new();
        let scheduler = SyncScheduler::start(engine, vec![Box::new(source)]);
        assert!(scheduler.is_running());

        scheduler.shutdown().await;
        assert!(!handle.manual());
        assert_eq!(server.catalog_calls(), 0);
    }
}
