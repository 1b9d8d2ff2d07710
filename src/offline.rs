//! Offline-aware facade used by the register.
//!
//! Reads go to the admin dashboard while it is reachable and fall back to the
//! local mirror otherwise. Sales go straight to the server when possible and
//! are queued in the local outbox under their client-generated id when not,
//! so a sale is never blocked on the network and never applied twice.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{AdminApiClient, RemoteApi};
use crate::config::SyncConfig;
use crate::credentials::{self, ServerEndpoint};
use crate::db::LocalStore;
use crate::error::{ApiError, StoreError};
use crate::models::{
    new_offline_id, CachedProduct, PendingTransaction, SaleRequest, TransactionStatus,
    TransactionSubmission,
};
use crate::network::{spawn_connectivity_probe, NetworkStatus};
use crate::scheduler::{
    ChannelSource, IntervalSource, ReconnectSource, SyncScheduler, SyncTrigger, TriggerHandle,
    TriggerSource,
};
use crate::sync::{CardResolution, SyncEngine, SyncOutcome, SyncResult};

/// Snapshot of everything the register shows in its connectivity badge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatus {
    pub is_online: bool,
    pub is_ready: bool,
    pub is_syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub product_count: usize,
    pub pending_count: usize,
    pub card_pending_count: usize,
}

/// Result of handing a sale to the facade.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub success: bool,
    /// The sale is queued locally rather than confirmed by the server.
    pub offline: bool,
    pub transaction_id: String,
    pub status: Option<TransactionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct OfflineService {
    store: Arc<LocalStore>,
    api: Arc<dyn RemoteApi>,
    engine: Arc<SyncEngine>,
    network: NetworkStatus,
    config: SyncConfig,
    triggers: Mutex<Option<TriggerHandle>>,
    scheduler: Mutex<Option<SyncScheduler>>,
    probe: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl OfflineService {
    pub fn new(
        store: Arc<LocalStore>,
        api: Arc<dyn RemoteApi>,
        network: NetworkStatus,
        config: SyncConfig,
    ) -> Self {
        let engine = Arc::new(SyncEngine::new(store.clone(), api.clone(), config.clone()));
        Self {
            store,
            api,
            engine,
            network,
            config,
            triggers: Mutex::new(None),
            scheduler: Mutex::new(None),
            probe: Mutex::new(None),
        }
    }

    /// Open the store under `data_dir` and talk to `endpoint` over HTTP.
    ///
    /// A store that fails to open is logged and the service runs online
    /// only; an unusable endpoint is an error.
    pub fn connect(
        data_dir: &Path,
        endpoint: &ServerEndpoint,
        config: SyncConfig,
    ) -> Result<Self, ApiError> {
        let client = AdminApiClient::new(endpoint, &config)?;
        info!(
            url = %client.base_url(),
            terminal_id = %endpoint.terminal_id,
            "Admin dashboard client ready"
        );
        let store = Arc::new(LocalStore::new());
        if !store.init(data_dir) {
            warn!(dir = %data_dir.display(), "Offline store unavailable; running online only");
        }
        Ok(Self::new(
            store,
            Arc::new(client),
            NetworkStatus::new(true),
            config,
        ))
    }

    /// [`connect`](Self::connect) using the endpoint saved in the OS
    /// credential store.
    pub fn from_stored_credentials(data_dir: &Path, config: SyncConfig) -> Result<Self, ApiError> {
        let endpoint = credentials::load_endpoint().ok_or(ApiError::NotConfigured)?;
        Self::connect(data_dir, &endpoint, config)
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the trigger scheduler (interval, reconnect, host triggers) and
    /// kick off an initial cycle when online. Calling it twice is a no-op.
    pub fn start(&self) {
        let Ok(mut scheduler) = self.scheduler.lock() else {
            error!("Scheduler lock poisoned; sync not started");
            return;
        };
        if scheduler.is_some() {
            return;
        }

        let (handle, channel) = ChannelSource::new();
        let sources: Vec<Box<dyn TriggerSource>> = vec![
            Box::new(IntervalSource::new(
                self.config.sync_interval,
                self.network.clone(),
            )),
            Box::new(ReconnectSource::new(&self.network)),
            Box::new(channel),
        ];
        *scheduler = Some(SyncScheduler::start(self.engine.clone(), sources));

        if self.network.is_online() {
            handle.trigger(SyncTrigger::Manual);
        }
        if let Ok(mut triggers) = self.triggers.lock() {
            *triggers = Some(handle);
        }
        info!(
            interval_secs = self.config.sync_interval.as_secs(),
            "Offline service started"
        );
    }

    /// Poll the health endpoint to drive the online flag. Only for hosts
    /// without their own connectivity signal.
    pub fn start_connectivity_probe(&self) {
        let Ok(mut probe) = self.probe.lock() else {
            return;
        };
        if probe.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = spawn_connectivity_probe(
            self.api.clone(),
            self.network.clone(),
            self.config.probe_interval,
            cancel.clone(),
        );
        *probe = Some((cancel, handle));
    }

    /// Stop the scheduler and probe, waiting for an in-flight cycle to end.
    pub async fn shutdown(&self) {
        if let Ok(mut triggers) = self.triggers.lock() {
            triggers.take();
        }
        let scheduler = self.scheduler.lock().ok().and_then(|mut s| s.take());
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        let probe = self.probe.lock().ok().and_then(|mut p| p.take());
        if let Some((cancel, handle)) = probe {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Connectivity probe ended abnormally");
            }
        }
        info!("Offline service stopped");
    }

    // -----------------------------------------------------------------------
    // Status and triggers
    // -----------------------------------------------------------------------

    pub fn status(&self) -> OfflineStatus {
        OfflineStatus {
            is_online: self.network.is_online(),
            is_ready: self.store.is_ready(),
            is_syncing: self.engine.is_syncing(),
            last_sync: self.store.last_sync(),
            product_count: self.store.product_count(),
            pending_count: self.store.pending_count(),
            card_pending_count: self.store.count_by_status(TransactionStatus::CardPending),
        }
    }

    /// Host connectivity callback. Going online fires a reconnect sync once
    /// the service is started.
    pub fn set_online(&self, online: bool) {
        self.network.set_online(online);
    }

    /// The register window became visible again. Returns `false` when the
    /// service is not started.
    pub fn notify_visible(&self) -> bool {
        self.send_trigger(SyncTrigger::BecameVisible)
    }

    /// Ask the scheduler for a cycle without waiting for it.
    pub fn request_sync(&self) -> bool {
        self.send_trigger(SyncTrigger::Manual)
    }

    fn send_trigger(&self, trigger: SyncTrigger) -> bool {
        self.triggers
            .lock()
            .ok()
            .and_then(|t| t.as_ref().map(|h| h.trigger(trigger)))
            .unwrap_or(false)
    }

    /// Run a cycle now and wait for it.
    pub async fn sync_now(&self) -> SyncOutcome {
        self.engine.sync_all().await
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncResult> {
        self.engine.subscribe()
    }

    // -----------------------------------------------------------------------
    // Catalog reads
    // -----------------------------------------------------------------------

    pub async fn search_products(&self, query: &str) -> Vec<CachedProduct> {
        if self.network.is_online() {
            match self.api.search_products(query).await {
                Ok(products) => return products,
                Err(e) => warn!(error = %e, "Remote search failed; using local catalog"),
            }
        }
        self.store.search_products(query, self.config.search_limit)
    }

    /// Scan-code lookup. A server answer (hit or miss) wins; the local mirror
    /// is used only when the server cannot be asked.
    pub async fn product_by_barcode(&self, code: &str) -> Option<CachedProduct> {
        if self.network.is_online() {
            match self.api.lookup_barcode(code).await {
                Ok(found) => return found,
                Err(e) => warn!(error = %e, "Remote lookup failed; using local catalog"),
            }
        }
        self.store.product_by_barcode(code)
    }

    // -----------------------------------------------------------------------
    // Sales
    // -----------------------------------------------------------------------

    /// Record a sale.
    ///
    /// Online, the sale is submitted directly and not stored locally. If the
    /// network is down or the submission fails, it is queued under the same
    /// id, so a submission whose response was lost is deduplicated by the
    /// server on upload. Card sales still awaiting authorization are always
    /// queued as `card_pending` and never sent.
    pub async fn save_transaction(&self, sale: SaleRequest) -> SaveOutcome {
        let now = Utc::now();
        let tx = PendingTransaction::from_sale(new_offline_id(now), sale, now);

        if self.network.is_online() && tx.status == TransactionStatus::Pending {
            let mut submission = TransactionSubmission::from_pending(&tx, &[]);
            submission.offline = false;
            match self.api.submit_transaction(&submission).await {
                Ok(receipt) => {
                    info!(id = %tx.id, total = tx.total, "Sale submitted online");
                    return SaveOutcome {
                        success: true,
                        offline: false,
                        transaction_id: tx.id,
                        status: Some(TransactionStatus::Synced),
                        server_id: receipt.server_id,
                        error: None,
                    };
                }
                Err(e) => warn!(id = %tx.id, error = %e, "Online sale failed; queueing offline"),
            }
        }

        self.queue(tx)
    }

    fn queue(&self, tx: PendingTransaction) -> SaveOutcome {
        match self.store.upsert_transaction(&tx) {
            Ok(()) => {
                if tx.status == TransactionStatus::CardPending {
                    warn!(id = %tx.id, "Card sale queued; card must be presented again online");
                }
                SaveOutcome {
                    success: true,
                    offline: true,
                    transaction_id: tx.id,
                    status: Some(tx.status),
                    server_id: None,
                    error: None,
                }
            }
            Err(e) => {
                error!(id = %tx.id, error = %e, "Sale could not be queued");
                let message = match e {
                    StoreError::NotReady => {
                        "Offline storage unavailable; sale was not saved".to_string()
                    }
                    other => format!("Failed to save sale offline: {other}"),
                };
                SaveOutcome {
                    success: false,
                    offline: true,
                    transaction_id: tx.id,
                    status: None,
                    server_id: None,
                    error: Some(message),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Card sales awaiting authorization
    // -----------------------------------------------------------------------

    pub fn card_pending_transactions(&self) -> Vec<PendingTransaction> {
        self.store.card_pending_transactions()
    }

    pub fn resolve_card_payment(
        &self,
        id: &str,
        resolution: CardResolution,
    ) -> Result<PendingTransaction, StoreError> {
        self.engine.resolve_card_payment(id, resolution)
    }
}
