//! Sync engine: reconciles the terminal's local store with the admin
//! dashboard.
//!
//! A cycle runs four independent phases (catalog download, outbox upload,
//! retention sweep, bookkeeping). A phase that fails is logged and the
//! cycle carries on. At most one cycle runs at a time; a trigger arriving
//! while one is in flight is dropped and reported as [`SyncOutcome::NotStarted`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::RemoteApi;
use crate::config::SyncConfig;
use crate::db::LocalStore;
use crate::error::{StoreError, SyncError};
use crate::models::{
    CardData, PendingTransaction, PriceConflict, TransactionStatus, TransactionSubmission,
};

const EVENT_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Summary of one sync cycle, delivered to listeners and returned to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub synced: usize,
    pub failed: usize,
    pub cards_pending: usize,
    pub price_conflicts: Vec<PriceConflict>,
    /// Products in the replaced catalog; `None` when the download failed.
    pub catalog_size: Option<usize>,
    pub purged: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Another cycle was already running.
    NotStarted,
    Completed(SyncResult),
}

impl SyncOutcome {
    pub fn started(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }

    pub fn result(&self) -> Option<&SyncResult> {
        match self {
            SyncOutcome::Completed(r) => Some(r),
            SyncOutcome::NotStarted => None,
        }
    }
}

/// Operator decision for a card sale that could not be authorized offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardResolution {
    /// Card was re-presented and approved; the sale joins the outbox.
    Authorized { reference: String },
    Declined { reason: String },
}

/// Clears the single-flight flag however the cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    store: Arc<LocalStore>,
    api: Arc<dyn RemoteApi>,
    config: SyncConfig,
    is_running: AtomicBool,
    events: broadcast::Sender<SyncResult>,
}

impl SyncEngine {
    pub fn new(store: Arc<LocalStore>, api: Arc<dyn RemoteApi>, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            api,
            config,
            is_running: AtomicBool::new(false),
            events,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Receive the result of every completed cycle.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncResult> {
        self.events.subscribe()
    }

    /// Run one full sync cycle unless one is already in flight.
    pub async fn sync_all(&self) -> SyncOutcome {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync already in progress; trigger collapsed");
            return SyncOutcome::NotStarted;
        }
        let _guard = RunningGuard(&self.is_running);

        let result = match self.run_cycle().await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Sync cycle aborted");
                self.store
                    .append_sync_log("sync_error", json!({ "error": e.to_string() }));
                SyncResult::default()
            }
        };

        // No receivers is fine.
        let _ = self.events.send(result.clone());
        SyncOutcome::Completed(result)
    }

    async fn run_cycle(&self) -> Result<SyncResult, SyncError> {
        if !self.store.is_ready() {
            return Err(StoreError::NotReady.into());
        }
        let mut result = SyncResult::default();

        result.catalog_size = match self.download_catalog().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Catalog download failed; keeping cached catalog");
                self.store
                    .append_sync_log("catalog_download_failed", json!({ "error": e.to_string() }));
                None
            }
        };

        self.upload_pending(&mut result).await;

        // Card sales wait for a person with the card; count only.
        result.cards_pending = self.store.count_by_status(TransactionStatus::CardPending);
        if result.cards_pending > 0 {
            info!(
                cards_pending = result.cards_pending,
                "Card sales awaiting manual authorization"
            );
        }

        result.purged = self.store.purge_synced_older_than(self.config.retention);

        if let Err(e) = self.store.set_last_sync(Utc::now()) {
            warn!(error = %e, "Failed to record last sync time");
        }
        self.store.append_sync_log(
            "sync_complete",
            json!({
                "catalogSize": result.catalog_size,
                "synced": result.synced,
                "failed": result.failed,
                "cardsPending": result.cards_pending,
                "priceConflicts": result.price_conflicts.len(),
                "purged": result.purged,
            }),
        );

        result.success = true;
        if result.synced > 0 || result.failed > 0 {
            info!(
                synced = result.synced,
                failed = result.failed,
                cards_pending = result.cards_pending,
                "Sync cycle complete"
            );
        } else {
            debug!("Sync cycle complete; outbox empty");
        }
        Ok(result)
    }

    async fn download_catalog(&self) -> Result<usize, SyncError> {
        let products = self.api.fetch_catalog().await?;
        Ok(self.store.replace_products(&products)?)
    }

    /// Upload the outbox oldest first. A failed submission leaves its row
    /// pending and moves on to the next one.
    async fn upload_pending(&self, result: &mut SyncResult) {
        for tx in self.store.pending_transactions() {
            let conflicts = self
                .store
                .detect_price_conflicts(&tx.price_checks(), self.config.price_epsilon);
            if !conflicts.is_empty() {
                warn!(
                    id = %tx.id,
                    conflicts = conflicts.len(),
                    "Offline prices differ from current catalog"
                );
                if let Err(e) = self.store.record_price_conflicts(&tx.id, &conflicts) {
                    warn!(id = %tx.id, error = %e, "Failed to store price conflicts");
                }
            }

            let submission = TransactionSubmission::from_pending(&tx, &conflicts);
            result.price_conflicts.extend(conflicts);

            match self.api.submit_transaction(&submission).await {
                Ok(receipt) => {
                    if receipt.duplicate {
                        info!(id = %tx.id, "Server already had transaction; marking synced");
                    }
                    match self.store.mark_synced(&tx.id, receipt.server_id.as_deref()) {
                        Ok(_) => result.synced += 1,
                        Err(e) => {
                            // Server has it; the retry next cycle is deduplicated.
                            warn!(id = %tx.id, error = %e, "Uploaded but failed to mark synced");
                            result.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(id = %tx.id, error = %e, "Transaction upload failed; will retry");
                    result.failed += 1;
                    if let Err(store_err) = self.store.record_failed_attempt(&tx.id, &e.to_string())
                    {
                        warn!(id = %tx.id, error = %store_err, "Failed to record upload attempt");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Operator transitions
    // -----------------------------------------------------------------------

    /// Settle a `card_pending` sale after the card was handled at a live
    /// terminal.
    pub fn resolve_card_payment(
        &self,
        id: &str,
        resolution: CardResolution,
    ) -> Result<PendingTransaction, StoreError> {
        let from = [TransactionStatus::CardPending];
        let tx = match resolution {
            CardResolution::Authorized { reference } => {
                let note = format!("authorized: {reference}");
                self.store.transition_transaction(id, &from, Some(&note), |tx| {
                    tx.status = TransactionStatus::Pending;
                    tx.last_error = None;
                    let card = tx.card_data.get_or_insert_with(CardData::default);
                    card.requires_processing = false;
                    card.authorization_code = Some(reference);
                })?
            }
            CardResolution::Declined { reason } => {
                let note = format!("declined: {reason}");
                self.store.transition_transaction(id, &from, Some(&note), |tx| {
                    tx.status = TransactionStatus::Failed;
                    tx.last_error = Some(reason);
                })?
            }
        };
        self.store.append_sync_log(
            "card_resolved",
            json!({ "id": tx.id, "status": tx.status.as_str() }),
        );
        Ok(tx)
    }

    /// Give up on a pending sale that the server will never accept.
    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<PendingTransaction, StoreError> {
        let tx = self.store.transition_transaction(
            id,
            &[TransactionStatus::Pending],
            Some(reason),
            |tx| {
                tx.status = TransactionStatus::Failed;
                tx.last_error = Some(reason.to_string());
            },
        )?;
        self.store
            .append_sync_log("transaction_failed", json!({ "id": id, "reason": reason }));
        Ok(tx)
    }
}
