//! In-process stand-in for the admin dashboard used by the test suites.
//!
//! Deduplicates submissions on `offlineId` the way the real server does, and
//! can be scripted to fail, drop responses, or park a catalog download.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::api::RemoteApi;
use crate::error::ApiError;
use crate::models::{
    CachedProduct, CardData, LineItem, SaleRequest, SubmitReceipt, TransactionSubmission,
};

pub(crate) fn product(id: &str, name: &str, price: f64) -> CachedProduct {
    CachedProduct {
        id: id.into(),
        barcode: Some(format!("0{id}")),
        name: name.into(),
        price,
        card_price: None,
        category: Some("Grocery".into()),
        taxable: true,
        in_stock: true,
        image_url: None,
    }
}

pub(crate) fn line(product_id: &str, quantity: u32, charged_price: f64) -> LineItem {
    LineItem {
        product_id: product_id.into(),
        name: format!("Item {product_id}"),
        quantity,
        unit_price: charged_price,
        charged_price,
    }
}

/// Untaxed cash sale over `items`.
pub(crate) fn cash_sale(items: Vec<LineItem>) -> SaleRequest {
    let total: f64 = items.iter().map(LineItem::line_total).sum();
    SaleRequest {
        items,
        subtotal: total,
        tax: 0.0,
        total,
        payment_method: "cash".into(),
        employee_id: Some("emp-1".into()),
        station_id: Some("station-1".into()),
        card_data: None,
        offline_waiver: None,
    }
}

/// Card sale taken while the reader could not authorize.
pub(crate) fn unauthorized_card_sale(items: Vec<LineItem>) -> SaleRequest {
    SaleRequest {
        payment_method: "card".into(),
        card_data: Some(CardData {
            brand: Some("visa".into()),
            last4: Some("4242".into()),
            entry_mode: Some("chip".into()),
            authorization_code: None,
            requires_processing: true,
        }),
        ..cash_sale(items)
    }
}

#[derive(Default)]
struct FakeState {
    reachable: bool,
    catalog: Vec<CachedProduct>,
    catalog_fails: bool,
    failing_ids: HashSet<String>,
    lose_response_ids: HashSet<String>,
    lose_next_response: bool,
    accepted: Vec<TransactionSubmission>,
    catalog_calls: usize,
    submit_calls: usize,
    catalog_gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

pub(crate) struct FakeServer {
    state: Mutex<FakeState>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                reachable: true,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn with_catalog(catalog: Vec<CachedProduct>) -> Self {
        let server = Self::new();
        server.set_catalog(catalog);
        server
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake server state")
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    pub(crate) fn set_catalog(&self, catalog: Vec<CachedProduct>) {
        self.state().catalog = catalog;
    }

    pub(crate) fn fail_catalog(&self, fail: bool) {
        self.state().catalog_fails = fail;
    }

    pub(crate) fn fail_submissions_for(&self, offline_id: &str) {
        self.state().failing_ids.insert(offline_id.to_string());
    }

    pub(crate) fn heal_submissions_for(&self, offline_id: &str) {
        self.state().failing_ids.remove(offline_id);
    }

    /// Accept the next submission of `offline_id` but report a dropped
    /// connection to the caller.
    pub(crate) fn lose_response_for(&self, offline_id: &str) {
        self.state().lose_response_ids.insert(offline_id.to_string());
    }

    /// Accept the next submission, whatever its id, and drop the response.
    pub(crate) fn lose_next_response(&self) {
        self.state().lose_next_response = true;
    }

    /// Park the next catalog downloads until `release` is notified.
    /// Returns `(entered, release)`.
    pub(crate) fn gate_catalog(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.state().catalog_gate = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    pub(crate) fn accepted_ids(&self) -> Vec<String> {
        self.state()
            .accepted
            .iter()
            .map(|s| s.offline_id.clone())
            .collect()
    }

    pub(crate) fn accepted(&self, offline_id: &str) -> Option<TransactionSubmission> {
        self.state()
            .accepted
            .iter()
            .find(|s| s.offline_id == offline_id)
            .cloned()
    }

    pub(crate) fn catalog_calls(&self) -> usize {
        self.state().catalog_calls
    }

    pub(crate) fn submit_calls(&self) -> usize {
        self.state().submit_calls
    }

    fn ensure_reachable(&self) -> Result<(), ApiError> {
        if self.state().reachable {
            Ok(())
        } else {
            Err(ApiError::Network("Cannot reach admin dashboard".into()))
        }
    }
}

#[async_trait]
impl RemoteApi for FakeServer {
    async fn fetch_catalog(&self) -> Result<Vec<CachedProduct>, ApiError> {
        self.ensure_reachable()?;
        let gate = {
            let mut state = self.state();
            state.catalog_calls += 1;
            state.catalog_gate.clone()
        };
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        let state = self.state();
        if state.catalog_fails {
            return Err(ApiError::Status {
                status: 500,
                message: "Admin dashboard server error".into(),
            });
        }
        Ok(state.catalog.clone())
    }

    async fn search_products(&self, query: &str) -> Result<Vec<CachedProduct>, ApiError> {
        self.ensure_reachable()?;
        let q = query.to_lowercase();
        Ok(self
            .state()
            .catalog
            .iter()
            .filter(|p| p.name.to_lowercase().contains(&q))
            .cloned()
            .collect())
    }

    async fn lookup_barcode(&self, code: &str) -> Result<Option<CachedProduct>, ApiError> {
        self.ensure_reachable()?;
        Ok(self
            .state()
            .catalog
            .iter()
            .find(|p| p.barcode.as_deref() == Some(code))
            .cloned())
    }

    async fn submit_transaction(
        &self,
        submission: &TransactionSubmission,
    ) -> Result<SubmitReceipt, ApiError> {
        self.ensure_reachable()?;
        let mut state = self.state();
        state.submit_calls += 1;
        if state.failing_ids.contains(&submission.offline_id) {
            return Err(ApiError::Status {
                status: 503,
                message: "Admin dashboard server error".into(),
            });
        }

        let duplicate = state
            .accepted
            .iter()
            .any(|s| s.offline_id == submission.offline_id);
        if !duplicate {
            state.accepted.push(submission.clone());
        }
        let lose_next = std::mem::take(&mut state.lose_next_response);
        if state.lose_response_ids.remove(&submission.offline_id) || lose_next {
            return Err(ApiError::Network("connection reset by peer".into()));
        }
        Ok(SubmitReceipt {
            server_id: Some(format!("srv-{}", submission.offline_id)),
            receipt_number: None,
            duplicate,
        })
    }

    async fn health_check(&self) -> bool {
        self.state().reachable
    }
}
