//! Data model for the offline layer.
//!
//! Wire names are camelCase to match the admin dashboard payloads; the same
//! structs are persisted (as JSON columns where nested) by the local store.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// Mirror of one catalog item as last downloaded from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedProduct {
    pub id: String,
    #[serde(default, alias = "upc", skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    pub name: String,
    pub price: f64,
    #[serde(default, alias = "card_price", skip_serializing_if = "Option::is_none")]
    pub card_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default = "default_true")]
    pub taxable: bool,
    #[serde(default = "default_true", alias = "in_stock")]
    pub in_stock: bool,
    #[serde(default, alias = "image_url", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Last known price of a product, kept for drift diagnostics only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub product_id: String,
    pub price: f64,
    pub recorded_at: DateTime<Utc>,
}

/// One line to check for price drift: the unit price the cashier charged.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceCheck {
    pub product_id: String,
    pub charged_price: f64,
}

/// Drift between the price charged offline and the current catalog price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceConflict {
    pub product_id: String,
    pub product_name: String,
    pub offline_price: f64,
    pub current_price: f64,
    pub difference: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_price: Option<f64>,
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Lifecycle of a queued sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    CardPending,
    Synced,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::CardPending => "card_pending",
            TransactionStatus::Synced => "synced",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Synced | TransactionStatus::Failed)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(TransactionStatus::Pending),
            "card_pending" => Ok(TransactionStatus::CardPending),
            "synced" => Ok(TransactionStatus::Synced),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: String,
    pub name: String,
    pub quantity: u32,
    /// Catalog price shown at the register.
    pub unit_price: f64,
    /// Unit price actually charged at sale time.
    pub charged_price: f64,
}

impl LineItem {
    pub fn line_total(&self) -> f64 {
        self.charged_price * f64::from(self.quantity)
    }
}

/// Card metadata captured at the register. No PAN is ever stored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_code: Option<String>,
    /// True while the card still has to be presented to a live terminal.
    #[serde(default)]
    pub requires_processing: bool,
}

/// Customer attestation captured when a card sale is accepted offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineWaiver {
    pub customer_name: String,
    pub customer_phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    pub signature: String,
    pub agreed_at: DateTime<Utc>,
}

/// A sale as handed to the facade by the register UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleRequest {
    pub items: Vec<LineItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    pub payment_method: String,
    #[serde(default)]
    pub employee_id: Option<String>,
    #[serde(default)]
    pub station_id: Option<String>,
    #[serde(default)]
    pub card_data: Option<CardData>,
    #[serde(default)]
    pub offline_waiver: Option<OfflineWaiver>,
}

/// A sale waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransaction {
    pub id: String,
    pub items: Vec<LineItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    pub payment_method: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
    #[serde(default)]
    pub employee_id: Option<String>,
    #[serde(default)]
    pub station_id: Option<String>,
    #[serde(default)]
    pub card_data: Option<CardData>,
    #[serde(default)]
    pub offline_waiver: Option<OfflineWaiver>,
    #[serde(default)]
    pub price_conflicts: Vec<PriceConflict>,
    #[serde(default)]
    pub sync_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
}

impl PendingTransaction {
    /// Queue a sale under an already generated idempotency id.
    ///
    /// Card sales that still need a live authorization land in
    /// `card_pending`; everything else is `pending`.
    pub fn from_sale(id: String, sale: SaleRequest, created_at: DateTime<Utc>) -> Self {
        let needs_card = sale
            .card_data
            .as_ref()
            .map(|c| c.requires_processing)
            .unwrap_or(false);
        Self {
            id,
            items: sale.items,
            subtotal: sale.subtotal,
            tax: sale.tax,
            total: sale.total,
            payment_method: sale.payment_method,
            status: if needs_card {
                TransactionStatus::CardPending
            } else {
                TransactionStatus::Pending
            },
            created_at,
            synced: false,
            employee_id: sale.employee_id,
            station_id: sale.station_id,
            card_data: sale.card_data,
            offline_waiver: sale.offline_waiver,
            price_conflicts: Vec::new(),
            sync_attempts: 0,
            last_error: None,
            server_id: None,
        }
    }

    pub fn price_checks(&self) -> Vec<PriceCheck> {
        self.items
            .iter()
            .map(|item| PriceCheck {
                product_id: item.product_id.clone(),
                charged_price: item.charged_price,
            })
            .collect()
    }
}

/// Generate the client-side idempotency key: `offline-<millis>-<random>`.
pub fn new_offline_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("offline-{}-{}", now.timestamp_millis(), &random[..9])
}

/// Canonical timestamp encoding used by the store and on the wire.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionItem {
    pub product_id: String,
    pub name: String,
    pub quantity: u32,
    pub price: f64,
    pub unit_price: f64,
}

/// Body of `POST /api/pos/transaction`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSubmission {
    pub offline_id: String,
    pub items: Vec<SubmissionItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    pub payment_method: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_data: Option<CardData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline_waiver: Option<OfflineWaiver>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub price_conflicts: Vec<PriceConflict>,
    /// True for sales replayed from the outbox, false for live submissions.
    pub offline: bool,
}

impl TransactionSubmission {
    pub fn from_pending(tx: &PendingTransaction, conflicts: &[PriceConflict]) -> Self {
        Self {
            offline_id: tx.id.clone(),
            items: tx
                .items
                .iter()
                .map(|item| SubmissionItem {
                    product_id: item.product_id.clone(),
                    name: item.name.clone(),
                    quantity: item.quantity,
                    price: item.charged_price,
                    unit_price: item.unit_price,
                })
                .collect(),
            subtotal: tx.subtotal,
            tax: tx.tax,
            total: tx.total,
            payment_method: tx.payment_method.clone(),
            created_at: format_timestamp(&tx.created_at),
            station_id: tx.station_id.clone(),
            employee_id: tx.employee_id.clone(),
            card_data: tx.card_data.clone(),
            offline_waiver: tx.offline_waiver.clone(),
            price_conflicts: conflicts.to_vec(),
            offline: true,
        }
    }
}

/// What the server told us about an accepted submission.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub server_id: Option<String>,
    pub receipt_number: Option<String>,
    /// The server had already seen this `offlineId`.
    pub duplicate: bool,
}

impl SubmitReceipt {
    /// Read a receipt out of whatever JSON the endpoint returned.
    pub fn from_response(body: &Value) -> Self {
        let root = body.get("transaction").unwrap_or(body);
        let str_at = |v: &Value, keys: &[&str]| {
            keys.iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str))
                .map(|s| s.to_string())
        };
        let duplicate = body.get("duplicate").and_then(Value::as_bool).unwrap_or(false)
            || body.get("status").and_then(Value::as_str) == Some("skipped");
        Self {
            server_id: str_at(root, &["serverId", "id"]),
            receipt_number: str_at(root, &["receiptNumber", "receipt_number"]),
            duplicate,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings and sync log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub id: i64,
    pub action: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sale(card: Option<CardData>) -> SaleRequest {
        SaleRequest {
            items: vec![LineItem {
                product_id: "p-1".into(),
                name: "Cola".into(),
                quantity: 2,
                unit_price: 2.5,
                charged_price: 2.5,
            }],
            subtotal: 5.0,
            tax: 0.0,
            total: 5.0,
            payment_method: "card".into(),
            employee_id: None,
            station_id: Some("station-1".into()),
            card_data: card,
            offline_waiver: None,
        }
    }

    #[test]
    fn test_offline_id_format() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let id = new_offline_id(now);
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "offline");
        assert_eq!(parts[1], now.timestamp_millis().to_string());
        assert_eq!(parts[2].len(), 9);
        assert_ne!(id, new_offline_id(now), "ids must not collide");
    }

    #[test]
    fn test_card_sale_requiring_processing_is_card_pending() {
        let card = CardData {
            requires_processing: true,
            ..Default::default()
        };
        let tx = PendingTransaction::from_sale("offline-1".into(), sale(Some(card)), Utc::now());
        assert_eq!(tx.status, TransactionStatus::CardPending);
        assert!(!tx.synced);

        let tx = PendingTransaction::from_sale("offline-2".into(), sale(None), Utc::now());
        assert_eq!(tx.status, TransactionStatus::Pending);
    }

    #[test]
    fn test_status_parse_roundtrip_and_reject_unknown() {
        for s in ["pending", "card_pending", "synced", "failed"] {
            let parsed: TransactionStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!("done".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn test_submission_carries_offline_id_and_conflicts() {
        let tx = PendingTransaction::from_sale("offline-9".into(), sale(None), Utc::now());
        let conflict = PriceConflict {
            product_id: "p-1".into(),
            product_name: "Cola".into(),
            offline_price: 2.5,
            current_price: 3.0,
            difference: 0.5,
            last_known_price: None,
        };
        let body = serde_json::to_value(TransactionSubmission::from_pending(&tx, &[conflict]))
            .unwrap();
        assert_eq!(body["offlineId"], "offline-9");
        assert_eq!(body["stationId"], "station-1");
        assert_eq!(body["priceConflicts"][0]["currentPrice"], 3.0);
        assert!(body.get("employeeId").is_none());
    }

    #[test]
    fn test_receipt_detects_server_side_duplicate() {
        let receipt = SubmitReceipt::from_response(&serde_json::json!({
            "status": "skipped",
            "serverId": "srv-1",
            "receiptNumber": "OFF-offline-1234"
        }));
        assert!(receipt.duplicate);
        assert_eq!(receipt.server_id.as_deref(), Some("srv-1"));

        let receipt = SubmitReceipt::from_response(&serde_json::json!({
            "transaction": { "id": "srv-2" }
        }));
        assert!(!receipt.duplicate);
        assert_eq!(receipt.server_id.as_deref(), Some("srv-2"));
    }

    #[test]
    fn test_catalog_item_defaults() {
        let p: CachedProduct = serde_json::from_value(serde_json::json!({
            "id": "p-1",
            "name": "Chips",
            "price": 1.99
        }))
        .unwrap();
        assert!(p.taxable);
        assert!(p.in_stock);
        assert!(p.barcode.is_none());
    }
}
