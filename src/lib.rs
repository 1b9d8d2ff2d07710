//! The Small POS - offline store and sync engine
//!
//! Keeps a cashier station selling while the admin dashboard is unreachable:
//! a SQLite mirror of the catalog, an outbox of sales keyed by client-side
//! idempotency ids, and a single-flight sync engine that drains the outbox
//! whenever connectivity returns.
//!
//! The register talks to [`OfflineService`]; everything else is exposed for
//! hosts that want to wire the pieces themselves.

pub mod api;
mod catalog;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod network;
pub mod offline;
mod outbox;
pub mod scheduler;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{AdminApiClient, RemoteApi};
pub use config::SyncConfig;
pub use credentials::ServerEndpoint;
pub use db::LocalStore;
pub use error::{ApiError, LoggingError, StoreError, SyncError};
pub use models::{
    CachedProduct, CardData, LineItem, OfflineWaiver, PendingTransaction, PriceConflict,
    SaleRequest, TransactionStatus,
};
pub use network::NetworkStatus;
pub use offline::{OfflineService, OfflineStatus, SaveOutcome};
pub use scheduler::{SyncScheduler, SyncTrigger, TriggerHandle, TriggerSource};
pub use sync::{CardResolution, SyncEngine, SyncOutcome, SyncResult};
