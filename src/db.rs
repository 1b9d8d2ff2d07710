//! Local SQLite store for the offline layer.
//!
//! Uses rusqlite with WAL mode. Owns the connection, schema migrations, the
//! unit-of-work helper every multi-step write goes through, and the small
//! settings and sync-log tables. Product and outbox accessors live in
//! `catalog` and `outbox` as further `impl LocalStore` blocks.
//!
//! A store that failed to open (or was closed) stays usable: reads return
//! empty results and writes return [`StoreError::NotReady`], so callers
//! degrade to online-only operation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::models::{format_timestamp, parse_timestamp, Setting, SyncLogEntry};

/// File name of the store inside the data directory.
pub const DB_FILE_NAME: &str = "offline.db";

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

pub const SETTING_LAST_SYNC: &str = "lastSync";

/// Durable store shared by the orchestrator and the facade.
pub struct LocalStore {
    conn: Mutex<Option<Connection>>,
    db_path: Mutex<Option<PathBuf>>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    /// Create an unopened store. Call [`LocalStore::init`] before use.
    pub fn new() -> Self {
        Self {
            conn: Mutex::new(None),
            db_path: Mutex::new(None),
        }
    }

    /// Open `{data_dir}/offline.db` and run pending migrations.
    ///
    /// On corruption or open failure the file is deleted and opening is
    /// retried once. Returns `false` when the store could not be opened.
    pub fn init(&self, data_dir: &Path) -> bool {
        match open_file(data_dir) {
            Ok((conn, path)) => {
                self.install(conn, Some(path));
                true
            }
            Err(e) => {
                error!(error = %e, dir = %data_dir.display(), "Offline store unavailable");
                false
            }
        }
    }

    /// Open a private in-memory store (tests, kiosk demo mode).
    pub fn init_in_memory(&self) -> bool {
        let opened = Connection::open_in_memory()
            .map_err(StoreError::from)
            .and_then(|conn| {
                configure(&conn)?;
                run_migrations(&conn)?;
                Ok(conn)
            });
        match opened {
            Ok(conn) => {
                self.install(conn, None);
                true
            }
            Err(e) => {
                error!(error = %e, "In-memory offline store unavailable");
                false
            }
        }
    }

    fn install(&self, conn: Connection, path: Option<PathBuf>) {
        if let Ok(mut guard) = self.conn.lock() {
            *guard = Some(conn);
        }
        if let Ok(mut guard) = self.db_path.lock() {
            *guard = path;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Drop the connection. Later calls behave as "store not ready".
    pub fn close(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            if guard.take().is_some() {
                info!("Offline store closed");
            }
        }
    }

    pub fn db_path(&self) -> Option<PathBuf> {
        self.db_path.lock().ok().and_then(|g| g.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    /// Run a single statement-level operation against the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::NotReady)?;
        f(conn)
    }

    /// Run `f` inside one immediate SQLite transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. The connection
    /// lock is held for the whole unit, so no reader can observe a partial
    /// state.
    pub fn unit_of_work<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or(StoreError::NotReady)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Read helper: maps a not-ready store or a failed query to `default`.
    pub(crate) fn read_or<T>(
        &self,
        what: &str,
        default: T,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> T {
        match self.with_conn(f) {
            Ok(v) => v,
            Err(StoreError::NotReady) => {
                debug!(what, "Offline store not ready");
                default
            }
            Err(e) => {
                warn!(what, error = %e, "Offline store read failed");
                default
            }
        }
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Get a single setting value.
    pub fn get_setting(&self, key: &str) -> Option<Value> {
        self.get_setting_entry(key).map(|s| s.value)
    }

    /// Get a setting together with its `updatedAt` stamp.
    pub fn get_setting_entry(&self, key: &str) -> Option<Setting> {
        self.read_or("get_setting", None, |conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT value, updated_at FROM settings WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row.map(|(raw, updated_at)| Setting {
                key: key.to_string(),
                value: serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
                updated_at: parse_timestamp(&updated_at).unwrap_or_else(Utc::now),
            }))
        })
    }

    /// Insert or update a setting (last write wins).
    pub fn set_setting(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value)?;
        let now = format_timestamp(&Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![key, encoded, now],
            )?;
            Ok(())
        })
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.get_setting(SETTING_LAST_SYNC)
            .and_then(|v| v.as_str().and_then(parse_timestamp))
    }

    pub fn set_last_sync(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_setting(SETTING_LAST_SYNC, &Value::String(format_timestamp(&at)))
    }

    // -----------------------------------------------------------------------
    // Sync log
    // -----------------------------------------------------------------------

    /// Append an audit entry. Failures are logged, never returned.
    pub fn append_sync_log(&self, action: &str, details: Value) {
        let now = format_timestamp(&Utc::now());
        let result = serde_json::to_string(&details)
            .map_err(StoreError::from)
            .and_then(|encoded| {
                self.with_conn(|conn| {
                    conn.execute(
                        "INSERT INTO sync_log (action, details, timestamp) VALUES (?1, ?2, ?3)",
                        params![action, encoded, now],
                    )?;
                    Ok(())
                })
            });
        match result {
            Ok(()) => {}
            Err(StoreError::NotReady) => debug!(action, "Sync log skipped: store not ready"),
            Err(e) => warn!(action, error = %e, "Failed to append sync log entry"),
        }
    }

    /// Most recent sync-log entries, newest first (operator inspection).
    pub fn recent_sync_log(&self, limit: usize) -> Vec<SyncLogEntry> {
        self.read_or("recent_sync_log", Vec::new(), |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, action, details, timestamp FROM sync_log
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            let mut entries = Vec::new();
            for (id, action, details, timestamp) in rows.flatten() {
                entries.push(SyncLogEntry {
                    id,
                    action,
                    details: serde_json::from_str(&details).unwrap_or(Value::Null),
                    timestamp: parse_timestamp(&timestamp).unwrap_or_else(Utc::now),
                });
            }
            Ok(entries)
        })
    }
}

// ---------------------------------------------------------------------------
// Opening and migrations
// ---------------------------------------------------------------------------

fn open_file(data_dir: &Path) -> Result<(Connection, PathBuf), StoreError> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening offline store at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Offline store open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };

    info!("Offline store initialized (schema v{CURRENT_SCHEMA_VERSION})");
    Ok((conn, db_path))
}

fn open_and_configure(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        debug!("Offline store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating offline store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: the five offline tables.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        -- catalog mirror, replaced wholesale on every download
        CREATE TABLE IF NOT EXISTS cached_products (
            id TEXT PRIMARY KEY,
            barcode TEXT,
            name TEXT NOT NULL,
            price REAL NOT NULL,
            card_price REAL,
            category TEXT,
            taxable INTEGER NOT NULL DEFAULT 1,
            in_stock INTEGER NOT NULL DEFAULT 1,
            image_url TEXT,
            cached_at TEXT NOT NULL
        );

        -- outbox of sales awaiting upload
        CREATE TABLE IF NOT EXISTS pending_transactions (
            id TEXT PRIMARY KEY,
            items TEXT NOT NULL DEFAULT '[]',
            subtotal REAL NOT NULL DEFAULT 0,
            tax REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            payment_method TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'card_pending', 'synced', 'failed')),
            created_at TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0,
            employee_id TEXT,
            station_id TEXT,
            card_data TEXT,
            offline_waiver TEXT,
            price_conflicts TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- append-only audit trail of sync runs
        CREATE TABLE IF NOT EXISTS sync_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            details TEXT NOT NULL DEFAULT 'null',
            timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS price_snapshots (
            product_id TEXT PRIMARY KEY,
            price REAL NOT NULL,
            recorded_at TEXT NOT NULL
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_cached_products_barcode ON cached_products(barcode);
        CREATE INDEX IF NOT EXISTS idx_cached_products_category ON cached_products(category);
        CREATE INDEX IF NOT EXISTS idx_cached_products_name ON cached_products(name);
        CREATE INDEX IF NOT EXISTS idx_pending_transactions_status ON pending_transactions(status);
        CREATE INDEX IF NOT EXISTS idx_pending_transactions_created_at ON pending_transactions(created_at);
        CREATE INDEX IF NOT EXISTS idx_sync_log_timestamp ON sync_log(timestamp);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        StoreError::from(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names.flatten() {
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v2: outbox bookkeeping (retry attempts, errors, server ids).
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    let columns = [
        ("sync_attempts", "INTEGER NOT NULL DEFAULT 0"),
        ("last_error", "TEXT"),
        ("server_id", "TEXT"),
        ("synced_at", "TEXT"),
        ("resolution_note", "TEXT"),
    ];
    for (name, decl) in columns {
        if !column_exists(conn, "pending_transactions", name)? {
            conn.execute_batch(&format!(
                "ALTER TABLE pending_transactions ADD COLUMN {name} {decl};"
            ))
            .map_err(|e| {
                error!("Migration v2 failed on column {name}: {e}");
                StoreError::from(e)
            })?;
        }
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_pending_transactions_status_created
            ON pending_transactions(status, created_at);
         INSERT INTO schema_version (version) VALUES (2);",
    )?;

    info!("Applied migration v2 (outbox bookkeeping columns)");
    Ok(())
}

/// Migration v3: Unicode-folded search columns for the catalog mirror.
///
/// SQLite's `lower()` only folds ASCII, so the folded text is computed in
/// Rust on write and searched directly.
fn migrate_v3(conn: &Connection) -> Result<(), StoreError> {
    for name in ["name_folded", "category_folded"] {
        if !column_exists(conn, "cached_products", name)? {
            conn.execute_batch(&format!(
                "ALTER TABLE cached_products ADD COLUMN {name} TEXT NOT NULL DEFAULT '';"
            ))
            .map_err(|e| {
                error!("Migration v3 failed on column {name}: {e}");
                StoreError::from(e)
            })?;
        }
    }

    let rows: Vec<(String, String, Option<String>)> = {
        let mut stmt = conn.prepare("SELECT id, name, category FROM cached_products")?;
        let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        mapped.flatten().collect()
    };
    for (id, name, category) in rows {
        conn.execute(
            "UPDATE cached_products SET name_folded = ?2, category_folded = ?3 WHERE id = ?1",
            params![
                id,
                name.to_lowercase(),
                category.unwrap_or_default().to_lowercase()
            ],
        )?;
    }
    conn.execute_batch("INSERT INTO schema_version (version) VALUES (3);")?;

    info!("Applied migration v3 (folded search columns)");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) fn memory_store() -> LocalStore {
    let store = LocalStore::new();
    assert!(store.init_in_memory(), "in-memory store should open");
    store
}
