//! Pending-transaction outbox.
//!
//! Rows are keyed by the client-generated offline id, which is also the
//! idempotency key the server deduplicates on; it is never rewritten.
//! Status changes go through guarded transitions so a `card_pending` sale
//! can never be flipped to `synced` by the upload path.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::models::{
    format_timestamp, parse_timestamp, PendingTransaction, PriceConflict, TransactionStatus,
};
use crate::LocalStore;

const TX_COLUMNS: &str = "id, items, subtotal, tax, total, payment_method, status, created_at, \
     synced, employee_id, station_id, card_data, offline_waiver, price_conflicts, \
     sync_attempts, last_error, server_id";

/// Decode an optional JSON column, logging (not failing) on corrupt data.
fn json_column<T: serde::de::DeserializeOwned>(raw: Option<String>, column: &str) -> Option<T> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(column, error = %e, "Corrupt JSON in pending_transactions");
            None
        }
    }
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<PendingTransaction> {
    let status_raw: String = row.get(6)?;
    let created_raw: String = row.get(7)?;
    Ok(PendingTransaction {
        id: row.get(0)?,
        items: json_column(row.get(1)?, "items").unwrap_or_default(),
        subtotal: row.get(2)?,
        tax: row.get(3)?,
        total: row.get(4)?,
        payment_method: row.get(5)?,
        status: status_raw
            .parse()
            .unwrap_or(TransactionStatus::Pending),
        created_at: parse_timestamp(&created_raw).unwrap_or_else(Utc::now),
        synced: row.get::<_, i64>(8)? != 0,
        employee_id: row.get(9)?,
        station_id: row.get(10)?,
        card_data: json_column(row.get(11)?, "card_data"),
        offline_waiver: json_column(row.get(12)?, "offline_waiver"),
        price_conflicts: json_column(row.get(13)?, "price_conflicts").unwrap_or_default(),
        sync_attempts: row.get::<_, i64>(14)?.max(0) as u32,
        last_error: row.get(15)?,
        server_id: row.get(16)?,
    })
}

fn load_transaction(conn: &Connection, id: &str) -> Result<Option<PendingTransaction>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {TX_COLUMNS} FROM pending_transactions WHERE id = ?1"),
            params![id],
            transaction_from_row,
        )
        .optional()?)
}

fn write_transaction(conn: &Connection, tx: &PendingTransaction) -> Result<(), StoreError> {
    let items = serde_json::to_string(&tx.items)?;
    let card_data = tx.card_data.as_ref().map(serde_json::to_string).transpose()?;
    let waiver = tx
        .offline_waiver
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let conflicts = serde_json::to_string(&tx.price_conflicts)?;
    let now = format_timestamp(&Utc::now());

    conn.execute(
        "INSERT INTO pending_transactions
            (id, items, subtotal, tax, total, payment_method, status, created_at, synced,
             employee_id, station_id, card_data, offline_waiver, price_conflicts,
             sync_attempts, last_error, server_id, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(id) DO UPDATE SET
            items = excluded.items,
            subtotal = excluded.subtotal,
            tax = excluded.tax,
            total = excluded.total,
            payment_method = excluded.payment_method,
            status = excluded.status,
            synced = excluded.synced,
            employee_id = excluded.employee_id,
            station_id = excluded.station_id,
            card_data = excluded.card_data,
            offline_waiver = excluded.offline_waiver,
            price_conflicts = excluded.price_conflicts,
            sync_attempts = excluded.sync_attempts,
            last_error = excluded.last_error,
            server_id = excluded.server_id,
            updated_at = excluded.updated_at",
        params![
            tx.id,
            items,
            tx.subtotal,
            tx.tax,
            tx.total,
            tx.payment_method,
            tx.status.as_str(),
            format_timestamp(&tx.created_at),
            (tx.status == TransactionStatus::Synced) as i64,
            tx.employee_id,
            tx.station_id,
            card_data,
            waiver,
            conflicts,
            tx.sync_attempts as i64,
            tx.last_error,
            tx.server_id,
            now,
        ],
    )?;
    Ok(())
}

impl LocalStore {
    /// Insert or update a queued sale. `created_at` of an existing row is
    /// kept so FIFO order cannot be disturbed by a later write.
    pub fn upsert_transaction(&self, tx: &PendingTransaction) -> Result<(), StoreError> {
        self.with_conn(|conn| write_transaction(conn, tx))?;
        info!(id = %tx.id, status = %tx.status, total = tx.total, "Saved pending transaction");
        Ok(())
    }

    pub fn get_transaction(&self, id: &str) -> Option<PendingTransaction> {
        self.read_or("get_transaction", None, |conn| load_transaction(conn, id))
    }

    /// All rows with `status`, oldest first.
    pub fn list_by_status(&self, status: TransactionStatus) -> Vec<PendingTransaction> {
        self.read_or("list_by_status", Vec::new(), |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TX_COLUMNS} FROM pending_transactions
                 WHERE status = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], transaction_from_row)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Outbox in upload order (FIFO by creation time).
    pub fn pending_transactions(&self) -> Vec<PendingTransaction> {
        self.list_by_status(TransactionStatus::Pending)
    }

    pub fn card_pending_transactions(&self) -> Vec<PendingTransaction> {
        self.list_by_status(TransactionStatus::CardPending)
    }

    pub fn count_by_status(&self, status: TransactionStatus) -> usize {
        self.read_or("count_by_status", 0, |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pending_transactions WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    pub fn pending_count(&self) -> usize {
        self.count_by_status(TransactionStatus::Pending)
    }

    /// Move a `pending` row to `synced`.
    ///
    /// Returns `false` when nothing changed (already synced, unknown id, or a
    /// row in another state); re-marking is therefore harmless.
    pub fn mark_synced(&self, id: &str, server_id: Option<&str>) -> Result<bool, StoreError> {
        let now = format_timestamp(&Utc::now());
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE pending_transactions
                 SET status = 'synced',
                     synced = 1,
                     synced_at = ?2,
                     server_id = COALESCE(?3, server_id),
                     last_error = NULL,
                     updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now, server_id],
            )?)
        })?;
        Ok(changed > 0)
    }

    /// Record a failed upload attempt; the row stays `pending`.
    pub fn record_failed_attempt(&self, id: &str, error: &str) -> Result<(), StoreError> {
        let now = format_timestamp(&Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pending_transactions
                 SET sync_attempts = sync_attempts + 1,
                     last_error = ?2,
                     updated_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id, error, now],
            )?;
            Ok(())
        })
    }

    pub fn record_price_conflicts(
        &self,
        id: &str,
        conflicts: &[PriceConflict],
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(conflicts)?;
        let now = format_timestamp(&Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pending_transactions SET price_conflicts = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, encoded, now],
            )?;
            Ok(())
        })
    }

    /// Guarded read-modify-write of one row.
    ///
    /// Fails with `InvalidTransition` unless the row is currently in one of
    /// `allowed_from`. Synced and failed rows are final and never move.
    /// `apply` may edit any field except the id.
    pub fn transition_transaction(
        &self,
        id: &str,
        allowed_from: &[TransactionStatus],
        note: Option<&str>,
        apply: impl FnOnce(&mut PendingTransaction),
    ) -> Result<PendingTransaction, StoreError> {
        self.unit_of_work(|conn| {
            let mut tx = load_transaction(conn, id)?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let from = tx.status;
            apply(&mut tx);
            if from.is_terminal() || !allowed_from.contains(&from) {
                return Err(StoreError::InvalidTransition {
                    id: id.to_string(),
                    from: from.to_string(),
                    to: tx.status.to_string(),
                });
            }
            tx.id = id.to_string();
            tx.synced = tx.status == TransactionStatus::Synced;
            write_transaction(conn, &tx)?;
            if let Some(note) = note {
                conn.execute(
                    "UPDATE pending_transactions SET resolution_note = ?2 WHERE id = ?1",
                    params![id, note],
                )?;
            }
            info!(id, from = %from, to = %tx.status, "Transaction status changed");
            Ok(tx)
        })
    }

    /// Delete `synced` rows created before `now - retention`.
    ///
    /// Each delete is independent: a failing row is logged and skipped.
    /// Returns the number of rows removed.
    pub fn purge_synced_older_than(&self, retention: chrono::Duration) -> usize {
        let cutoff: DateTime<Utc> = Utc::now() - retention;
        let cutoff = format_timestamp(&cutoff);
        self.read_or("purge_synced", 0, |conn| {
            let ids: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT id FROM pending_transactions
                     WHERE status = 'synced' AND created_at < ?1",
                )?;
                let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
                rows.filter_map(|r| r.ok()).collect()
            };

            let mut removed = 0;
            for id in &ids {
                match conn.execute(
                    "DELETE FROM pending_transactions WHERE id = ?1 AND status = 'synced'",
                    params![id],
                ) {
                    Ok(n) => removed += n,
                    Err(e) => warn!(id = %id, error = %e, "Failed to purge synced transaction"),
                }
            }
            if removed > 0 {
                info!(removed, "Purged synced transactions past retention");
            }
            Ok(removed)
        })
    }
}
