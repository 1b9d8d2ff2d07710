//! Catalog mirror: cached products, price snapshots and drift detection.
//!
//! The product table is only ever replaced wholesale. The replace runs in one
//! unit of work, so readers see either the previous download or the new one.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{
    format_timestamp, parse_timestamp, CachedProduct, PriceCheck, PriceConflict, PriceSnapshot,
};
use crate::LocalStore;

const PRODUCT_COLUMNS: &str =
    "id, barcode, name, price, card_price, category, taxable, in_stock, image_url";

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<CachedProduct> {
    Ok(CachedProduct {
        id: row.get(0)?,
        barcode: row.get(1)?,
        name: row.get(2)?,
        price: row.get(3)?,
        card_price: row.get(4)?,
        category: row.get(5)?,
        taxable: row.get::<_, i64>(6)? != 0,
        in_stock: row.get::<_, i64>(7)? != 0,
        image_url: row.get(8)?,
    })
}

fn query_product(
    conn: &Connection,
    where_clause: &str,
    value: &str,
) -> Result<Option<CachedProduct>, StoreError> {
    let sql = format!("SELECT {PRODUCT_COLUMNS} FROM cached_products WHERE {where_clause} LIMIT 1");
    Ok(conn
        .query_row(&sql, params![value], product_from_row)
        .optional()?)
}

/// Round to cents so reported differences do not carry float noise.
fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Whole cents, so the drift threshold is compared without float error.
fn to_cents(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

impl LocalStore {
    /// Replace the whole catalog mirror with `products`.
    ///
    /// Clear and insert happen in a single transaction; price snapshots are
    /// refreshed in the same unit. Returns the number of products stored.
    pub fn replace_products(&self, products: &[CachedProduct]) -> Result<usize, StoreError> {
        let now = format_timestamp(&Utc::now());
        let stored = self.unit_of_work(|tx| {
            tx.execute("DELETE FROM cached_products", [])?;
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO cached_products
                    (id, barcode, name, price, card_price, category, taxable, in_stock, image_url,
                     cached_at, name_folded, category_folded)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            let mut snapshot = tx.prepare(
                "INSERT INTO price_snapshots (product_id, price, recorded_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(product_id) DO UPDATE SET
                    price = excluded.price,
                    recorded_at = excluded.recorded_at",
            )?;
            for p in products {
                insert.execute(params![
                    p.id,
                    p.barcode,
                    p.name,
                    p.price,
                    p.card_price,
                    p.category,
                    p.taxable as i64,
                    p.in_stock as i64,
                    p.image_url,
                    now,
                    p.name.to_lowercase(),
                    p.category.as_deref().unwrap_or_default().to_lowercase(),
                ])?;
                snapshot.execute(params![p.id, p.price, now])?;
            }
            let count: i64 =
                tx.query_row("SELECT COUNT(*) FROM cached_products", [], |row| row.get(0))?;
            Ok(count as usize)
        })?;
        info!(count = stored, "Catalog mirror replaced");
        Ok(stored)
    }

    /// Point lookup by scan code. `None` on miss.
    pub fn product_by_barcode(&self, barcode: &str) -> Option<CachedProduct> {
        let code = barcode.trim();
        if code.is_empty() {
            return None;
        }
        self.read_or("product_by_barcode", None, |conn| {
            query_product(conn, "barcode = ?1", code)
        })
    }

    /// Point lookup by product id. `None` on miss.
    pub fn product_by_id(&self, id: &str) -> Option<CachedProduct> {
        self.read_or("product_by_id", None, |conn| query_product(conn, "id = ?1", id))
    }

    /// Case-insensitive substring search over name, scan code and category,
    /// capped at `limit` results.
    pub fn search_products(&self, query: &str, limit: usize) -> Vec<CachedProduct> {
        let needle = query.trim().to_lowercase();
        self.read_or("search_products", Vec::new(), |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM cached_products
                 WHERE instr(name_folded, ?1) > 0
                    OR instr(lower(COALESCE(barcode, '')), ?1) > 0
                    OR instr(category_folded, ?1) > 0
                 ORDER BY name COLLATE NOCASE, id
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![needle, limit as i64], product_from_row)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    pub fn product_count(&self) -> usize {
        self.read_or("product_count", 0, |conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM cached_products", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    // -----------------------------------------------------------------------
    // Price snapshots
    // -----------------------------------------------------------------------

    pub fn save_price_snapshot(&self, product_id: &str, price: f64) -> Result<(), StoreError> {
        let now = format_timestamp(&Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO price_snapshots (product_id, price, recorded_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(product_id) DO UPDATE SET
                    price = excluded.price,
                    recorded_at = excluded.recorded_at",
                params![product_id, price, now],
            )?;
            Ok(())
        })
    }

    pub fn price_snapshot(&self, product_id: &str) -> Option<PriceSnapshot> {
        self.read_or("price_snapshot", None, |conn| {
            let row: Option<(f64, String)> = conn
                .query_row(
                    "SELECT price, recorded_at FROM price_snapshots WHERE product_id = ?1",
                    params![product_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row.map(|(price, recorded_at)| PriceSnapshot {
                product_id: product_id.to_string(),
                price,
                recorded_at: parse_timestamp(&recorded_at).unwrap_or_else(Utc::now),
            }))
        })
    }

    // -----------------------------------------------------------------------
    // Conflict detection
    // -----------------------------------------------------------------------

    /// Compare charged prices with the current catalog mirror.
    ///
    /// A conflict is reported when the absolute difference exceeds
    /// `epsilon`. Products missing from the mirror are skipped. Detection
    /// only: nothing is blocked or rewritten.
    pub fn detect_price_conflicts(&self, checks: &[PriceCheck], epsilon: f64) -> Vec<PriceConflict> {
        let tolerance = to_cents(epsilon);
        let mut conflicts = Vec::new();
        for check in checks {
            let Some(current) = self.product_by_id(&check.product_id) else {
                debug!(product_id = %check.product_id, "Price check skipped: product not cached");
                continue;
            };
            let drift = to_cents(check.charged_price) - to_cents(current.price);
            if drift.abs() > tolerance {
                let difference = check.charged_price - current.price;
                conflicts.push(PriceConflict {
                    product_id: check.product_id.clone(),
                    product_name: current.name,
                    offline_price: check.charged_price,
                    current_price: current.price,
                    difference: round_cents(difference),
                    last_known_price: self.price_snapshot(&check.product_id).map(|s| s.price),
                });
            }
        }
        conflicts
    }
}
