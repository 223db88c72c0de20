//! SQL for both schemas. Loader queries take `&mut PgConnection` so they
//! compose inside one transaction per aggregate; anonymizer reads go
//! through the pool because they only ever see committed rows.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};

use super::models::*;
use crate::error::Result;
use crate::model::{LineItem, Location, Payout, Product, Transaction};

// ── Products ─────────────────────────────────────────────────────

/// Insert-or-resolve a product by name. On conflict only null
/// description/price are filled; set values are never overwritten.
pub async fn upsert_product(conn: &mut PgConnection, product: &Product) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO products (name, description, price)
         VALUES ($1, $2, $3)
         ON CONFLICT (name) DO UPDATE SET
             description = COALESCE(products.description, EXCLUDED.description),
             price = COALESCE(products.price, EXCLUDED.price)
         RETURNING id",
    )
    .bind(&product.name)
    .bind(&product.description)
    .bind(product.price)
    .fetch_one(conn)
    .await?;
    Ok(id)
}

// ── Transactions ─────────────────────────────────────────────────

/// Upsert a transaction by upstream id. `updated_at` is bumped only when
/// a mutable field actually changed, so replaying identical input leaves
/// the row byte-identical.
pub async fn upsert_transaction(conn: &mut PgConnection, t: &Transaction) -> Result<()> {
    sqlx::query(
        "INSERT INTO transactions
             (id, client_transaction_id, timestamp, amount, currency, status,
              payment_type, card_type, entry_mode, merchant_code, username,
              auth_code, installments_count, tip_amount, vat_amount, tax_enabled)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
         ON CONFLICT (id) DO UPDATE SET
             client_transaction_id = EXCLUDED.client_transaction_id,
             amount = EXCLUDED.amount,
             currency = EXCLUDED.currency,
             status = EXCLUDED.status,
             payment_type = EXCLUDED.payment_type,
             card_type = EXCLUDED.card_type,
             entry_mode = EXCLUDED.entry_mode,
             merchant_code = EXCLUDED.merchant_code,
             username = EXCLUDED.username,
             auth_code = EXCLUDED.auth_code,
             installments_count = EXCLUDED.installments_count,
             tip_amount = EXCLUDED.tip_amount,
             vat_amount = EXCLUDED.vat_amount,
             tax_enabled = EXCLUDED.tax_enabled,
             updated_at = now()
         WHERE (transactions.client_transaction_id, transactions.amount,
                transactions.currency, transactions.status,
                transactions.payment_type, transactions.card_type,
                transactions.entry_mode, transactions.merchant_code,
                transactions.username, transactions.auth_code,
                transactions.installments_count, transactions.tip_amount,
                transactions.vat_amount, transactions.tax_enabled)
               IS DISTINCT FROM
               (EXCLUDED.client_transaction_id, EXCLUDED.amount,
                EXCLUDED.currency, EXCLUDED.status,
                EXCLUDED.payment_type, EXCLUDED.card_type,
                EXCLUDED.entry_mode, EXCLUDED.merchant_code,
                EXCLUDED.username, EXCLUDED.auth_code,
                EXCLUDED.installments_count, EXCLUDED.tip_amount,
                EXCLUDED.vat_amount, EXCLUDED.tax_enabled)",
    )
    .bind(&t.id)
    .bind(&t.client_transaction_id)
    .bind(t.timestamp)
    .bind(t.amount)
    .bind(&t.currency)
    .bind(t.status.as_str())
    .bind(t.payment_type.as_str())
    .bind(&t.card_type)
    .bind(&t.entry_mode)
    .bind(&t.merchant_code)
    .bind(&t.username)
    .bind(&t.auth_code)
    .bind(t.installments_count)
    .bind(t.tip_amount)
    .bind(t.vat_amount)
    .bind(t.tax_enabled)
    .execute(conn)
    .await?;
    Ok(())
}

// ── Locations ────────────────────────────────────────────────────

pub async fn upsert_location(
    conn: &mut PgConnection,
    transaction_id: &str,
    loc: &Location,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO locations (transaction_id, lat, lon, horizontal_accuracy)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (transaction_id) DO UPDATE SET
             lat = EXCLUDED.lat,
             lon = EXCLUDED.lon,
             horizontal_accuracy = EXCLUDED.horizontal_accuracy",
    )
    .bind(transaction_id)
    .bind(loc.lat)
    .bind(loc.lon)
    .bind(loc.horizontal_accuracy)
    .execute(conn)
    .await?;
    Ok(())
}

// ── Line items ───────────────────────────────────────────────────

pub async fn upsert_line_item(
    conn: &mut PgConnection,
    transaction_id: &str,
    product_id: i64,
    item: &LineItem,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO transaction_products
             (transaction_id, product_id, quantity, unit_price, total_price,
              vat_amount, vat_rate)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (transaction_id, product_id) DO UPDATE SET
             quantity = EXCLUDED.quantity,
             unit_price = EXCLUDED.unit_price,
             total_price = EXCLUDED.total_price,
             vat_amount = EXCLUDED.vat_amount,
             vat_rate = EXCLUDED.vat_rate",
    )
    .bind(transaction_id)
    .bind(product_id)
    .bind(item.quantity)
    .bind(item.unit_price)
    .bind(item.total_price)
    .bind(item.vat_amount)
    .bind(item.vat_rate)
    .execute(conn)
    .await?;
    Ok(())
}

// ── Payouts ──────────────────────────────────────────────────────

/// Payouts carry no stable upstream id, so they are append-only events
/// distinguished by (transaction_id, amount, payout_date).
pub async fn insert_payout_if_absent(
    conn: &mut PgConnection,
    transaction_id: &str,
    payout: &Payout,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO payouts (transaction_id, amount, fee_amount, status, payout_date)
         SELECT $1, $2, $3, $4, $5
         WHERE NOT EXISTS (
             SELECT 1 FROM payouts
             WHERE transaction_id = $1
               AND amount = $2
               AND payout_date IS NOT DISTINCT FROM $5
         )",
    )
    .bind(transaction_id)
    .bind(payout.amount)
    .bind(payout.fee_amount)
    .bind(&payout.status)
    .bind(payout.payout_date)
    .execute(conn)
    .await?;
    Ok(())
}

// ── Sync state ───────────────────────────────────────────────────

pub async fn read_sync_state(conn: &mut PgConnection) -> Result<Option<DbSyncState>> {
    let row = sqlx::query_as::<_, DbSyncState>("SELECT * FROM sync_state WHERE id = 1")
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

pub async fn upsert_sync_state(
    conn: &mut PgConnection,
    last_transaction_time: DateTime<Utc>,
    last_cursor: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_state (id, last_transaction_time, last_cursor, last_run_at)
         VALUES (1, $1, $2, now())
         ON CONFLICT (id) DO UPDATE SET
             last_transaction_time = EXCLUDED.last_transaction_time,
             last_cursor = EXCLUDED.last_cursor,
             last_run_at = now()",
    )
    .bind(last_transaction_time)
    .bind(last_cursor)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn try_advisory_lock(conn: &mut PgConnection, key: i64) -> Result<bool> {
    let locked = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
        .bind(key)
        .fetch_one(conn)
        .await?;
    Ok(locked)
}

pub async fn advisory_unlock(conn: &mut PgConnection, key: i64) -> Result<()> {
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

// ── Anonymizer reads (committed primary rows only) ───────────────

/// Transactions not yet mirrored into the demo schema, or updated
/// materially since they were.
pub async fn transactions_needing_mirror(pool: &PgPool) -> Result<Vec<DbTransaction>> {
    let rows = sqlx::query_as::<_, DbTransaction>(
        "SELECT t.* FROM transactions t
         LEFT JOIN demo.transactions d ON d.id = t.id
         WHERE d.id IS NULL OR t.updated_at > d.updated_at
         ORDER BY t.timestamp",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_location(pool: &PgPool, transaction_id: &str) -> Result<Option<DbLocation>> {
    let row = sqlx::query_as::<_, DbLocation>(
        "SELECT * FROM locations WHERE transaction_id = $1",
    )
    .bind(transaction_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_line_items(pool: &PgPool, transaction_id: &str) -> Result<Vec<DbLineItem>> {
    let rows = sqlx::query_as::<_, DbLineItem>(
        "SELECT tp.transaction_id, tp.product_id, tp.quantity, tp.unit_price,
                tp.total_price, tp.vat_amount, tp.vat_rate,
                p.name AS product_name, p.description AS product_description,
                p.price AS product_price
         FROM transaction_products tp
         JOIN products p ON p.id = tp.product_id
         WHERE tp.transaction_id = $1
         ORDER BY tp.product_id",
    )
    .bind(transaction_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_payouts(pool: &PgPool, transaction_id: &str) -> Result<Vec<DbPayout>> {
    let rows = sqlx::query_as::<_, DbPayout>(
        "SELECT * FROM payouts WHERE transaction_id = $1 ORDER BY payout_date, amount",
    )
    .bind(transaction_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ── Demo schema writes ───────────────────────────────────────────

/// Upsert the mirrored transaction row. `updated_at` copies the primary
/// value so staleness checks stay cheap and idempotent.
pub async fn upsert_demo_transaction(conn: &mut PgConnection, t: &DbTransaction) -> Result<()> {
    sqlx::query(
        "INSERT INTO demo.transactions
             (id, client_transaction_id, timestamp, amount, currency, status,
              payment_type, card_type, entry_mode, merchant_code, username,
              auth_code, installments_count, tip_amount, vat_amount,
              tax_enabled, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                 $15, $16, $17)
         ON CONFLICT (id) DO UPDATE SET
             client_transaction_id = EXCLUDED.client_transaction_id,
             timestamp = EXCLUDED.timestamp,
             amount = EXCLUDED.amount,
             currency = EXCLUDED.currency,
             status = EXCLUDED.status,
             payment_type = EXCLUDED.payment_type,
             card_type = EXCLUDED.card_type,
             entry_mode = EXCLUDED.entry_mode,
             merchant_code = EXCLUDED.merchant_code,
             username = EXCLUDED.username,
             auth_code = EXCLUDED.auth_code,
             installments_count = EXCLUDED.installments_count,
             tip_amount = EXCLUDED.tip_amount,
             vat_amount = EXCLUDED.vat_amount,
             tax_enabled = EXCLUDED.tax_enabled,
             updated_at = EXCLUDED.updated_at",
    )
    .bind(&t.id)
    .bind(&t.client_transaction_id)
    .bind(t.timestamp)
    .bind(t.amount)
    .bind(&t.currency)
    .bind(&t.status)
    .bind(&t.payment_type)
    .bind(&t.card_type)
    .bind(&t.entry_mode)
    .bind(&t.merchant_code)
    .bind(&t.username)
    .bind(&t.auth_code)
    .bind(t.installments_count)
    .bind(t.tip_amount)
    .bind(t.vat_amount)
    .bind(t.tax_enabled)
    .bind(t.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Demo products keep the primary row ids so line item references carry
/// over unchanged.
pub async fn upsert_demo_product(
    conn: &mut PgConnection,
    id: i64,
    name: &str,
    description: Option<&str>,
    price: Option<Decimal>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO demo.products (id, name, description, price)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (id) DO UPDATE SET
             name = EXCLUDED.name,
             description = EXCLUDED.description,
             price = EXCLUDED.price",
    )
    .bind(id)
    .bind(name)
    .bind(description)
    .bind(price)
    .execute(conn)
    .await?;
    Ok(())
}

/// Drop a mirrored transaction's dependent rows ahead of a rewrite.
pub async fn delete_demo_dependents(conn: &mut PgConnection, transaction_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM demo.locations WHERE transaction_id = $1")
        .bind(transaction_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM demo.transaction_products WHERE transaction_id = $1")
        .bind(transaction_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM demo.payouts WHERE transaction_id = $1")
        .bind(transaction_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn insert_demo_location(
    conn: &mut PgConnection,
    transaction_id: &str,
    lat: Decimal,
    lon: Decimal,
    horizontal_accuracy: Option<Decimal>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO demo.locations (transaction_id, lat, lon, horizontal_accuracy)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(transaction_id)
    .bind(lat)
    .bind(lon)
    .bind(horizontal_accuracy)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_demo_line_item(conn: &mut PgConnection, item: &DbLineItem) -> Result<()> {
    sqlx::query(
        "INSERT INTO demo.transaction_products
             (transaction_id, product_id, quantity, unit_price, total_price,
              vat_amount, vat_rate)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(&item.transaction_id)
    .bind(item.product_id)
    .bind(item.quantity)
    .bind(item.unit_price)
    .bind(item.total_price)
    .bind(item.vat_amount)
    .bind(item.vat_rate)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_demo_payout(
    conn: &mut PgConnection,
    transaction_id: &str,
    amount: Decimal,
    fee_amount: Decimal,
    status: &str,
    payout_date: Option<NaiveDate>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO demo.payouts (transaction_id, amount, fee_amount, status, payout_date)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(transaction_id)
    .bind(amount)
    .bind(fee_amount)
    .bind(status)
    .bind(payout_date)
    .execute(conn)
    .await?;
    Ok(())
}
