//! Idempotent loader — persists one normalized aggregate atomically.
//!
//! Replaying the same input any number of times yields the same final row
//! state. Each aggregate commits in one database transaction, in
//! referential order: products first, then the transaction row, then its
//! location, line items, and payouts. A constraint violation aborts only
//! the containing aggregate; the run continues with the next one.

use sqlx::PgPool;
use std::collections::HashMap;
use tracing::debug;

use crate::db::queries;
use crate::error::{PipelineError, Result};
use crate::model::Aggregate;

/// Per-aggregate result. `Failed` is recoverable and lands in the run
/// summary; run-level errors propagate as `PipelineError`.
#[derive(Debug)]
pub enum AggregateOutcome {
    Loaded,
    Failed(String),
}

pub struct Loader {
    pool: PgPool,
}

impl Loader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load one aggregate inside a single transaction: all rows commit or
    /// none do, so a crash mid-batch never leaves a transaction with some
    /// line items missing.
    pub async fn load_aggregate(&self, aggregate: &Aggregate) -> Result<AggregateOutcome> {
        let mut tx = self.pool.begin().await?;

        let mut product_ids: HashMap<&str, i64> = HashMap::new();
        for product in &aggregate.products {
            match queries::upsert_product(&mut tx, product).await {
                Ok(id) => {
                    product_ids.insert(product.name.as_str(), id);
                }
                Err(e) if is_record_level(&e) => {
                    tx.rollback().await?;
                    return Ok(AggregateOutcome::Failed(format!(
                        "product `{}` upsert rejected: {}",
                        product.name, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        if let Err(e) = queries::upsert_transaction(&mut tx, &aggregate.transaction).await {
            if is_record_level(&e) {
                tx.rollback().await?;
                return Ok(AggregateOutcome::Failed(format!(
                    "transaction upsert rejected: {}",
                    e
                )));
            }
            return Err(e);
        }

        if let Some(location) = &aggregate.location {
            if let Err(e) =
                queries::upsert_location(&mut tx, &aggregate.transaction.id, location).await
            {
                if is_record_level(&e) {
                    tx.rollback().await?;
                    return Ok(AggregateOutcome::Failed(format!(
                        "location upsert rejected: {}",
                        e
                    )));
                }
                return Err(e);
            }
        }

        for item in &aggregate.line_items {
            let Some(&product_id) = product_ids.get(item.product_name.as_str()) else {
                // Line item references a product that failed to upsert
                tx.rollback().await?;
                return Ok(AggregateOutcome::Failed(format!(
                    "line item references unknown product `{}`",
                    item.product_name
                )));
            };
            if let Err(e) =
                queries::upsert_line_item(&mut tx, &aggregate.transaction.id, product_id, item)
                    .await
            {
                if is_record_level(&e) {
                    tx.rollback().await?;
                    return Ok(AggregateOutcome::Failed(format!(
                        "line item for `{}` rejected: {}",
                        item.product_name, e
                    )));
                }
                return Err(e);
            }
        }

        for payout in &aggregate.payouts {
            if let Err(e) =
                queries::insert_payout_if_absent(&mut tx, &aggregate.transaction.id, payout).await
            {
                if is_record_level(&e) {
                    tx.rollback().await?;
                    return Ok(AggregateOutcome::Failed(format!(
                        "payout insert rejected: {}",
                        e
                    )));
                }
                return Err(e);
            }
        }

        tx.commit().await?;
        debug!(
            transaction_id = %aggregate.transaction.id,
            line_items = aggregate.line_items.len(),
            payouts = aggregate.payouts.len(),
            "aggregate committed"
        );
        Ok(AggregateOutcome::Loaded)
    }
}

/// Constraint violations (referential, check, unique, numeric range) are
/// per-record failures; anything else is run-level.
fn is_record_level(error: &PipelineError) -> bool {
    const RECORD_CODES: [&str; 4] = [
        "23503", // foreign_key_violation
        "23514", // check_violation
        "23505", // unique_violation
        "22003", // numeric_value_out_of_range
    ];
    match error {
        PipelineError::Database(sqlx::Error::Database(db)) => db
            .code()
            .map(|c| RECORD_CODES.contains(&c.as_ref()))
            .unwrap_or(false),
        _ => false,
    }
}
