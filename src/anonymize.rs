//! Anonymizer — one-directional projection of committed primary rows
//! into the structurally identical demo schema.
//!
//! Direct identifiers are replaced by a keyed one-way hash, coordinates
//! are perturbed by a bounded offset derived from the same key, and the
//! analytically valuable fields (amounts, timestamps, statuses, product
//! names) are copied unchanged. Everything is deterministic in
//! (input, key), so re-runs are idempotent and accumulate no drift.

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::config::AnonymizeConfig;
use crate::db::models::DbTransaction;
use crate::db::queries;
use crate::error::Result;

type HmacSha256 = Hmac<Sha256>;

/// Pure masking rules, split from the database walk so they can be
/// tested without a live store.
#[derive(Debug, Clone)]
pub struct Masker {
    key: String,
    jitter_degrees: Decimal,
    hash_prefix_len: usize,
}

impl Masker {
    pub fn new(config: &AnonymizeConfig) -> Self {
        Self {
            key: config.key.clone(),
            jitter_degrees: config.jitter_degrees,
            hash_prefix_len: config.hash_prefix_len,
        }
    }

    /// Mirror a transaction row with identifiers replaced. Amounts,
    /// timestamps, and statuses pass through untouched.
    pub fn mask_transaction(&self, t: &DbTransaction) -> DbTransaction {
        let mut masked = t.clone();
        masked.username = t
            .username
            .as_deref()
            .map(|u| truncated(&self.keyed_hash(u), self.hash_prefix_len));
        masked.auth_code = t.auth_code.as_deref().map(|c| self.keyed_hash(c));
        masked
    }

    /// Perturbed coordinates for a transaction's location. The offset is
    /// derived per axis from HMAC(key, id), uniform in
    /// [-jitter_degrees, +jitter_degrees], and clamped to the valid
    /// coordinate range. Relative clustering survives; exact positions
    /// do not.
    pub fn jittered(&self, transaction_id: &str, lat: Decimal, lon: Decimal) -> (Decimal, Decimal) {
        let lat = clamp(
            (lat + self.axis_offset(transaction_id, "lat")).round_dp(6),
            Decimal::from(90),
        );
        let lon = clamp(
            (lon + self.axis_offset(transaction_id, "lon")).round_dp(6),
            Decimal::from(180),
        );
        (lat, lon)
    }

    /// Hex HMAC-SHA256 digest of a field value under the run key.
    pub fn keyed_hash(&self, value: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .expect("HMAC accepts keys of any size");
        mac.update(value.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn axis_offset(&self, transaction_id: &str, axis: &str) -> Decimal {
        let digest = self.keyed_hash(&format!("{}:{}", transaction_id, axis));
        // First 4 digest bytes give a uniform fraction of the jitter range
        let bytes = hex::decode(&digest[..8]).expect("digest is valid hex");
        let n = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let fraction = Decimal::from(n) / Decimal::from(u32::MAX);
        ((fraction * Decimal::TWO - Decimal::ONE) * self.jitter_degrees).round_dp(6)
    }
}

fn truncated(digest: &str, len: usize) -> String {
    digest.chars().take(len).collect()
}

fn clamp(value: Decimal, bound: Decimal) -> Decimal {
    value.max(-bound).min(bound)
}

pub struct Anonymizer {
    pool: PgPool,
    masker: Masker,
}

impl Anonymizer {
    pub fn new(pool: PgPool, config: &AnonymizeConfig) -> Self {
        Self {
            pool,
            masker: Masker::new(config),
        }
    }

    /// Mirror every primary transaction that is missing from the demo
    /// schema or was materially updated after first anonymization. Each
    /// mirrored transaction commits as one unit: the demo row pair is
    /// deleted and rewritten, keyed by transaction id across schemas.
    ///
    /// Cancellation is checked between per-transaction commits; already
    /// mirrored rows stay, the rest are picked up by the next run.
    pub async fn run(&self, cancel: &AtomicBool) -> Result<u64> {
        if cancel.load(Ordering::Relaxed) {
            return Ok(0);
        }
        let pending = queries::transactions_needing_mirror(&self.pool).await?;
        if pending.is_empty() {
            debug!("demo schema already current");
            return Ok(0);
        }

        let mut mirrored = 0u64;
        for t in &pending {
            if cancel.load(Ordering::Relaxed) {
                info!(mirrored, "cancellation requested, demo refresh stopped");
                return Ok(mirrored);
            }
            // Dependent rows are committed with their transaction, so a
            // pool read here never sees a partial aggregate.
            let location = queries::get_location(&self.pool, &t.id).await?;
            let line_items = queries::get_line_items(&self.pool, &t.id).await?;
            let payouts = queries::get_payouts(&self.pool, &t.id).await?;

            let mut tx = self.pool.begin().await?;

            for item in &line_items {
                queries::upsert_demo_product(
                    &mut tx,
                    item.product_id,
                    &item.product_name,
                    item.product_description.as_deref(),
                    item.product_price,
                )
                .await?;
            }

            let masked = self.masker.mask_transaction(t);
            queries::upsert_demo_transaction(&mut tx, &masked).await?;
            queries::delete_demo_dependents(&mut tx, &t.id).await?;

            if let Some(loc) = &location {
                let (lat, lon) = self.masker.jittered(&t.id, loc.lat, loc.lon);
                queries::insert_demo_location(&mut tx, &t.id, lat, lon, loc.horizontal_accuracy)
                    .await?;
            }
            for item in &line_items {
                queries::insert_demo_line_item(&mut tx, item).await?;
            }
            for payout in &payouts {
                queries::insert_demo_payout(
                    &mut tx,
                    &t.id,
                    payout.amount,
                    payout.fee_amount,
                    &payout.status,
                    payout.payout_date,
                )
                .await?;
            }

            tx.commit().await?;
            mirrored += 1;
        }

        info!(mirrored, "demo schema refreshed");
        Ok(mirrored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn masker(key: &str) -> Masker {
        Masker {
            key: key.into(),
            jitter_degrees: Decimal::new(45, 3),
            hash_prefix_len: 16,
        }
    }

    fn sample_transaction() -> DbTransaction {
        DbTransaction {
            id: "TX-1".into(),
            client_transaction_id: Some("c-1".into()),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap(),
            amount: Decimal::new(1000, 2),
            currency: "EUR".into(),
            status: "SUCCESSFUL".into(),
            payment_type: "CARD".into(),
            card_type: Some("VISA".into()),
            entry_mode: Some("contactless".into()),
            merchant_code: Some("M123".into()),
            username: Some("baker@example.com".into()),
            auth_code: Some("A1B2C3".into()),
            installments_count: 1,
            tip_amount: Decimal::ZERO,
            vat_amount: Decimal::new(160, 2),
            tax_enabled: true,
            updated_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 31, 0).unwrap(),
        }
    }

    #[test]
    fn masking_is_deterministic_under_one_key() {
        let m = masker("secret");
        let a = m.mask_transaction(&sample_transaction());
        let b = m.mask_transaction(&sample_transaction());
        assert_eq!(a.username, b.username);
        assert_eq!(a.auth_code, b.auth_code);
    }

    #[test]
    fn changing_the_key_changes_hashes_but_not_amounts() {
        let t = sample_transaction();
        let a = masker("key-one").mask_transaction(&t);
        let b = masker("key-two").mask_transaction(&t);
        assert_ne!(a.username, b.username);
        assert_ne!(a.auth_code, b.auth_code);
        assert_eq!(a.amount, b.amount);
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.status, b.status);
    }

    #[test]
    fn identifiers_are_replaced_and_facts_copied() {
        let t = sample_transaction();
        let masked = masker("secret").mask_transaction(&t);
        assert_ne!(masked.username, t.username);
        assert_ne!(masked.auth_code, t.auth_code);
        assert_eq!(masked.username.as_ref().unwrap().len(), 16);
        assert_eq!(masked.auth_code.as_ref().unwrap().len(), 64);
        assert_eq!(masked.amount, t.amount);
        assert_eq!(masked.currency, t.currency);
        assert_eq!(masked.merchant_code, t.merchant_code);
    }

    #[test]
    fn jitter_is_bounded_and_deterministic() {
        let m = masker("secret");
        let lat = Decimal::new(52_520_000, 6); // 52.520000
        let lon = Decimal::new(13_405_000, 6);
        let (jlat, jlon) = m.jittered("TX-1", lat, lon);
        let (jlat2, jlon2) = m.jittered("TX-1", lat, lon);
        assert_eq!((jlat, jlon), (jlat2, jlon2));

        let bound = Decimal::new(45, 3);
        assert!((jlat - lat).abs() <= bound);
        assert!((jlon - lon).abs() <= bound);
        // Different transactions scatter differently
        let (other_lat, _) = m.jittered("TX-2", lat, lon);
        assert_ne!(jlat, other_lat);
    }

    #[test]
    fn jitter_stays_inside_valid_coordinate_range() {
        let m = masker("secret");
        let (lat, lon) = m.jittered("TX-3", Decimal::from(90), Decimal::from(-180));
        assert!(lat <= Decimal::from(90));
        assert!(lon >= Decimal::from(-180));
    }

    #[tokio::test]
    async fn cancelled_refresh_touches_nothing() {
        // connect_lazy defers I/O, so a pre-set flag must return before
        // any query is issued
        let pool = PgPool::connect_lazy("postgres://localhost/never-used").unwrap();
        let anonymizer = Anonymizer {
            pool,
            masker: masker("secret"),
        };
        let cancel = AtomicBool::new(true);
        assert_eq!(anonymizer.run(&cancel).await.unwrap(), 0);
    }
}
