//! Normalized entity model. A `Aggregate` is one transaction together
//! with its owned location, line items, and payouts, committed as one
//! atomic unit by the loader. Products are shared reference entities,
//! deduplicated by name.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Transaction status, normalized against a closed enumeration.
/// Unrecognized upstream values land on `Unknown` and are flagged in the
/// run summary instead of aborting the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Successful,
    Failed,
    Refunded,
    Cancelled,
    Pending,
    Unknown,
}

impl TransactionStatus {
    /// Parse an upstream status string. Returns the variant and whether
    /// the value was recognized.
    pub fn parse(raw: &str) -> (Self, bool) {
        match raw.trim().to_uppercase().as_str() {
            "SUCCESSFUL" => (Self::Successful, true),
            "FAILED" => (Self::Failed, true),
            "REFUNDED" => (Self::Refunded, true),
            "CANCELLED" | "CANCEL_FAILED" => (Self::Cancelled, true),
            "PENDING" => (Self::Pending, true),
            _ => (Self::Unknown, false),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Successful => "SUCCESSFUL",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
            Self::Cancelled => "CANCELLED",
            Self::Pending => "PENDING",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Payment type bucketed into standard categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    Card,
    Cash,
    Other,
    Unknown,
}

impl PaymentType {
    /// Bucket an upstream payment-type string. POS terminals report many
    /// card spellings (POS, CONTACTLESS, scheme names), all of which fold
    /// into `Card`. Returns the variant and whether the value mapped to a
    /// known bucket.
    pub fn parse(raw: &str) -> (Self, bool) {
        let normalized = raw.trim().to_uppercase();
        if normalized.is_empty() {
            return (Self::Unknown, false);
        }
        const CARD_INDICATORS: [&str; 6] =
            ["CARD", "POS", "CONTACTLESS", "VISA", "MASTERCARD", "AMEX"];
        if normalized.contains("CASH") {
            (Self::Cash, true)
        } else if CARD_INDICATORS.iter().any(|c| normalized.contains(c)) {
            (Self::Card, true)
        } else if normalized == "OTHER" {
            (Self::Other, true)
        } else {
            (Self::Unknown, false)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "CARD",
            Self::Cash => "CASH",
            Self::Other => "OTHER",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// The aggregate root. Immutable business facts once settled; the loader
/// bumps `updated_at` on any reconciliation overwrite.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: String,
    pub client_transaction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub payment_type: PaymentType,
    pub card_type: Option<String>,
    pub entry_mode: Option<String>,
    pub merchant_code: Option<String>,
    pub username: Option<String>,
    pub auth_code: Option<String>,
    pub installments_count: i32,
    pub tip_amount: Decimal,
    pub vat_amount: Decimal,
    pub tax_enabled: bool,
}

impl Transaction {
    /// Gross amount net of VAT. Derived for summary reporting, never
    /// stored.
    pub fn net_amount(&self) -> Decimal {
        (self.amount - self.vat_amount).round_dp(2)
    }
}

/// At most one per transaction. Owned; cascades on delete.
#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub lat: Decimal,
    pub lon: Decimal,
    pub horizontal_accuracy: Option<Decimal>,
}

/// Catalog entry, deduplicated by trimmed name. Append-only: later
/// sightings may fill a null description/price, never overwrite.
#[derive(Debug, Clone, Serialize)]
pub struct Product {
    pub name: String,
    pub description: Option<String>,
    pub price: Option<Decimal>,
}

/// One product-quantity-price entry within a transaction. References its
/// product by name; the loader resolves the name to a row id after the
/// product upsert.
#[derive(Debug, Clone, Serialize)]
pub struct LineItem {
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    pub vat_amount: Decimal,
    pub vat_rate: Option<Decimal>,
}

/// Payout event, append-only, identified by
/// (transaction_id, amount, payout_date).
#[derive(Debug, Clone, Serialize)]
pub struct Payout {
    pub amount: Decimal,
    pub fee_amount: Decimal,
    pub status: String,
    pub payout_date: Option<NaiveDate>,
}

/// One transaction with everything it owns.
#[derive(Debug, Clone, Serialize)]
pub struct Aggregate {
    pub transaction: Transaction,
    pub location: Option<Location>,
    pub products: Vec<Product>,
    pub line_items: Vec<LineItem>,
    pub payouts: Vec<Payout>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_known_values_case_insensitively() {
        assert_eq!(
            TransactionStatus::parse("successful"),
            (TransactionStatus::Successful, true)
        );
        assert_eq!(
            TransactionStatus::parse(" REFUNDED "),
            (TransactionStatus::Refunded, true)
        );
    }

    #[test]
    fn unrecognized_status_maps_to_unknown_and_is_flagged() {
        let (status, known) = TransactionStatus::parse("CHARGED_BACK");
        assert_eq!(status, TransactionStatus::Unknown);
        assert!(!known);
    }

    #[test]
    fn net_amount_is_gross_minus_vat() {
        use chrono::TimeZone;
        let t = Transaction {
            id: "T1".into(),
            client_transaction_id: None,
            timestamp: chrono::Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            amount: Decimal::new(1190, 2),
            currency: "EUR".into(),
            status: TransactionStatus::Successful,
            payment_type: PaymentType::Card,
            card_type: None,
            entry_mode: None,
            merchant_code: None,
            username: None,
            auth_code: None,
            installments_count: 1,
            tip_amount: Decimal::ZERO,
            vat_amount: Decimal::new(190, 2),
            tax_enabled: true,
        };
        assert_eq!(t.net_amount(), Decimal::new(1000, 2));
    }

    #[test]
    fn payment_type_buckets_card_spellings() {
        assert_eq!(PaymentType::parse("POS"), (PaymentType::Card, true));
        assert_eq!(PaymentType::parse("contactless"), (PaymentType::Card, true));
        assert_eq!(PaymentType::parse("VISA_DEBIT"), (PaymentType::Card, true));
        assert_eq!(PaymentType::parse("CASH"), (PaymentType::Cash, true));
        assert_eq!(PaymentType::parse("boleto"), (PaymentType::Unknown, false));
    }
}
