//! Database row types for the primary schema. The demo schema mirrors
//! these shapes exactly, so the same types serve both.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbTransaction {
    pub id: String,
    pub client_transaction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub payment_type: String,
    pub card_type: Option<String>,
    pub entry_mode: Option<String>,
    pub merchant_code: Option<String>,
    pub username: Option<String>,
    pub auth_code: Option<String>,
    pub installments_count: i32,
    pub tip_amount: Decimal,
    pub vat_amount: Decimal,
    pub tax_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbLocation {
    pub transaction_id: String,
    pub lat: Decimal,
    pub lon: Decimal,
    pub horizontal_accuracy: Option<Decimal>,
}

/// Line item joined with its product row, as the anonymizer reads it.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbLineItem {
    pub transaction_id: String,
    pub product_id: i64,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    pub vat_amount: Decimal,
    pub vat_rate: Option<Decimal>,
    pub product_name: String,
    pub product_description: Option<String>,
    pub product_price: Option<Decimal>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbPayout {
    pub id: i64,
    pub transaction_id: String,
    pub amount: Decimal,
    pub fee_amount: Decimal,
    pub status: String,
    pub payout_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbSyncState {
    pub id: i16,
    pub last_transaction_time: Option<DateTime<Utc>>,
    pub last_cursor: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}
