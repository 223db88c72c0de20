//! Raw payload types for the upstream transaction API.
//!
//! Fields arrive loosely typed: amounts may be JSON numbers or strings,
//! optional fields may be missing or null. Everything money-like is kept
//! as `serde_json::Value` here and parsed into fixed-point decimals by the
//! transformer, which owns the field-path error reporting.

use serde::Deserialize;
use serde_json::Value;

/// One page from `GET /me/transactions/history`.
#[derive(Debug, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub items: Vec<TransactionSummary>,
    #[serde(default)]
    pub links: Vec<PageLink>,
}

impl HistoryPage {
    /// Query string of the `next` link, if the API reports another page.
    pub fn next_cursor(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.rel.as_deref() == Some("next"))
            .and_then(|l| l.href.as_ref())
            .map(|href| href.split('?').next_back().unwrap_or(href).to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct PageLink {
    pub rel: Option<String>,
    pub href: Option<String>,
}

/// Summary record from the history endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionSummary {
    pub id: Option<String>,
    pub client_transaction_id: Option<String>,
    pub timestamp: Option<String>,
    pub amount: Option<Value>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub payment_type: Option<String>,
    pub card_type: Option<String>,
    pub entry_mode: Option<String>,
    pub installments_count: Option<Value>,
}

/// Full record from the single-transaction endpoint. Summary fields are
/// repeated; the detail adds merchant, tax, location, product, and payout
/// data.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionDetail {
    pub merchant_code: Option<String>,
    pub username: Option<String>,
    pub auth_code: Option<String>,
    pub tax_enabled: Option<bool>,
    pub tip_amount: Option<Value>,
    pub vat_amount: Option<Value>,
    #[serde(default)]
    pub vat_rates: Vec<Value>,
    pub location: Option<RawLocation>,
    #[serde(default)]
    pub products: Vec<RawProduct>,
    #[serde(default)]
    pub events: Vec<RawPayoutEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLocation {
    pub lat: Option<Value>,
    pub lon: Option<Value>,
    pub horizontal_accuracy: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawProduct {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Value>,
    pub quantity: Option<Value>,
    pub total_price: Option<Value>,
    pub vat_amount: Option<Value>,
}

/// Payout event attached to a transaction. These carry no stable upstream
/// id, so the loader treats them as append-only.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPayoutEvent {
    pub amount: Option<Value>,
    pub fee_amount: Option<Value>,
    pub status: Option<String>,
    pub date: Option<String>,
}

/// A summary joined with its detail fetch, ready for the transformer.
#[derive(Debug, Clone)]
pub struct RawTransaction {
    pub summary: TransactionSummary,
    pub detail: TransactionDetail,
}
