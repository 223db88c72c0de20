//! Transformer — maps one raw payload into one normalized aggregate, or
//! fails with a validation error naming the offending field.
//!
//! Amounts are parsed as fixed-point decimals, never binary floats. A
//! record that fails validation is skipped and recorded; it never reaches
//! the loader. Recoverable oddities (unknown enum values, arithmetic
//! drift beyond tolerance, invalid coordinates) become warnings carried
//! alongside the aggregate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

use crate::api::types::RawTransaction;
use crate::error::ValidationError;
use crate::model::{
    Aggregate, LineItem, Location, Payout, PaymentType, Product, Transaction, TransactionStatus,
};

/// Recoverable issue found while normalizing a record. Surfaced in the
/// run summary; does not block the load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformWarning {
    UnknownStatus(String),
    UnknownPaymentType(String),
    AmountMismatch { product: String, detail: String },
    DroppedLocation(String),
}

/// A normalized aggregate plus the warnings collected on the way.
#[derive(Debug)]
pub struct Normalized {
    pub aggregate: Aggregate,
    pub warnings: Vec<TransformWarning>,
}

pub struct Transformer {
    tolerance: Decimal,
}

impl Transformer {
    pub fn new(tolerance: Decimal) -> Self {
        Self { tolerance }
    }

    pub fn transform(&self, raw: &RawTransaction) -> Result<Normalized, ValidationError> {
        let mut warnings = Vec::new();
        let summary = &raw.summary;
        let detail = &raw.detail;

        let id = summary
            .id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ValidationError::new("id", "missing transaction id"))?
            .to_string();

        let timestamp = parse_timestamp(
            "timestamp",
            summary
                .timestamp
                .as_deref()
                .ok_or_else(|| ValidationError::new("timestamp", "missing"))?,
        )?;

        let amount = required_decimal("amount", summary.amount.as_ref())?;
        let currency = summary
            .currency
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ValidationError::new("currency", "missing"))?
            .trim()
            .to_string();

        let raw_status = summary.status.as_deref().unwrap_or("");
        let (status, status_known) = TransactionStatus::parse(raw_status);
        if !status_known {
            warnings.push(TransformWarning::UnknownStatus(raw_status.to_string()));
        }

        let raw_payment = summary.payment_type.as_deref().unwrap_or("");
        let (payment_type, payment_known) = PaymentType::parse(raw_payment);
        if !payment_known {
            warnings.push(TransformWarning::UnknownPaymentType(raw_payment.to_string()));
        }

        let installments_count = match summary.installments_count.as_ref() {
            Some(v) => {
                let n = parse_integer("installments_count", v)?;
                if n < 1 {
                    return Err(ValidationError::new(
                        "installments_count",
                        format!("must be >= 1, got {}", n),
                    ));
                }
                i32::try_from(n).map_err(|_| {
                    ValidationError::new("installments_count", format!("out of range: {}", n))
                })?
            }
            None => 1,
        };

        let tip_amount = optional_decimal("tip_amount", detail.tip_amount.as_ref())?
            .unwrap_or(Decimal::ZERO);
        if tip_amount < Decimal::ZERO {
            return Err(ValidationError::new("tip_amount", "must be >= 0"));
        }
        let vat_amount = optional_decimal("vat_amount", detail.vat_amount.as_ref())?
            .unwrap_or(Decimal::ZERO);
        if vat_amount < Decimal::ZERO {
            return Err(ValidationError::new("vat_amount", "must be >= 0"));
        }

        let transaction = Transaction {
            id: id.clone(),
            client_transaction_id: summary.client_transaction_id.clone(),
            timestamp,
            amount,
            currency,
            status,
            payment_type,
            card_type: none_if_blank(&summary.card_type),
            entry_mode: none_if_blank(&summary.entry_mode),
            merchant_code: none_if_blank(&detail.merchant_code),
            username: none_if_blank(&detail.username),
            auth_code: none_if_blank(&detail.auth_code),
            installments_count,
            tip_amount,
            vat_amount,
            tax_enabled: detail.tax_enabled.unwrap_or(false),
        };

        let location = self.transform_location(raw, &mut warnings)?;
        let (products, line_items) = self.transform_products(raw, &mut warnings)?;
        let payouts = transform_payouts(raw)?;

        Ok(Normalized {
            aggregate: Aggregate {
                transaction,
                location,
                products,
                line_items,
                payouts,
            },
            warnings,
        })
    }

    /// Coordinates outside the valid range drop the location, not the
    /// transaction.
    fn transform_location(
        &self,
        raw: &RawTransaction,
        warnings: &mut Vec<TransformWarning>,
    ) -> Result<Option<Location>, ValidationError> {
        let Some(loc) = raw.detail.location.as_ref() else {
            return Ok(None);
        };
        let (Some(lat_v), Some(lon_v)) = (loc.lat.as_ref(), loc.lon.as_ref()) else {
            return Ok(None);
        };
        let lat = required_decimal("location.lat", Some(lat_v))?;
        let lon = required_decimal("location.lon", Some(lon_v))?;

        let lat_max = Decimal::from(90);
        let lon_max = Decimal::from(180);
        if lat < -lat_max || lat > lat_max || lon < -lon_max || lon > lon_max {
            warnings.push(TransformWarning::DroppedLocation(format!(
                "coordinates out of range: ({}, {})",
                lat, lon
            )));
            return Ok(None);
        }

        Ok(Some(Location {
            lat: lat.round_dp(6),
            lon: lon.round_dp(6),
            horizontal_accuracy: optional_decimal(
                "location.horizontal_accuracy",
                loc.horizontal_accuracy.as_ref(),
            )?,
        }))
    }

    /// Expand product entries into the catalog rows and line items.
    /// VAT rates are matched to products by position. Entries are
    /// deduplicated by trimmed, case-preserved name; a repeated product
    /// within one transaction merges into a single line item.
    fn transform_products(
        &self,
        raw: &RawTransaction,
        warnings: &mut Vec<TransformWarning>,
    ) -> Result<(Vec<Product>, Vec<LineItem>), ValidationError> {
        let mut products: Vec<Product> = Vec::new();
        let mut line_items: Vec<LineItem> = Vec::new();
        let mut index_by_name: HashMap<String, usize> = HashMap::new();

        for (pos, rp) in raw.detail.products.iter().enumerate() {
            let field = format!("products[{}]", pos);
            let name = rp
                .name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ValidationError::new(format!("{}.name", field), "missing"))?
                .to_string();

            let quantity = match rp.quantity.as_ref() {
                Some(v) => parse_integer(&format!("{}.quantity", field), v)?,
                None => 1,
            };
            if quantity <= 0 {
                return Err(ValidationError::new(
                    format!("{}.quantity", field),
                    format!("must be > 0, got {}", quantity),
                ));
            }
            let quantity = i32::try_from(quantity).map_err(|_| {
                ValidationError::new(
                    format!("{}.quantity", field),
                    format!("out of range: {}", quantity),
                )
            })?;

            let unit_price = required_decimal(&format!("{}.price", field), rp.price.as_ref())?;
            let item_vat = optional_decimal(&format!("{}.vat_amount", field), rp.vat_amount.as_ref())?
                .unwrap_or(Decimal::ZERO);
            let vat_rate = raw
                .detail
                .vat_rates
                .get(pos)
                .map(|v| required_decimal(&format!("vat_rates[{}]", pos), Some(v)))
                .transpose()?;

            let computed = (unit_price * Decimal::from(quantity) + item_vat).round_dp(2);
            let total_price = match rp.total_price.as_ref() {
                Some(v) => {
                    let stated = required_decimal(&format!("{}.total_price", field), Some(v))?;
                    // Recorded, not silently corrected
                    if (stated - computed).abs() > self.tolerance {
                        warnings.push(TransformWarning::AmountMismatch {
                            product: name.clone(),
                            detail: format!("stated total {} != computed {}", stated, computed),
                        });
                    }
                    stated
                }
                None => computed,
            };

            match index_by_name.get(&name) {
                Some(&idx) => {
                    let item = &mut line_items[idx];
                    item.quantity = item.quantity.checked_add(quantity).ok_or_else(|| {
                        ValidationError::new(
                            format!("{}.quantity", field),
                            "merged quantity out of range",
                        )
                    })?;
                    item.total_price += total_price;
                    item.vat_amount += item_vat;
                }
                None => {
                    index_by_name.insert(name.clone(), line_items.len());
                    products.push(Product {
                        name: name.clone(),
                        description: none_if_blank(&rp.description),
                        price: Some(unit_price),
                    });
                    line_items.push(LineItem {
                        product_name: name,
                        quantity,
                        unit_price,
                        total_price,
                        vat_amount: item_vat,
                        vat_rate,
                    });
                }
            }
        }

        Ok((products, line_items))
    }
}

fn transform_payouts(raw: &RawTransaction) -> Result<Vec<Payout>, ValidationError> {
    let mut payouts = Vec::new();
    for (pos, ev) in raw.detail.events.iter().enumerate() {
        let field = format!("events[{}]", pos);
        let amount = required_decimal(&format!("{}.amount", field), ev.amount.as_ref())?;
        let fee_amount = optional_decimal(&format!("{}.fee_amount", field), ev.fee_amount.as_ref())?
            .unwrap_or(Decimal::ZERO);
        let payout_date = ev
            .date
            .as_deref()
            .map(|d| {
                chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").map_err(|e| {
                    ValidationError::new(format!("{}.date", field), e.to_string())
                })
            })
            .transpose()?;
        payouts.push(Payout {
            amount,
            fee_amount,
            status: ev.status.as_deref().unwrap_or("UNKNOWN").trim().to_uppercase(),
            payout_date,
        });
    }
    Ok(payouts)
}

// ── Field parsing helpers ──────────────────────────────────────────

/// Parse a JSON value into a fixed-point decimal. Accepts numbers and
/// strings; strings tolerate thousands separators ("1,234.56").
fn parse_decimal(field: &str, value: &Value) -> Result<Decimal, ValidationError> {
    let text = match value {
        Value::String(s) => s.replace(',', ""),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(ValidationError::new(
                field,
                format!("expected number or string, got {}", type_name(other)),
            ))
        }
    };
    Decimal::from_str(text.trim())
        .map_err(|e| ValidationError::new(field, format!("not a valid amount: {}", e)))
}

fn required_decimal(field: &str, value: Option<&Value>) -> Result<Decimal, ValidationError> {
    match value {
        Some(Value::Null) | None => Err(ValidationError::new(field, "missing")),
        Some(v) => parse_decimal(field, v),
    }
}

fn optional_decimal(field: &str, value: Option<&Value>) -> Result<Option<Decimal>, ValidationError> {
    match value {
        Some(Value::Null) | None => Ok(None),
        Some(v) => parse_decimal(field, v).map(Some),
    }
}

fn parse_integer(field: &str, value: &Value) -> Result<i64, ValidationError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| ValidationError::new(field, "not an integer")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ValidationError::new(field, "not an integer")),
        other => Err(ValidationError::new(
            field,
            format!("expected integer, got {}", type_name(other)),
        )),
    }
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ValidationError::new(field, format!("invalid timestamp: {}", e)))
}

fn none_if_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{TransactionDetail, TransactionSummary};
    use serde_json::json;

    fn summary(id: &str, amount: &str) -> TransactionSummary {
        serde_json::from_value(json!({
            "id": id,
            "timestamp": "2024-03-01T10:30:00Z",
            "amount": amount,
            "currency": "EUR",
            "status": "SUCCESSFUL",
            "payment_type": "POS",
        }))
        .unwrap()
    }

    fn raw(summary: TransactionSummary, detail: TransactionDetail) -> RawTransaction {
        RawTransaction { summary, detail }
    }

    fn transformer() -> Transformer {
        Transformer::new(Decimal::new(1, 2))
    }

    #[test]
    fn single_product_page_example() {
        let detail: TransactionDetail = serde_json::from_value(json!({
            "products": [{"name": "Loaf", "price": "2.50", "quantity": 4}],
        }))
        .unwrap();
        let normalized = transformer().transform(&raw(summary("T1", "10.00"), detail)).unwrap();

        let agg = &normalized.aggregate;
        assert_eq!(agg.transaction.id, "T1");
        assert_eq!(agg.transaction.amount, Decimal::new(1000, 2));
        assert_eq!(agg.products.len(), 1);
        assert_eq!(agg.products[0].name, "Loaf");
        assert_eq!(agg.line_items.len(), 1);
        assert_eq!(agg.line_items[0].total_price, Decimal::new(1000, 2));
        assert!(normalized.warnings.is_empty());
    }

    #[test]
    fn missing_amount_fails_with_field_path() {
        let mut s = summary("T2", "1.00");
        s.amount = None;
        let err = transformer().transform(&raw(s, TransactionDetail::default())).unwrap_err();
        assert_eq!(err.field, "amount");
    }

    #[test]
    fn amount_string_tolerates_thousands_separator() {
        let normalized = transformer()
            .transform(&raw(summary("T3", "1,234.56"), TransactionDetail::default()))
            .unwrap();
        assert_eq!(normalized.aggregate.transaction.amount, Decimal::new(123_456, 2));
    }

    #[test]
    fn unknown_status_is_flagged_not_fatal() {
        let mut s = summary("T4", "5.00");
        s.status = Some("CHARGED_BACK".into());
        let normalized = transformer().transform(&raw(s, TransactionDetail::default())).unwrap();
        assert_eq!(
            normalized.aggregate.transaction.status,
            TransactionStatus::Unknown
        );
        assert!(matches!(
            normalized.warnings[0],
            TransformWarning::UnknownStatus(_)
        ));
    }

    #[test]
    fn total_price_mismatch_is_recorded_not_corrected() {
        let detail: TransactionDetail = serde_json::from_value(json!({
            "products": [{"name": "Roll", "price": "1.00", "quantity": 2, "total_price": "2.50"}],
        }))
        .unwrap();
        let normalized = transformer().transform(&raw(summary("T5", "2.50"), detail)).unwrap();
        // The stated total is kept as-is
        assert_eq!(normalized.aggregate.line_items[0].total_price, Decimal::new(250, 2));
        assert!(matches!(
            normalized.warnings[0],
            TransformWarning::AmountMismatch { .. }
        ));
    }

    #[test]
    fn repeated_product_merges_into_one_line_item() {
        let detail: TransactionDetail = serde_json::from_value(json!({
            "products": [
                {"name": "Bun ", "price": "1.50", "quantity": 1},
                {"name": "Bun", "price": "1.50", "quantity": 2},
            ],
        }))
        .unwrap();
        let normalized = transformer().transform(&raw(summary("T6", "4.50"), detail)).unwrap();
        assert_eq!(normalized.aggregate.products.len(), 1);
        assert_eq!(normalized.aggregate.line_items.len(), 1);
        assert_eq!(normalized.aggregate.line_items[0].quantity, 3);
        assert_eq!(
            normalized.aggregate.line_items[0].total_price,
            Decimal::new(450, 2)
        );
    }

    #[test]
    fn vat_rates_match_products_by_position() {
        let detail: TransactionDetail = serde_json::from_value(json!({
            "vat_rates": ["19.0", "7.0"],
            "products": [
                {"name": "Coffee", "price": "3.00", "quantity": 1},
                {"name": "Cake", "price": "4.00", "quantity": 1},
            ],
        }))
        .unwrap();
        let normalized = transformer().transform(&raw(summary("T7", "7.00"), detail)).unwrap();
        assert_eq!(
            normalized.aggregate.line_items[0].vat_rate,
            Some(Decimal::new(190, 1))
        );
        assert_eq!(
            normalized.aggregate.line_items[1].vat_rate,
            Some(Decimal::new(70, 1))
        );
    }

    #[test]
    fn out_of_range_coordinates_drop_location_only() {
        let detail: TransactionDetail = serde_json::from_value(json!({
            "location": {"lat": 95.0, "lon": 13.4},
        }))
        .unwrap();
        let normalized = transformer().transform(&raw(summary("T8", "1.00"), detail)).unwrap();
        assert!(normalized.aggregate.location.is_none());
        assert!(matches!(
            normalized.warnings[0],
            TransformWarning::DroppedLocation(_)
        ));
    }

    #[test]
    fn oversized_quantity_is_rejected_not_wrapped() {
        let detail: TransactionDetail = serde_json::from_value(json!({
            "products": [{"name": "Loaf", "price": "2.50", "quantity": 5_000_000_000i64}],
        }))
        .unwrap();
        let err = transformer()
            .transform(&raw(summary("T10", "1.00"), detail))
            .unwrap_err();
        assert_eq!(err.field, "products[0].quantity");
        assert!(err.reason.contains("out of range"));
    }

    #[test]
    fn oversized_installments_count_is_rejected_not_wrapped() {
        let mut s = summary("T11", "1.00");
        s.installments_count = Some(json!(4_294_967_296i64));
        let err = transformer()
            .transform(&raw(s, TransactionDetail::default()))
            .unwrap_err();
        assert_eq!(err.field, "installments_count");
        assert!(err.reason.contains("out of range"));
    }

    #[test]
    fn zero_quantity_is_a_validation_error() {
        let detail: TransactionDetail = serde_json::from_value(json!({
            "products": [{"name": "Loaf", "price": "2.50", "quantity": 0}],
        }))
        .unwrap();
        let err = transformer().transform(&raw(summary("T9", "0.00"), detail)).unwrap_err();
        assert_eq!(err.field, "products[0].quantity");
    }
}
