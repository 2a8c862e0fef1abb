//! # Payload Builder
//!
//! Maps an invoice and its lines to the canonical authority representation.
//!
//! ## Shape
//! ```text
//! CanonicalPayload
//! ├── header: tin, branchId, serialNumber, invoiceNumber, originalReceiptNumber?
//! │           customerReference?, customerName?, salesTypeCode (N|C),
//! │           receiptTypeCode (S|R), paymentTypeCode (01..07),
//! │           salesDate (yyyyMMdd), confirmDateTime (yyyyMMddHHmmss)
//! ├── taxBuckets[A..E]: rate %, taxable, tax
//! ├── totals: itemCount, taxable, tax, grand total
//! └── items[]: seq, code, name, packageUnitCode, quantityUnitCode,
//!              quantity, unitPrice, taxTypeCode, taxableAmount, taxAmount, totalAmount
//! ```
//!
//! `build` is deterministic: every timestamp comes from the invoice itself,
//! so rebuilding from stored rows yields byte-identical canonical JSON.
//! Amounts are magnitudes in cents; the receipt type carries the sign.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::money::Money;
use crate::types::{Device, Invoice, InvoiceLine, TaxCode, TransactionType};
use crate::validation::out_of_range;
use crate::TOTALS_TOLERANCE_CENTS;

/// Authority date-time layout.
pub const DATETIME_FORMAT: &str = "%Y%m%d%H%M%S";
/// Authority date layout.
pub const DATE_FORMAT: &str = "%Y%m%d";

// =============================================================================
// Unit of Measure Table
// =============================================================================

/// Maps a unit-of-measure key to `(package unit code, quantity unit code)`.
///
/// ```rust
/// use fiscal_core::payload::unit_codes;
///
/// assert_eq!(unit_codes("kg"), ("BG", "KG"));
/// assert_eq!(unit_codes("LTR"), ("BT", "L"));
/// assert_eq!(unit_codes("crate"), ("NT", "U"));
/// ```
pub fn unit_codes(unit_of_measure: &str) -> (&'static str, &'static str) {
    match unit_of_measure.trim().to_ascii_lowercase().as_str() {
        "pcs" => ("NT", "U"),
        "kg" => ("BG", "KG"),
        "g" => ("BG", "GRM"),
        "l" | "ltr" => ("BT", "L"),
        "ml" => ("BT", "ML"),
        "box" => ("BX", "BX"),
        "m" => ("NT", "M"),
        "pack" => ("PK", "PK"),
        _ => ("NT", "U"),
    }
}

// =============================================================================
// Payload Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadLine {
    pub item_seq: i64,
    pub item_code: String,
    pub item_name: String,
    pub package_unit_code: String,
    pub quantity_unit_code: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub tax_type_code: TaxCode,
    pub taxable_amount: Money,
    pub tax_amount: Money,
    pub total_amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBucket {
    pub code: TaxCode,
    /// Statutory rate as a whole percentage.
    pub rate_percent: u32,
    pub taxable_amount: Money,
    pub tax_amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalPayload {
    pub tin: String,
    pub branch_id: String,
    pub serial_number: String,
    pub invoice_number: String,
    pub original_receipt_number: Option<String>,
    pub customer_reference: Option<String>,
    pub customer_name: Option<String>,
    pub sales_type_code: String,
    pub receipt_type_code: String,
    pub payment_type_code: String,
    pub sales_date: String,
    pub confirm_date_time: String,
    pub item_count: i64,
    pub tax_buckets: Vec<TaxBucket>,
    pub total_taxable_amount: Money,
    pub total_tax_amount: Money,
    pub total_amount: Money,
    pub items: Vec<PayloadLine>,
}

impl CanonicalPayload {
    /// Compact JSON with object keys sorted at every depth.
    ///
    /// This is the exact byte string that gets signed and checksummed.
    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        canonical_json(self)
    }
}

/// Serializes any value to compact JSON with recursively sorted keys.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&sort_keys(value))
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

// =============================================================================
// Build
// =============================================================================

/// Builds the canonical payload for `invoice`.
///
/// ## Errors
/// `TotalsMismatch { field: "grand_total" }` when Σ(line taxable + tax)
/// differs from the invoice's grand total by more than one cent;
/// `AmountOutOfRange` when a sum does not fit in 64-bit cents.
pub fn build(
    device: &Device,
    invoice: &Invoice,
    lines: &[InvoiceLine],
) -> Result<CanonicalPayload, ValidationError> {
    if lines.is_empty() {
        return Err(ValidationError::Required {
            field: "lines".to_string(),
        });
    }

    let mut ordered: Vec<&InvoiceLine> = lines.iter().collect();
    ordered.sort_by_key(|l| l.line_number);

    let items: Vec<PayloadLine> = ordered
        .iter()
        .map(|line| {
            let (pkg, qty_unit) = unit_codes(&line.unit_of_measure);
            let total_amount = line
                .total_price()
                .checked_add(line.tax_amount())
                .ok_or_else(|| out_of_range("total_amount"))?;
            Ok(PayloadLine {
                item_seq: line.line_number,
                item_code: line.item_code.clone(),
                item_name: line.item_name.clone(),
                package_unit_code: pkg.to_string(),
                quantity_unit_code: qty_unit.to_string(),
                quantity: line.quantity,
                unit_price: line.unit_price(),
                tax_type_code: line.tax_code,
                taxable_amount: line.total_price(),
                tax_amount: line.tax_amount(),
                total_amount,
            })
        })
        .collect::<Result<_, ValidationError>>()?;

    let tax_buckets: Vec<TaxBucket> = TaxCode::ALL
        .iter()
        .map(|code| {
            let in_bucket: Vec<&PayloadLine> =
                items.iter().filter(|i| i.tax_type_code == *code).collect();
            Ok(TaxBucket {
                code: *code,
                rate_percent: code.statutory_rate().bps() / 100,
                taxable_amount: Money::checked_sum(in_bucket.iter().map(|i| i.taxable_amount))
                    .ok_or_else(|| out_of_range("taxable_amount"))?,
                tax_amount: Money::checked_sum(in_bucket.iter().map(|i| i.tax_amount))
                    .ok_or_else(|| out_of_range("tax_amount"))?,
            })
        })
        .collect::<Result<_, ValidationError>>()?;

    let total_taxable = Money::checked_sum(tax_buckets.iter().map(|b| b.taxable_amount))
        .ok_or_else(|| out_of_range("total_taxable_amount"))?;
    let total_tax = Money::checked_sum(tax_buckets.iter().map(|b| b.tax_amount))
        .ok_or_else(|| out_of_range("total_tax_amount"))?;
    let line_sum = total_taxable
        .checked_add(total_tax)
        .ok_or_else(|| out_of_range("total_amount"))?;

    let header_total = invoice.total_amount().abs();
    if !line_sum.within(header_total, TOTALS_TOLERANCE_CENTS) {
        return Err(ValidationError::TotalsMismatch {
            field: "grand_total".to_string(),
            declared: header_total.cents(),
            computed: line_sum.cents(),
        });
    }

    Ok(CanonicalPayload {
        tin: device.tin.clone(),
        branch_id: device.branch_id.clone(),
        serial_number: device.serial_number.clone(),
        invoice_number: invoice.invoice_number.clone(),
        original_receipt_number: if invoice.is_copy {
            invoice.original_receipt_number.clone()
        } else {
            None
        },
        customer_reference: invoice.customer_reference.clone(),
        customer_name: invoice.customer_name.clone(),
        sales_type_code: if invoice.is_copy { "C" } else { "N" }.to_string(),
        receipt_type_code: match invoice.transaction_type {
            TransactionType::Sale => "S",
            TransactionType::Refund => "R",
        }
        .to_string(),
        payment_type_code: invoice.payment_method.authority_code().to_string(),
        sales_date: invoice.created_at.format(DATE_FORMAT).to_string(),
        confirm_date_time: invoice.created_at.format(DATETIME_FORMAT).to_string(),
        item_count: items.len() as i64,
        tax_buckets,
        total_taxable_amount: total_taxable,
        total_tax_amount: total_tax,
        total_amount: header_total,
        items,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
