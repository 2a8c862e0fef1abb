//! # Validation Module
//!
//! Line pricing and the totals invariant.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Caller (API surface, out of process)                         │
//! │  └── Type validation (deserialization)                                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Field rules (codes, names, 0 < quantity ≤ max, 0 ≤ price ≤ max)   │
//! │  ├── Line pricing (total = qty × price, tax = total × rate)            │
//! │  └── Totals invariant (declared vs computed, ±1 cent)                  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Compliance guard (device state, copy, polarity)              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 4: Database (UNIQUE (device_id, invoice_number), FKs)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Declared totals are validated, never silently recomputed.

use uuid::Uuid;

use crate::error::ValidationError;
use crate::money::Money;
use crate::types::{InvoiceLine, NewInvoice, NewInvoiceLine, TaxRate, TransactionType};
use crate::{MAX_INVOICE_LINES, MAX_LINE_QUANTITY, MAX_UNIT_PRICE_CENTS, TOTALS_TOLERANCE_CENTS};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

fn require_text(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    Ok(())
}

/// Validates an invoice number.
///
/// ## Rules
/// - Must not be empty
/// - At most 50 characters
/// - Letters, digits, `-`, `_` and `/` only
///
/// ```rust
/// use fiscal_core::validation::validate_invoice_number;
///
/// assert!(validate_invoice_number("INV-2024-0001").is_ok());
/// assert!(validate_invoice_number("").is_err());
/// assert!(validate_invoice_number("INV 1").is_err());
/// ```
pub fn validate_invoice_number(number: &str) -> ValidationResult<()> {
    require_text("invoice_number", number, 50)?;

    if !number
        .trim()
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '/')
    {
        return Err(ValidationError::InvalidFormat {
            field: "invoice_number".to_string(),
            reason: "must contain only letters, numbers, '-', '_' and '/'".to_string(),
        });
    }

    Ok(())
}

/// Validates a serial number or TIN style identifier.
pub fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    require_text(field, value, 64)?;

    if value.trim().chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must not contain whitespace".to_string(),
        });
    }

    Ok(())
}

/// Validates a UUID string.
pub fn validate_uuid(field: &str, id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    Uuid::parse_str(id).map_err(|_| ValidationError::InvalidFormat {
        field: field.to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Quantity must be strictly positive and at most [`MAX_LINE_QUANTITY`].
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }
    if qty > MAX_LINE_QUANTITY {
        return Err(out_of_range("quantity"));
    }
    Ok(())
}

/// Unit price may be zero (free items) but never negative, and at most
/// [`MAX_UNIT_PRICE_CENTS`].
pub fn validate_price_cents(cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::MustNotBeNegative {
            field: "unit_price".to_string(),
        });
    }
    if cents > MAX_UNIT_PRICE_CENTS {
        return Err(out_of_range("unit_price"));
    }
    Ok(())
}

pub(crate) fn out_of_range(field: &str) -> ValidationError {
    ValidationError::AmountOutOfRange {
        field: field.to_string(),
    }
}

// =============================================================================
// Line Pricing
// =============================================================================

/// Validates one caller line and derives its totals.
///
/// ## Derivation
/// ```text
/// total_price = quantity × unit_price
/// tax_amount  = round(total_price × rate / 100)
/// ```
/// The declared rate must equal the statutory rate of the tax code.
pub fn price_line(
    invoice_id: &str,
    line_number: usize,
    line: &NewInvoiceLine,
) -> ValidationResult<InvoiceLine> {
    require_text("item_code", &line.item_code, 50)?;
    require_text("item_name", &line.item_name, 200)?;
    validate_quantity(line.quantity)?;
    validate_price_cents(line.unit_price_cents)?;

    let expected = line.tax_code.statutory_rate();
    if expected.bps() != line.tax_rate_bps {
        return Err(ValidationError::TaxRateMismatch {
            line: line_number,
            code: line.tax_code.to_string(),
            expected: expected.bps(),
            given: line.tax_rate_bps,
        });
    }

    let unit_price = Money::from_cents(line.unit_price_cents);
    let total_price = unit_price
        .checked_multiply_quantity(line.quantity)
        .ok_or_else(|| out_of_range("total_price"))?;
    let tax_amount = total_price.calculate_tax(TaxRate::from_bps(line.tax_rate_bps));

    let unit = line.unit_of_measure.trim();

    Ok(InvoiceLine {
        id: Uuid::new_v4().to_string(),
        invoice_id: invoice_id.to_string(),
        line_number: line_number as i64,
        item_code: line.item_code.trim().to_string(),
        item_name: line.item_name.trim().to_string(),
        quantity: line.quantity,
        unit_price_cents: unit_price.cents(),
        unit_of_measure: if unit.is_empty() { "pcs".to_string() } else { unit.to_ascii_lowercase() },
        tax_code: line.tax_code,
        tax_rate_bps: line.tax_rate_bps as i64,
        total_price_cents: total_price.cents(),
        tax_amount_cents: tax_amount.cents(),
    })
}

// =============================================================================
// Totals Invariant
// =============================================================================

/// Computed sums over priced lines, as magnitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTotals {
    pub taxable: Money,
    pub tax: Money,
}

impl LineTotals {
    /// Sums the lines; `AmountOutOfRange` if the sums overflow.
    pub fn of(lines: &[InvoiceLine]) -> ValidationResult<Self> {
        let totals = LineTotals {
            taxable: Money::checked_sum(lines.iter().map(InvoiceLine::total_price))
                .ok_or_else(|| out_of_range("total_amount"))?,
            tax: Money::checked_sum(lines.iter().map(InvoiceLine::tax_amount))
                .ok_or_else(|| out_of_range("tax_amount"))?,
        };
        totals.grand_total()?;
        Ok(totals)
    }

    #[inline]
    pub fn grand_total(&self) -> ValidationResult<Money> {
        self.taxable
            .checked_add(self.tax)
            .ok_or_else(|| out_of_range("total_amount"))
    }

    /// Signed totals as they must be declared for the transaction type.
    ///
    /// Lines carry magnitudes, so a refund declares the negated sum.
    pub fn signed_for(&self, transaction_type: TransactionType) -> ValidationResult<(Money, Money)> {
        let grand_total = self.grand_total()?;
        Ok(match transaction_type {
            TransactionType::Sale => (grand_total, self.tax),
            TransactionType::Refund => (-grand_total, -self.tax),
        })
    }
}

/// Checks `total_amount == Σ line.total_price + Σ line.tax_amount` (±1 cent).
///
/// ```rust
/// use fiscal_core::money::Money;
/// use fiscal_core::types::TransactionType;
/// use fiscal_core::validation::{validate_totals, LineTotals};
///
/// let totals = LineTotals { taxable: Money::from_cents(100_000), tax: Money::from_cents(16_000) };
/// assert!(validate_totals(TransactionType::Sale, 116_000, 16_000, &totals).is_ok());
/// assert!(validate_totals(TransactionType::Sale, 116_150, 16_000, &totals).is_err());
/// ```
pub fn validate_totals(
    transaction_type: TransactionType,
    declared_total_cents: i64,
    declared_tax_cents: i64,
    totals: &LineTotals,
) -> ValidationResult<()> {
    let (expected_total, expected_tax) = totals.signed_for(transaction_type)?;

    if !Money::from_cents(declared_total_cents).within(expected_total, TOTALS_TOLERANCE_CENTS) {
        return Err(ValidationError::TotalsMismatch {
            field: "total_amount".to_string(),
            declared: declared_total_cents,
            computed: expected_total.cents(),
        });
    }

    if !Money::from_cents(declared_tax_cents).within(expected_tax, TOTALS_TOLERANCE_CENTS) {
        return Err(ValidationError::TotalsMismatch {
            field: "tax_amount".to_string(),
            declared: declared_tax_cents,
            computed: expected_tax.cents(),
        });
    }

    Ok(())
}

/// Validates a caller invoice and returns its priced lines.
///
/// Compliance rules (device state, copy reference, polarity) are not checked
/// here; see [`crate::compliance`].
pub fn validate_new_invoice(
    invoice_id: &str,
    invoice: &NewInvoice,
) -> ValidationResult<Vec<InvoiceLine>> {
    validate_identifier("device_serial", &invoice.device_serial)?;
    validate_invoice_number(&invoice.invoice_number)?;

    if invoice.lines.is_empty() {
        return Err(ValidationError::Required {
            field: "lines".to_string(),
        });
    }
    if invoice.lines.len() > MAX_INVOICE_LINES {
        return Err(ValidationError::TooLong {
            field: "lines".to_string(),
            max: MAX_INVOICE_LINES,
        });
    }

    let lines = invoice
        .lines
        .iter()
        .enumerate()
        .map(|(i, line)| price_line(invoice_id, i + 1, line))
        .collect::<ValidationResult<Vec<_>>>()?;

    validate_totals(
        invoice.transaction_type,
        invoice.total_amount_cents,
        invoice.tax_amount_cents,
        &LineTotals::of(&lines)?,
    )?;

    Ok(lines)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PaymentMethod, TaxCode};

    fn soap_line(qty: i64) -> NewInvoiceLine {
        NewInvoiceLine {
            item_code: "SOAP-01".to_string(),
            item_name: "Bar Soap".to_string(),
            quantity: qty,
            unit_price_cents: 50_000,
            unit_of_measure: "pcs".to_string(),
            tax_code: TaxCode::A,
            tax_rate_bps: 1600,
        }
    }

    fn invoice(total: i64, tax: i64, tx: TransactionType) -> NewInvoice {
        NewInvoice {
            device_serial: "SN-001".to_string(),
            invoice_number: "INV-0001".to_string(),
            customer_reference: None,
            customer_name: None,
            payment_method: PaymentMethod::Cash,
            transaction_type: tx,
            is_copy: false,
            original_receipt_number: None,
            total_amount_cents: total,
            tax_amount_cents: tax,
            lines: vec![soap_line(2)],
        }
    }

    #[test]
    fn test_price_line() {
        let line = price_line("inv", 1, &soap_line(2)).unwrap();
        assert_eq!(line.total_price_cents, 100_000);
        assert_eq!(line.tax_amount_cents, 16_000);
        assert_eq!(line.line_number, 1);
    }

    #[test]
    fn test_price_line_rejects_bad_fields() {
        assert!(matches!(
            price_line("inv", 1, &soap_line(0)),
            Err(ValidationError::MustBePositive { .. })
        ));

        let mut line = soap_line(1);
        line.unit_price_cents = -1;
        assert!(matches!(
            price_line("inv", 1, &line),
            Err(ValidationError::MustNotBeNegative { .. })
        ));

        let mut line = soap_line(1);
        line.tax_rate_bps = 800;
        assert!(matches!(
            price_line("inv", 1, &line),
            Err(ValidationError::TaxRateMismatch { expected: 1600, given: 800, .. })
        ));
    }

    #[test]
    fn test_oversized_lines_rejected_not_wrapped() {
        // 200 trillion × 500.00 would overflow i64 cents
        let huge = soap_line(200_000_000_000_000);
        assert_eq!(
            price_line("inv", 1, &huge).unwrap_err(),
            ValidationError::AmountOutOfRange {
                field: "quantity".to_string()
            }
        );

        let mut pricey = soap_line(1);
        pricey.unit_price_cents = MAX_UNIT_PRICE_CENTS + 1;
        assert!(matches!(
            price_line("inv", 1, &pricey),
            Err(ValidationError::AmountOutOfRange { ref field }) if field == "unit_price"
        ));

        // Each factor within its cap, product still too large
        let mut both = soap_line(MAX_LINE_QUANTITY);
        both.unit_price_cents = MAX_UNIT_PRICE_CENTS;
        let err = price_line("inv", 1, &both).unwrap_err();
        assert_eq!(err.code(), "AMOUNT_OUT_OF_RANGE");
    }

    #[test]
    fn test_invoice_sum_overflow_rejected() {
        // Every line fits; ten of them do not
        let mut line = soap_line(1_000_000);
        line.unit_price_cents = MAX_UNIT_PRICE_CENTS;
        let mut inv = invoice(i64::MAX, 0, TransactionType::Sale);
        inv.lines = vec![line; 10];

        assert!(matches!(
            validate_new_invoice("inv", &inv),
            Err(ValidationError::AmountOutOfRange { .. })
        ));
    }

    #[test]
    fn test_totals_invariant_accepts_exact_and_one_cent() {
        let lines = validate_new_invoice("inv", &invoice(116_000, 16_000, TransactionType::Sale));
        assert_eq!(lines.unwrap().len(), 1);

        assert!(validate_new_invoice("inv", &invoice(116_001, 16_000, TransactionType::Sale)).is_ok());
    }

    #[test]
    fn test_totals_invariant_rejects_drift() {
        let err = validate_new_invoice("inv", &invoice(116_150, 16_000, TransactionType::Sale))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::TotalsMismatch {
                field: "total_amount".to_string(),
                declared: 116_150,
                computed: 116_000,
            }
        );
    }

    #[test]
    fn test_refund_declares_negated_totals() {
        assert!(validate_new_invoice("inv", &invoice(-116_000, -16_000, TransactionType::Refund)).is_ok());
        assert!(validate_new_invoice("inv", &invoice(116_000, 16_000, TransactionType::Refund)).is_err());
    }

    #[test]
    fn test_empty_lines_rejected() {
        let mut inv = invoice(0, 0, TransactionType::Sale);
        inv.lines.clear();
        assert!(matches!(
            validate_new_invoice("inv", &inv),
            Err(ValidationError::Required { .. })
        ));
    }

    #[test]
    fn test_validate_invoice_number() {
        assert!(validate_invoice_number("INV/2024/001").is_ok());
        assert!(validate_invoice_number("   ").is_err());
        assert!(validate_invoice_number(&"9".repeat(51)).is_err());
    }

    #[test]
    fn test_validate_uuid() {
        assert!(validate_uuid("id", "550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_uuid("id", "not-a-uuid").is_err());
    }
}
