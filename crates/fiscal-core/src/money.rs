//! # Money Module
//!
//! Integer minor-unit money for invoice arithmetic.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE RECONCILIATION PROBLEM                                             │
//! │                                                                         │
//! │  The authority rejects an invoice whose header total does not match    │
//! │  the sum of its lines. With floats:                                    │
//! │    3 × 33.33 + 16% tax = 115.98839999...  → which cent is right?       │
//! │                                                                         │
//! │  With integer cents every line total, tax amount and bucket subtotal   │
//! │  is exact, and the only rounding step is the per-line tax.             │
//! │                                                                         │
//! │  Products and sums are checked: an amount that does not fit in i64     │
//! │  is `None`, never a wrapped value.                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use fiscal_core::money::Money;
//! use fiscal_core::types::TaxRate;
//!
//! let price = Money::from_cents(50_000); // 500.00
//! let line_total = price.checked_multiply_quantity(2).unwrap();
//! let tax = line_total.calculate_tax(TaxRate::from_bps(1600));
//! assert_eq!(tax.cents(), 16_000);
//! assert!(price.checked_multiply_quantity(i64::MAX).is_none());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Neg;

use crate::types::TaxRate;

/// A monetary value in the smallest currency unit.
///
/// Serializes as a bare integer, which keeps canonical payloads free of
/// floating point formatting differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from minor units.
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Creates a Money value from major and minor units.
    ///
    /// ```rust
    /// use fiscal_core::money::Money;
    ///
    /// assert_eq!(Money::from_major_minor(1160, 0).cents(), 116_000);
    /// assert_eq!(Money::from_major_minor(-5, 50).cents(), -550);
    /// ```
    #[inline]
    pub const fn from_major_minor(major: i64, minor: i64) -> Self {
        if major < 0 {
            Money(major * 100 - minor)
        } else {
            Money(major * 100 + minor)
        }
    }

    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub const fn abs(&self) -> Self {
        Money(self.0.saturating_abs())
    }

    /// Calculates tax on this amount, rounding half away from zero.
    ///
    /// ## Implementation
    /// `(amount × bps ± 5000) / 10000` in i128, so a 16% line on a very
    /// large amount cannot overflow.
    ///
    /// ```rust
    /// use fiscal_core::money::Money;
    /// use fiscal_core::types::TaxRate;
    ///
    /// let tax = Money::from_cents(1_005).calculate_tax(TaxRate::from_bps(1600));
    /// assert_eq!(tax.cents(), 161); // 160.8 → 161
    /// ```
    pub fn calculate_tax(&self, rate: TaxRate) -> Money {
        let product = self.0 as i128 * rate.bps() as i128;
        let rounded = if product >= 0 {
            (product + 5_000) / 10_000
        } else {
            (product - 5_000) / 10_000
        };
        Money(rounded as i64)
    }

    /// Multiplies a unit price by a quantity; `None` on overflow.
    #[inline]
    pub const fn checked_multiply_quantity(&self, qty: i64) -> Option<Self> {
        match self.0.checked_mul(qty) {
            Some(cents) => Some(Money(cents)),
            None => None,
        }
    }

    /// Adds two amounts; `None` on overflow.
    #[inline]
    pub const fn checked_add(&self, other: Money) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(cents) => Some(Money(cents)),
            None => None,
        }
    }

    /// Sums amounts; `None` if any partial sum overflows.
    pub fn checked_sum<I: IntoIterator<Item = Money>>(amounts: I) -> Option<Self> {
        amounts
            .into_iter()
            .try_fold(Money::zero(), |acc, m| acc.checked_add(m))
    }

    /// Returns true when the two amounts differ by at most `tolerance`.
    ///
    /// Used by the totals invariant, which allows a one-cent drift.
    #[inline]
    pub const fn within(&self, other: Money, tolerance: i64) -> bool {
        tolerance >= 0 && self.0.abs_diff(other.0) <= tolerance as u64
    }
}

/// Renders the amount as a plain decimal (`1160.00`), the notation used in
/// log lines and authority error details.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{}{}.{:02}", sign, (self.0 / 100).abs(), (self.0 % 100).abs())
    }
}

impl Neg for Money {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Money(self.0.saturating_neg())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
