//! # Error Types
//!
//! Domain-specific error types for fiscal-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fiscal-core errors (this file)                                        │
//! │  ├── CoreError        - Domain errors (wraps the two below)            │
//! │  ├── ValidationError  - Malformed invoice data                         │
//! │  └── ComplianceError  - Device may not submit right now                │
//! │                                                                         │
//! │  fiscal-db errors (separate crate)                                     │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  fiscal-gateway errors (separate crate)                                │
//! │  ├── GatewayFailure   - One authority call failed (with retryability)  │
//! │  └── GatewayError     - What callers of the submission service see     │
//! │                                                                         │
//! │  Flow: Validation/Compliance → CoreError → GatewayError → Caller       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Validation and compliance failures are synchronous and never retried.
//! Each variant carries a stable reason code via `code()`.

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core business logic errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invoice data failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Device failed the compliance guard.
    #[error("Compliance violation: {0}")]
    Compliance(#[from] ComplianceError),
}

impl CoreError {
    /// Stable reason code for callers.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(e) => e.code(),
            CoreError::Compliance(e) => e.code(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Invoice data validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// A quantity, price or computed amount is too large for an invoice.
    ///
    /// ## When This Occurs
    /// - Quantity above `MAX_LINE_QUANTITY` or price above `MAX_UNIT_PRICE_CENTS`
    /// - A line total or invoice sum that does not fit in 64-bit cents
    #[error("{field} is out of range")]
    AmountOutOfRange { field: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },

    /// Declared line tax rate disagrees with the classification code.
    #[error("line {line}: tax code {code} requires rate {expected} bps, got {given} bps")]
    TaxRateMismatch {
        line: usize,
        code: String,
        expected: u32,
        given: u32,
    },

    /// A declared total does not match the computed one.
    ///
    /// ## When This Occurs
    /// ```text
    /// declared total_amount : 1161.50
    /// Σ line totals + Σ tax : 1160.00
    ///                          ─────── differs by more than 0.01
    ///                          ──► TotalsMismatch
    /// ```
    #[error("{field} mismatch: declared {declared} cents, computed {computed} cents")]
    TotalsMismatch {
        field: String,
        declared: i64,
        computed: i64,
    },

    /// A copy receipt without the original receipt reference.
    #[error("copy receipt requires the original receipt number")]
    CopyReferenceRequired,

    /// A non-copy invoice carrying an original receipt reference.
    #[error("original receipt number is only allowed on copy receipts")]
    UnexpectedCopyReference,

    /// Amount sign disagrees with the transaction type.
    #[error("{transaction_type} amount has wrong sign: {amount} cents")]
    PolarityViolation {
        transaction_type: String,
        amount: i64,
    },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::Required { .. } => "REQUIRED",
            ValidationError::MustBePositive { .. } => "MUST_BE_POSITIVE",
            ValidationError::MustNotBeNegative { .. } => "MUST_NOT_BE_NEGATIVE",
            ValidationError::TooLong { .. } => "TOO_LONG",
            ValidationError::InvalidFormat { .. } => "INVALID_FORMAT",
            ValidationError::NotAllowed { .. } => "NOT_ALLOWED",
            ValidationError::AmountOutOfRange { .. } => "AMOUNT_OUT_OF_RANGE",
            ValidationError::TaxRateMismatch { .. } => "TAX_RATE_MISMATCH",
            ValidationError::TotalsMismatch { .. } => "TOTALS_MISMATCH",
            ValidationError::CopyReferenceRequired => "COPY_REFERENCE_REQUIRED",
            ValidationError::UnexpectedCopyReference => "UNEXPECTED_COPY_REFERENCE",
            ValidationError::PolarityViolation { .. } => "POLARITY_VIOLATION",
        }
    }
}

// =============================================================================
// Compliance Error
// =============================================================================

/// Reasons a device may not submit.
///
/// ## Guard Order
/// ```text
/// CanSubmit ──► IsCertified ──► ValidateCopyReceipt ──► ValidateTransactionPolarity
///  │                │
///  ├ NEVER_SYNCED   ├ DEVICE_INACTIVE
///  └ OFFLINE_TOO_LONG├ NOT_CERTIFIED
///                   └ MISSING_SECRET
/// ```
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComplianceError {
    /// Device has never had a successful contact with the authority.
    #[error("device {serial} has never synchronised with the authority")]
    NeverSynced { serial: String },

    /// Device exceeded the permitted offline window.
    #[error("device {serial} has been offline for {hours_offline}h (limit {limit_hours}h)")]
    OfflineTooLong {
        serial: String,
        hours_offline: i64,
        limit_hours: i64,
    },

    #[error("device {serial} is not certified")]
    NotCertified { serial: String },

    #[error("device {serial} is {status}, not active")]
    DeviceInactive { serial: String, status: String },

    #[error("device {serial} has no communication key")]
    MissingSecret { serial: String },
}

impl ComplianceError {
    pub fn code(&self) -> &'static str {
        match self {
            ComplianceError::NeverSynced { .. } => "NEVER_SYNCED",
            ComplianceError::OfflineTooLong { .. } => "OFFLINE_TOO_LONG",
            ComplianceError::NotCertified { .. } => "NOT_CERTIFIED",
            ComplianceError::DeviceInactive { .. } => "DEVICE_INACTIVE",
            ComplianceError::MissingSecret { .. } => "MISSING_SECRET",
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
