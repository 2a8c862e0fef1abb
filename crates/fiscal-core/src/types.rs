//! # Domain Types
//!
//! Entities and value types shared by every layer of the gateway.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Device      │   │     Invoice     │   │  InvoiceLine    │       │
//! │  │  ─────────────  │ 1 │  ─────────────  │ 1 │  ─────────────  │       │
//! │  │  serial (uniq)  │──►│  invoice_number │──►│  item_code      │       │
//! │  │  status         │ * │  status         │ * │  quantity       │       │
//! │  │  is_certified   │   │  receipt_number │   │  tax_code A–E   │       │
//! │  │  last_sync_at   │   │  total / tax    │   │  total / tax    │       │
//! │  │  secret (enc)   │   └────────┬────────┘   └─────────────────┘       │
//! │  └─────────────────┘            │ 0..1 active                           │
//! │                        ┌────────▼────────┐                              │
//! │                        │ RetryQueueEntry │                              │
//! │                        │  attempt_count  │                              │
//! │                        │  next_retry_at  │                              │
//! │                        └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! Every entity has a UUID `id` used for relations plus a business key
//! (device serial, invoice number per device, authority receipt number).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;
use crate::money::Money;

// =============================================================================
// Tax Rate
// =============================================================================

/// Tax rate in basis points: 1600 bps = 16%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxRate(u32);

impl TaxRate {
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    /// Converts a whole-number percentage (as sent by callers) to basis points.
    #[inline]
    pub const fn from_percent(pct: u32) -> Self {
        TaxRate(pct * 100)
    }

    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn zero() -> Self {
        TaxRate(0)
    }
}

// =============================================================================
// Tax Classification
// =============================================================================

/// The authority's five tax classification codes.
///
/// ## Statutory Rates
/// ```text
/// A → 16%   standard rated
/// B →  8%   reduced rate
/// C →  0%   zero rated
/// D →  0%   exempt
/// E →  0%   non-taxable
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
pub enum TaxCode {
    A,
    B,
    C,
    D,
    E,
}

impl TaxCode {
    /// Every code, in bucket order.
    pub const ALL: [TaxCode; 5] = [TaxCode::A, TaxCode::B, TaxCode::C, TaxCode::D, TaxCode::E];

    /// Fixed statutory rate for this bucket.
    pub const fn statutory_rate(&self) -> TaxRate {
        match self {
            TaxCode::A => TaxRate::from_bps(1600),
            TaxCode::B => TaxRate::from_bps(800),
            TaxCode::C | TaxCode::D | TaxCode::E => TaxRate::zero(),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            TaxCode::A => "A",
            TaxCode::B => "B",
            TaxCode::C => "C",
            TaxCode::D => "D",
            TaxCode::E => "E",
        }
    }
}

impl fmt::Display for TaxCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaxCode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(TaxCode::A),
            "B" => Ok(TaxCode::B),
            "C" => Ok(TaxCode::C),
            "D" => Ok(TaxCode::D),
            "E" => Ok(TaxCode::E),
            _ => Err(ValidationError::NotAllowed {
                field: "tax_code".to_string(),
                allowed: TaxCode::ALL.iter().map(|c| c.as_str().to_string()).collect(),
            }),
        }
    }
}

// =============================================================================
// Device
// =============================================================================

/// Kind of sales control unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Online Sales Control Unit: real-time submission.
    Oscu,
    /// Virtual Sales Control Unit: batch/API integrations.
    Vscu,
}

/// Lifecycle status of a device.
///
/// ```text
/// pending ──InitDevice ok──► active ──deregister──► inactive
///    │                          │
///    └──InitDevice failed──► failed    (authority may) ──► suspended
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Pending,
    Active,
    Inactive,
    Suspended,
    Failed,
}

impl DeviceStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Active => "active",
            DeviceStatus::Inactive => "inactive",
            DeviceStatus::Suspended => "suspended",
            DeviceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered sales control unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Device {
    pub id: String,
    pub tenant_id: String,

    /// Tenant's Tax Identification Number.
    pub tin: String,

    /// Authority branch identifier (e.g. "00" for head office).
    pub branch_id: String,

    /// Globally unique serial number.
    pub serial_number: String,

    /// Display name sent with InitDevice.
    pub name: String,

    pub device_class: DeviceClass,
    pub status: DeviceStatus,
    pub is_certified: bool,

    /// Last successful contact with the authority.
    pub last_sync_at: Option<DateTime<Utc>>,

    /// CMC key, encrypted at rest. Never holds plaintext.
    pub encrypted_secret: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Soft deregistration marker.
    pub deregistered_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Returns true if a communication secret has been stored.
    pub fn has_secret(&self) -> bool {
        self.encrypted_secret
            .as_deref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    }
}

// =============================================================================
// Invoice Enums
// =============================================================================

/// Lifecycle status of an invoice. See [`crate::state`] for transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    /// Created, not yet attempted.
    #[default]
    Pending,
    /// Delivery in flight.
    Sent,
    /// Receipt issued by the authority. Terminal.
    Confirmed,
    /// Rejected or retries exhausted. Terminal.
    Failed,
    /// Waiting in the retry queue.
    Retry,
}

impl InvoiceStatus {
    pub const ALL: [InvoiceStatus; 5] = [
        InvoiceStatus::Pending,
        InvoiceStatus::Sent,
        InvoiceStatus::Confirmed,
        InvoiceStatus::Failed,
        InvoiceStatus::Retry,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Confirmed => "confirmed",
            InvoiceStatus::Failed => "failed",
            InvoiceStatus::Retry => "retry",
        }
    }

    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Confirmed | InvoiceStatus::Failed)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Sale,
    Refund,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Sale => f.write_str("sale"),
            TransactionType::Refund => f.write_str("refund"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Credit,
    CashCredit,
    BankCheck,
    Card,
    MobileMoney,
    Other,
}

impl PaymentMethod {
    /// Authority payment-type code.
    pub const fn authority_code(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "01",
            PaymentMethod::Credit => "02",
            PaymentMethod::CashCredit => "03",
            PaymentMethod::BankCheck => "04",
            PaymentMethod::Card => "05",
            PaymentMethod::MobileMoney => "06",
            PaymentMethod::Other => "07",
        }
    }
}

// =============================================================================
// Invoice
// =============================================================================

/// A point-of-sale transaction destined for the authority.
///
/// `receipt_number`, `authority_signature` and `internal_data` are written
/// together by the confirm transition and never touched again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Invoice {
    pub id: String,
    pub tenant_id: String,
    pub device_id: String,

    /// Human-visible number, unique per device.
    pub invoice_number: String,

    /// Authority-issued receipt number (set on confirm).
    pub receipt_number: Option<String>,

    /// Signed grand total (negative for refunds).
    pub total_amount_cents: i64,
    pub tax_amount_cents: i64,

    /// Buyer TIN or loyalty reference.
    pub customer_reference: Option<String>,
    pub customer_name: Option<String>,

    pub payment_method: PaymentMethod,
    pub transaction_type: TransactionType,

    pub is_copy: bool,
    pub original_receipt_number: Option<String>,

    pub status: InvoiceStatus,
    pub retry_count: i64,

    pub authority_signature: Option<String>,
    pub internal_data: Option<String>,
    pub qr_payload: Option<String>,

    /// Last failure detail (permanent rejection or exhaustion reason).
    pub error_detail: Option<String>,

    /// HMAC of the canonical payload, checked before every retry.
    pub payload_checksum: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Invoice {
    #[inline]
    pub fn total_amount(&self) -> Money {
        Money::from_cents(self.total_amount_cents)
    }

    #[inline]
    pub fn tax_amount(&self) -> Money {
        Money::from_cents(self.tax_amount_cents)
    }

    /// True when every authority-issued field is present and non-empty.
    pub fn has_authority_fields(&self) -> bool {
        let set = |v: &Option<String>| v.as_deref().map(|s| !s.is_empty()).unwrap_or(false);
        set(&self.receipt_number) && set(&self.authority_signature) && set(&self.internal_data)
    }

    /// True when no authority-issued field has been written.
    pub fn has_no_authority_fields(&self) -> bool {
        self.receipt_number.is_none()
            && self.authority_signature.is_none()
            && self.internal_data.is_none()
    }
}

/// A line item of an invoice. Immutable once the invoice leaves `pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct InvoiceLine {
    pub id: String,
    pub invoice_id: String,

    /// 1-based position within the invoice.
    pub line_number: i64,

    pub item_code: String,
    pub item_name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,

    /// Unit of measure key, mapped to authority unit codes by the builder.
    pub unit_of_measure: String,

    pub tax_code: TaxCode,
    pub tax_rate_bps: i64,

    /// `quantity × unit_price`.
    pub total_price_cents: i64,
    /// `total_price × rate / 100`, rounded to the cent.
    pub tax_amount_cents: i64,
}

impl InvoiceLine {
    #[inline]
    pub fn total_price(&self) -> Money {
        Money::from_cents(self.total_price_cents)
    }

    #[inline]
    pub fn tax_amount(&self) -> Money {
        Money::from_cents(self.tax_amount_cents)
    }

    #[inline]
    pub fn unit_price(&self) -> Money {
        Money::from_cents(self.unit_price_cents)
    }
}

// =============================================================================
// Inbound Request Types
// =============================================================================

/// Identity of the calling tenant, supplied by the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        TenantContext {
            tenant_id: tenant_id.into(),
        }
    }
}

fn default_unit() -> String {
    "pcs".to_string()
}

/// Line data as received from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoiceLine {
    pub item_code: String,
    pub item_name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    #[serde(default = "default_unit")]
    pub unit_of_measure: String,
    pub tax_code: TaxCode,
    pub tax_rate_bps: u32,
}

/// Invoice data as received from the caller (`CreateInvoice`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    /// Serial number of the submitting device.
    pub device_serial: String,
    pub invoice_number: String,
    #[serde(default)]
    pub customer_reference: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub payment_method: PaymentMethod,
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub is_copy: bool,
    #[serde(default)]
    pub original_receipt_number: Option<String>,
    /// Declared grand total, validated against the lines.
    pub total_amount_cents: i64,
    /// Declared tax total, validated against the lines.
    pub tax_amount_cents: i64,
    pub lines: Vec<NewInvoiceLine>,
}

// =============================================================================
// Retry Queue
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RetryStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::Pending => "pending",
            RetryStatus::Processing => "processing",
            RetryStatus::Completed => "completed",
            RetryStatus::Failed => "failed",
        }
    }

    /// Pending and processing entries count toward the one-active-entry rule.
    #[inline]
    pub const fn is_active(&self) -> bool {
        matches!(self, RetryStatus::Pending | RetryStatus::Processing)
    }
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled re-attempt of an invoice submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct RetryQueueEntry {
    pub id: String,
    pub tenant_id: String,
    pub invoice_id: String,
    pub attempt_count: i64,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Code of the last failure: an authority result code, `http:<status>`
    /// for HTTP errors, or a local code such as `DRIFT`.
    pub last_error_code: Option<String>,
    /// An unknown result code has already been retried on this entry.
    pub unknown_retried: bool,
    pub status: RetryStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================
