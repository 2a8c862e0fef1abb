//! # fiscal-core: Pure Business Logic for the Fiscal Gateway
//!
//! Domain rules for submitting point-of-sale invoices to the tax authority.
//! Every function here is deterministic and free of I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Fiscal Gateway Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │           fiscal-gateway (submission service, orchestrator)     │   │
//! │  │     CreateInvoice ──► guard ──► build ──► sign ──► authority    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ fiscal-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │  ┌────────┐ ┌──────────┐ ┌──────────┐ ┌───────┐ ┌───────────┐ │   │
//! │  │  │ types  │ │compliance│ │ payload  │ │ state │ │   retry   │ │   │
//! │  │  │ money  │ │  guard   │ │ builder  │ │machine│ │  backoff  │ │   │
//! │  │  └────────┘ └──────────┘ └──────────┘ └───────┘ └───────────┘ │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • NO CLOCK                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    fiscal-db (Database Layer)                   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Device, Invoice, InvoiceLine, RetryQueueEntry
//! - [`money`] - Integer cents arithmetic
//! - [`error`] - Validation and compliance errors
//! - [`validation`] - Line pricing and the totals invariant
//! - [`compliance`] - Offline window and certification guard
//! - [`payload`] - Canonical authority payload
//! - [`state`] - Invoice transition table
//! - [`retry`] - Backoff schedule
//!
//! ## Example Usage
//!
//! ```rust
//! use fiscal_core::retry::RetryPolicy;
//! use fiscal_core::types::TaxCode;
//! use fiscal_core::Money;
//!
//! let line_total = Money::from_cents(50_000).checked_multiply_quantity(2).unwrap();
//! let tax = line_total.calculate_tax(TaxCode::A.statutory_rate());
//! assert_eq!(line_total.checked_add(tax).unwrap().to_string(), "1160.00");
//!
//! assert_eq!(RetryPolicy::default().delay(2).num_seconds(), 240);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod compliance;
pub mod error;
pub mod money;
pub mod payload;
pub mod retry;
pub mod state;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{ComplianceError, CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use payload::CanonicalPayload;
pub use retry::{RetryDecision, RetryPolicy};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum time a device may go without authority contact and still submit.
///
/// Statutory; not configurable.
pub const OFFLINE_LIMIT_HOURS: i64 = 24;

/// Allowed drift between declared and computed totals.
pub const TOTALS_TOLERANCE_CENTS: i64 = 1;

/// Maximum lines on a single invoice.
pub const MAX_INVOICE_LINES: usize = 1000;

/// Largest quantity accepted on one line.
pub const MAX_LINE_QUANTITY: i64 = 1_000_000_000;

/// Largest unit price accepted on one line, in cents.
pub const MAX_UNIT_PRICE_CENTS: i64 = 1_000_000_000_000;

/// Authority result code meaning success.
pub const RESULT_SUCCESS: &str = "000";
