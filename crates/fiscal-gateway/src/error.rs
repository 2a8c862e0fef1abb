//! # Gateway Error Types
//!
//! Errors returned by the submission service, orchestrator and config.
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Gateway Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Caller input   │  │  Lookup / state │  │  Infrastructure         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Rule (core)    │  │  DeviceNotFound │  │  Database               │ │
//! │  │   ├ validation  │  │  InvoiceNotFound│  │  Secret                 │ │
//! │  │   └ compliance  │  │  InFlight       │  │  Signing                │ │
//! │  │                 │  │  AlreadyConfirmd│  │  Authority (failure)    │ │
//! │  │                 │  │                 │  │  Config                 │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Rule errors are never retried. Authority failures carry their own     │
//! │  retryability; database errors are retryable when transient.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use fiscal_core::{ComplianceError, CoreError, ValidationError};
use fiscal_db::DbError;

use crate::client::GatewayFailure;
use crate::secret::SecretError;
use crate::signing::SigningError;

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    // =========================================================================
    // Caller Errors
    // =========================================================================
    /// Validation or compliance rejection.
    #[error(transparent)]
    Rule(#[from] CoreError),

    #[error("Device not found: {serial}")]
    DeviceNotFound { serial: String },

    #[error("Invoice not found: {id}")]
    InvoiceNotFound { id: String },

    /// A retry attempt is running for this invoice right now.
    #[error("Invoice {invoice_id} has a delivery attempt in flight")]
    InFlight { invoice_id: String },

    #[error("Invoice {invoice_id} is already confirmed")]
    AlreadyConfirmed { invoice_id: String },

    // =========================================================================
    // Authority
    // =========================================================================
    #[error("Authority call failed: {0}")]
    Authority(GatewayFailure),

    // =========================================================================
    // Infrastructure
    // =========================================================================
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<ValidationError> for GatewayError {
    fn from(err: ValidationError) -> Self {
        GatewayError::Rule(CoreError::Validation(err))
    }
}

impl From<ComplianceError> for GatewayError {
    fn from(err: ComplianceError) -> Self {
        GatewayError::Rule(CoreError::Compliance(err))
    }
}

impl From<GatewayFailure> for GatewayError {
    fn from(failure: GatewayFailure) -> Self {
        GatewayError::Authority(failure)
    }
}

impl From<url::ParseError> for GatewayError {
    fn from(err: url::ParseError) -> Self {
        GatewayError::InvalidConfig(format!("invalid URL: {err}"))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for GatewayError {
    fn from(err: toml::ser::Error) -> Self {
        GatewayError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl GatewayError {
    /// Returns true if repeating the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Authority(failure) => failure.is_retryable(),
            GatewayError::Database(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Stable reason code for API callers.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Rule(err) => err.code(),
            GatewayError::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
            GatewayError::InvoiceNotFound { .. } => "INVOICE_NOT_FOUND",
            GatewayError::InFlight { .. } => "IN_FLIGHT",
            GatewayError::AlreadyConfirmed { .. } => "ALREADY_CONFIRMED",
            GatewayError::Authority(_) => "AUTHORITY_FAILURE",
            GatewayError::Database(_) => "DATABASE_ERROR",
            GatewayError::Secret(_) => "SECRET_ERROR",
            GatewayError::Signing(_) => "SIGNING_ERROR",
            GatewayError::Serialization(_) => "SERIALIZATION_ERROR",
            GatewayError::InvalidConfig(_)
            | GatewayError::ConfigLoadFailed(_)
            | GatewayError::ConfigSaveFailed(_) => "CONFIG_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true for validation and compliance rejections.
    pub fn is_rule_violation(&self) -> bool {
        matches!(self, GatewayError::Rule(_))
    }

    pub fn is_compliance(&self) -> bool {
        matches!(self, GatewayError::Rule(CoreError::Compliance(_)))
    }
}
