//! # Authority Gateway Client
//!
//! The single seam between this process and the tax authority.
//!
//! ## Operations
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  init_device(tin, branch, serial, name)  ──► DeviceInit { secret }      │
//! │  submit_invoice(signed submission)       ──► Receipt                    │
//! │  check_device_status(credentials)        ──► DeviceStatusReport         │
//! │                                                                         │
//! │  Every operation returns Result<_, GatewayFailure>. A failure always    │
//! │  carries its Retryability; callers never guess it from the error text. │
//! │                                                                         │
//! │  Implementations:                                                      │
//! │    MockGateway  (mock.rs)  in-process, injected identity registry       │
//! │    LiveGateway  (live.rs)  reqwest, fixed timeout, audited              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use fiscal_core::state::AttemptOutcome;
use fiscal_core::{Device, DeviceStatus};
use fiscal_db::{Confirmation, FailureNote};

use crate::codes::{
    classify_http_status, classify_result_code, http_status_code, resolve_unknown, Retryability,
};

pub mod live;
pub mod mock;

pub use live::LiveGateway;
pub use mock::{MockGateway, MockIdentityRegistry};

// =============================================================================
// Failure
// =============================================================================

/// What went wrong on a gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The authority answered with a non-success result code.
    Rejected,
    /// No answer within the call timeout.
    Timeout,
    /// Could not reach the authority.
    Connection,
    /// Non-2xx HTTP status.
    HttpStatus,
    /// 2xx response we could not read.
    Decode,
    /// The identity is not known to the authority.
    Unregistered,
    /// The stored payload no longer matches its checksum.
    DataDrift,
    /// The device is not allowed to submit right now.
    DeviceNotReady,
}

/// A classified gateway failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayFailure {
    pub kind: FailureKind,
    /// Authority result code, `http:<status>`, or a local code.
    pub code: Option<String>,
    pub message: String,
    pub retryability: Retryability,
}

impl GatewayFailure {
    /// A `resultCd` rejection, classified by the code table.
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        GatewayFailure {
            kind: FailureKind::Rejected,
            retryability: classify_result_code(&code),
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        GatewayFailure {
            kind: FailureKind::Timeout,
            code: None,
            message: message.into(),
            retryability: Retryability::Retryable,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        GatewayFailure {
            kind: FailureKind::Connection,
            code: None,
            message: message.into(),
            retryability: Retryability::Retryable,
        }
    }

    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        GatewayFailure {
            kind: FailureKind::HttpStatus,
            code: Some(http_status_code(status)),
            message: message.into(),
            retryability: classify_http_status(status),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        GatewayFailure {
            kind: FailureKind::Decode,
            code: None,
            message: message.into(),
            retryability: Retryability::Retryable,
        }
    }

    pub fn unregistered(message: impl Into<String>) -> Self {
        GatewayFailure {
            kind: FailureKind::Unregistered,
            code: None,
            message: message.into(),
            retryability: Retryability::Permanent,
        }
    }

    pub fn data_drift(message: impl Into<String>) -> Self {
        GatewayFailure {
            kind: FailureKind::DataDrift,
            code: Some(crate::codes::DATA_DRIFT_CODE.to_string()),
            message: message.into(),
            retryability: Retryability::Permanent,
        }
    }

    /// Device not certified at retry time; the attempt counts as transient.
    pub fn device_not_ready(message: impl Into<String>) -> Self {
        GatewayFailure {
            kind: FailureKind::DeviceNotReady,
            code: None,
            message: message.into(),
            retryability: Retryability::Retryable,
        }
    }

    /// Only `Retryable` counts here; `Unknown` is settled per retry entry.
    pub fn is_retryable(&self) -> bool {
        self.retryability == Retryability::Retryable
    }

    pub fn is_unknown_code(&self) -> bool {
        self.retryability == Retryability::Unknown
    }

    /// Settles this failure for one invoice.
    ///
    /// `unknown_retried` is whether the invoice's retry entry has already
    /// retried an unknown code; a second one is permanent.
    pub fn outcome(&self, unknown_retried: bool) -> AttemptOutcome {
        match self.retryability {
            Retryability::Retryable => AttemptOutcome::Transient,
            Retryability::Permanent => AttemptOutcome::Permanent,
            Retryability::Unknown if resolve_unknown(unknown_retried) => AttemptOutcome::Transient,
            Retryability::Unknown => AttemptOutcome::Permanent,
        }
    }

    /// What gets recorded on the retry entry for this failure.
    pub fn note(&self) -> FailureNote {
        FailureNote::new(self.detail(), self.code.clone()).with_unknown_code(self.is_unknown_code())
    }

    /// Text stored as the invoice's error detail.
    pub fn detail(&self) -> String {
        match &self.code {
            Some(code) => format!("{code}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

impl fmt::Display for GatewayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {})", self.detail(), self.kind, self.retryability)
    }
}

impl std::error::Error for GatewayFailure {}

// =============================================================================
// Requests & Responses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitDeviceRequest {
    pub tin: String,
    pub branch_id: String,
    pub serial_number: String,
    pub device_name: String,
}

impl From<&Device> for InitDeviceRequest {
    fn from(device: &Device) -> Self {
        InitDeviceRequest {
            tin: device.tin.clone(),
            branch_id: device.branch_id.clone(),
            serial_number: device.serial_number.clone(),
            device_name: device.name.clone(),
        }
    }
}

/// Identity plus decrypted key of a device, for authenticated calls.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub tin: String,
    pub branch_id: String,
    pub serial_number: String,
    pub device_key: String,
}

impl DeviceCredentials {
    pub fn for_device(device: &Device, device_key: impl Into<String>) -> Self {
        DeviceCredentials {
            tin: device.tin.clone(),
            branch_id: device.branch_id.clone(),
            serial_number: device.serial_number.clone(),
            device_key: device_key.into(),
        }
    }
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("tin", &self.tin)
            .field("branch_id", &self.branch_id)
            .field("serial_number", &self.serial_number)
            .field("device_key", &"<redacted>")
            .finish()
    }
}

/// A signed invoice ready to send.
#[derive(Debug, Clone)]
pub struct SignedSubmission {
    pub credentials: DeviceCredentials,
    pub invoice_number: String,
    /// Canonical JSON; the exact bytes that were signed.
    pub payload_json: String,
    /// Hex RSA-PSS signature.
    pub signature: String,
    /// Authority timestamp format (`yyyyMMddHHmmss`).
    pub timestamp: String,
}

/// Successful `InitDevice`.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceInit {
    /// Communication key issued to the device (plaintext).
    pub secret: String,
    pub result_code: String,
    pub message: Option<String>,
}

impl fmt::Debug for DeviceInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInit")
            .field("secret", &"<redacted>")
            .field("result_code", &self.result_code)
            .field("message", &self.message)
            .finish()
    }
}

/// Successful `SubmitInvoice`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_number: String,
    pub internal_data: String,
    /// Authority signature over the receipt.
    pub signature: String,
    pub qr_payload: Option<String>,
    pub result_code: String,
}

impl Receipt {
    pub fn to_confirmation(&self) -> Confirmation {
        Confirmation {
            receipt_number: self.receipt_number.clone(),
            signature: self.signature.clone(),
            internal_data: self.internal_data.clone(),
            qr_payload: self.qr_payload.clone(),
        }
    }
}

/// Successful `CheckDeviceStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusReport {
    pub status: DeviceStatus,
    pub last_activity: Option<DateTime<Utc>>,
}

// =============================================================================
// Trait
// =============================================================================

/// Client for the authority's electronic invoicing service.
#[async_trait]
pub trait AuthorityGateway: Send + Sync {
    /// Short name for logs ("mock", "live").
    fn name(&self) -> &'static str;

    async fn init_device(&self, request: &InitDeviceRequest) -> Result<DeviceInit, GatewayFailure>;

    async fn submit_invoice(&self, submission: &SignedSubmission) -> Result<Receipt, GatewayFailure>;

    async fn check_device_status(
        &self,
        credentials: &DeviceCredentials,
    ) -> Result<DeviceStatusReport, GatewayFailure>;
}
