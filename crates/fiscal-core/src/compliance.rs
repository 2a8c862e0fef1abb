//! # Compliance Guard
//!
//! Pure decisions over a device and a proposed invoice. Nothing here reads a
//! clock; callers pass `now`.
//!
//! ## Evaluation Order
//! ```text
//! ┌───────────────┐   ┌───────────────┐   ┌─────────────────────┐   ┌──────────────────────────┐
//! │   CanSubmit   │──►│  IsCertified  │──►│ ValidateCopyReceipt │──►│ ValidateTransactionPolarity│
//! │ last sync ≤24h│   │ active+cert+  │   │ copy ⇔ reference    │   │ sale > 0, refund ≤ 0     │
//! └───────────────┘   │ secret        │   └─────────────────────┘   └──────────────────────────┘
//!                     └───────────────┘
//! first failure wins; guard failures are never retried
//! ```

use chrono::{DateTime, Duration, Utc};

use crate::error::{ComplianceError, CoreResult, ValidationError};
use crate::types::{Device, DeviceStatus, NewInvoice, TransactionType};
use crate::OFFLINE_LIMIT_HOURS;

/// Fails when the device never synced or has been offline longer than
/// [`OFFLINE_LIMIT_HOURS`]. Exactly 24h offline is still allowed.
pub fn can_submit(device: &Device, now: DateTime<Utc>) -> Result<(), ComplianceError> {
    let last_sync = device.last_sync_at.ok_or_else(|| ComplianceError::NeverSynced {
        serial: device.serial_number.clone(),
    })?;

    let offline = now.signed_duration_since(last_sync);
    if offline > Duration::hours(OFFLINE_LIMIT_HOURS) {
        return Err(ComplianceError::OfflineTooLong {
            serial: device.serial_number.clone(),
            hours_offline: offline.num_hours(),
            limit_hours: OFFLINE_LIMIT_HOURS,
        });
    }

    Ok(())
}

/// Fails unless the device is certified, active and holds a secret.
pub fn is_certified(device: &Device) -> Result<(), ComplianceError> {
    if !device.is_certified {
        return Err(ComplianceError::NotCertified {
            serial: device.serial_number.clone(),
        });
    }

    if device.status != DeviceStatus::Active {
        return Err(ComplianceError::DeviceInactive {
            serial: device.serial_number.clone(),
            status: device.status.to_string(),
        });
    }

    if !device.has_secret() {
        return Err(ComplianceError::MissingSecret {
            serial: device.serial_number.clone(),
        });
    }

    Ok(())
}

/// A copy must reference its original receipt; a non-copy must not.
pub fn validate_copy_receipt(
    is_copy: bool,
    original_receipt_number: Option<&str>,
) -> Result<(), ValidationError> {
    let has_reference = original_receipt_number
        .map(|r| !r.trim().is_empty())
        .unwrap_or(false);

    match (is_copy, has_reference) {
        (true, false) => Err(ValidationError::CopyReferenceRequired),
        (false, true) => Err(ValidationError::UnexpectedCopyReference),
        _ => Ok(()),
    }
}

/// Sales must be positive, refunds zero or negative.
pub fn validate_transaction_polarity(
    transaction_type: TransactionType,
    total_amount_cents: i64,
) -> Result<(), ValidationError> {
    let ok = match transaction_type {
        TransactionType::Sale => total_amount_cents > 0,
        TransactionType::Refund => total_amount_cents <= 0,
    };

    if ok {
        Ok(())
    } else {
        Err(ValidationError::PolarityViolation {
            transaction_type: transaction_type.to_string(),
            amount: total_amount_cents,
        })
    }
}

/// Runs the four checks in order, short-circuiting on the first failure.
pub fn evaluate(device: &Device, invoice: &NewInvoice, now: DateTime<Utc>) -> CoreResult<()> {
    can_submit(device, now)?;
    is_certified(device)?;
    validate_copy_receipt(invoice.is_copy, invoice.original_receipt_number.as_deref())?;
    validate_transaction_polarity(invoice.transaction_type, invoice.total_amount_cents)?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
