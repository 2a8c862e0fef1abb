//! # Submission Service
//!
//! The entry point collaborators call: device onboarding, `CreateInvoice`,
//! and manual resync.
//!
//! ## CreateInvoice Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  NewInvoice                                                             │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  validate lines + totals ──✗──► Err(Rule)            nothing stored     │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  device (tenant-scoped) ──✗──► Err(DeviceNotFound)                      │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  number already used?  ──✓──► Ok(existing, AlreadySubmitted)            │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  compliance guard      ──✗──► Err(Rule)            nothing stored       │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  build payload, checksum, INSERT (pending), CAS pending → sent          │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  sign + submit (timeout)                                                │
//! │     ├── receipt    ──► confirmed                   Confirmed            │
//! │     ├── transient  ──► retry + queue entry (att 0) Queued               │
//! │     └── permanent  ──► failed                      Rejected             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation has an `_at(now)` form taking the clock explicitly; the
//! plain form uses `Utc::now()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fiscal_core::payload::{self, DATETIME_FORMAT};
use fiscal_core::state::{can_reopen, AttemptOutcome};
use fiscal_core::validation::{validate_identifier, validate_new_invoice, validate_uuid};
use fiscal_core::{
    compliance, ComplianceError, Device, DeviceClass, Invoice, InvoiceLine, InvoiceStatus, NewInvoice, RetryPolicy,
    RetryStatus, TenantContext,
};
use fiscal_db::{Database, FailureNote};

use crate::client::{
    AuthorityGateway, DeviceCredentials, GatewayFailure, InitDeviceRequest, Receipt,
    SignedSubmission,
};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::events::{
    AdminAlert, EventSink, GatewayEvent, PermanentFailureTracker, TracingSink,
};
use crate::secret::{process_cipher, SecretCipher};
use crate::signing::{payload_checksum, verify_checksum, PayloadSigner};

/// Default consecutive permanent rejections before an admin alert.
const DEFAULT_ALERT_THRESHOLD: u32 = 3;

// =============================================================================
// Request / Result Types
// =============================================================================

/// Data for `RegisterDevice`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub tin: String,
    pub branch_id: String,
    pub serial_number: String,
    pub name: String,
    pub device_class: DeviceClass,
}

/// What happened to a `CreateInvoice` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// The authority issued a receipt.
    Confirmed { receipt_number: String },
    /// Accepted; delivery continues in the background.
    Queued { next_retry_at: DateTime<Utc> },
    /// The authority refused the invoice for good.
    Rejected { code: Option<String>, message: String },
    /// The invoice number was already used on this device; the stored
    /// invoice is returned as is.
    AlreadySubmitted,
}

#[derive(Debug, Clone)]
pub struct InvoiceResult {
    pub invoice: Invoice,
    pub outcome: SubmissionOutcome,
}

/// What `ResyncInvoice` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// A failed invoice was reopened; the attempt count is kept.
    Rearmed { entry_id: String, attempt_count: i64 },
    /// A waiting entry was made due now.
    Expedited { entry_id: String },
    /// A retry invoice without an entry got a fresh one.
    Enqueued { entry_id: String },
}

// =============================================================================
// Submission Service
// =============================================================================

/// Cheap to clone; clones share the database, gateway and failure tracker.
#[derive(Clone)]
pub struct SubmissionService {
    pub(crate) db: Arc<Database>,
    pub(crate) gateway: Arc<dyn AuthorityGateway>,
    pub(crate) signer: Arc<PayloadSigner>,
    pub(crate) cipher: SecretCipher,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) tracker: Arc<PermanentFailureTracker>,
    pub(crate) policy: RetryPolicy,
    pub(crate) call_timeout: Duration,
}

impl SubmissionService {
    /// Uses the process secret key, default backoff and a 30s call timeout.
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn AuthorityGateway>,
        signer: Arc<PayloadSigner>,
    ) -> Self {
        SubmissionService {
            db,
            gateway,
            signer,
            cipher: process_cipher(),
            events: Arc::new(TracingSink),
            tracker: Arc::new(PermanentFailureTracker::new(DEFAULT_ALERT_THRESHOLD)),
            policy: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(
        db: Arc<Database>,
        gateway: Arc<dyn AuthorityGateway>,
        signer: Arc<PayloadSigner>,
        config: &GatewayConfig,
    ) -> Self {
        Self::new(db, gateway, signer)
            .with_policy(config.retry_policy())
            .with_call_timeout(config.call_timeout())
            .with_alert_threshold(config.retry.permanent_failure_alert_threshold)
    }

    pub fn with_cipher(mut self, cipher: SecretCipher) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_alert_threshold(mut self, threshold: u32) -> Self {
        self.tracker = Arc::new(PermanentFailureTracker::new(threshold));
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    // =========================================================================
    // Device Registry
    // =========================================================================

    pub async fn register_device(
        &self,
        ctx: &TenantContext,
        registration: &DeviceRegistration,
    ) -> GatewayResult<Device> {
        self.register_device_at(ctx, registration, Utc::now()).await
    }

    /// Registers a device in `pending` status.
    pub async fn register_device_at(
        &self,
        ctx: &TenantContext,
        registration: &DeviceRegistration,
        now: DateTime<Utc>,
    ) -> GatewayResult<Device> {
        validate_identifier("tin", &registration.tin)?;
        validate_identifier("branch_id", &registration.branch_id)?;
        validate_identifier("serial_number", &registration.serial_number)?;

        let device = self
            .db
            .devices()
            .register(
                &ctx.tenant_id,
                registration.tin.trim(),
                registration.branch_id.trim(),
                registration.serial_number.trim(),
                registration.name.trim(),
                registration.device_class,
                now,
            )
            .await?;

        info!(
            tenant_id = %ctx.tenant_id,
            serial = %device.serial_number,
            device_id = %device.id,
            "Device registered"
        );
        Ok(device)
    }

    pub async fn activate_device(&self, ctx: &TenantContext, serial_number: &str) -> GatewayResult<Device> {
        self.activate_device_at(ctx, serial_number, Utc::now()).await
    }

    /// Runs `InitDevice` and stores the result.
    ///
    /// On success the issued secret is encrypted and stored and the device
    /// becomes active and certified. On failure the device is marked
    /// `failed` and the gateway failure is returned.
    pub async fn activate_device_at(
        &self,
        ctx: &TenantContext,
        serial_number: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<Device> {
        let device = self.device_for(ctx, serial_number).await?;
        let request = InitDeviceRequest::from(&device);

        let result = self
            .with_timeout(self.gateway.init_device(&request))
            .await;

        match result {
            Ok(init) => {
                let encrypted = self.cipher.encrypt(&init.secret)?;
                let device = self
                    .db
                    .devices()
                    .apply_init_result(&device.id, Some(&encrypted), true, now)
                    .await?;
                info!(serial = %device.serial_number, gateway = self.gateway.name(), "Device activated");
                Ok(device)
            }
            Err(failure) => {
                self.db
                    .devices()
                    .apply_init_result(&device.id, None, false, now)
                    .await?;
                warn!(
                    serial = %device.serial_number,
                    error = %failure.detail(),
                    "Device activation failed"
                );
                Err(GatewayError::Authority(failure))
            }
        }
    }

    pub async fn refresh_device_status(
        &self,
        ctx: &TenantContext,
        serial_number: &str,
    ) -> GatewayResult<Device> {
        self.refresh_device_status_at(ctx, serial_number, Utc::now()).await
    }

    /// Asks the authority for the device's status and records the contact.
    pub async fn refresh_device_status_at(
        &self,
        ctx: &TenantContext,
        serial_number: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<Device> {
        let device = self.device_for(ctx, serial_number).await?;
        compliance::is_certified(&device)?;
        let secret = self.device_secret(&device)?;

        let report = self
            .with_timeout(
                self.gateway
                    .check_device_status(&DeviceCredentials::for_device(&device, secret)),
            )
            .await?;

        let devices = self.db.devices();
        if report.status != device.status {
            info!(
                serial = %device.serial_number,
                from = %device.status,
                to = %report.status,
                "Authority reported a device status change"
            );
            devices.update_status(&device.id, report.status, now).await?;
        }
        devices.touch_last_sync(&device.id, now).await?;

        devices
            .get_by_id(&device.id)
            .await?
            .ok_or_else(|| GatewayError::DeviceNotFound {
                serial: serial_number.to_string(),
            })
    }

    pub async fn deregister_device(&self, ctx: &TenantContext, serial_number: &str) -> GatewayResult<Device> {
        self.deregister_device_at(ctx, serial_number, Utc::now()).await
    }

    /// Soft deregistration: the device turns `inactive`, history is kept.
    pub async fn deregister_device_at(
        &self,
        ctx: &TenantContext,
        serial_number: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<Device> {
        let device = self.device_for(ctx, serial_number).await?;
        Ok(self.db.devices().deregister(&device.id, now).await?)
    }

    pub async fn list_devices(&self, ctx: &TenantContext) -> GatewayResult<Vec<Device>> {
        Ok(self.db.devices().list_by_tenant(&ctx.tenant_id).await?)
    }

    // =========================================================================
    // CreateInvoice
    // =========================================================================

    pub async fn create_invoice(&self, ctx: &TenantContext, new: NewInvoice) -> GatewayResult<InvoiceResult> {
        self.create_invoice_at(ctx, new, Utc::now()).await
    }

    pub async fn create_invoice_at(
        &self,
        ctx: &TenantContext,
        new: NewInvoice,
        now: DateTime<Utc>,
    ) -> GatewayResult<InvoiceResult> {
        let invoice_id = Uuid::new_v4().to_string();
        let lines = validate_new_invoice(&invoice_id, &new)?;
        let device = self.device_for(ctx, &new.device_serial).await?;

        let invoices = self.db.invoices();
        if let Some(existing) = invoices.find_by_number(&device.id, new.invoice_number.trim()).await? {
            debug!(
                invoice_id = %existing.id,
                status = %existing.status,
                "Invoice number already submitted"
            );
            return Ok(InvoiceResult {
                invoice: existing,
                outcome: SubmissionOutcome::AlreadySubmitted,
            });
        }

        compliance::evaluate(&device, &new, now)?;

        let mut invoice = Invoice {
            id: invoice_id,
            tenant_id: ctx.tenant_id.clone(),
            device_id: device.id.clone(),
            invoice_number: new.invoice_number.trim().to_string(),
            receipt_number: None,
            total_amount_cents: new.total_amount_cents,
            tax_amount_cents: new.tax_amount_cents,
            customer_reference: new.customer_reference.clone(),
            customer_name: new.customer_name.clone(),
            payment_method: new.payment_method,
            transaction_type: new.transaction_type,
            is_copy: new.is_copy,
            original_receipt_number: new.original_receipt_number.clone(),
            status: InvoiceStatus::Pending,
            retry_count: 0,
            authority_signature: None,
            internal_data: None,
            qr_payload: None,
            error_detail: None,
            payload_checksum: None,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
        };

        let payload_json = payload::build(&device, &invoice, &lines)?.canonical_json()?;
        let secret = self.device_secret(&device)?;
        invoice.payload_checksum = Some(payload_checksum(&payload_json, &secret)?);

        if let Err(e) = invoices.insert_with_lines(&invoice, &lines).await {
            if e.is_unique_violation() {
                // Lost a race with a concurrent call for the same number
                if let Some(existing) = invoices.find_by_number(&device.id, &invoice.invoice_number).await? {
                    return Ok(InvoiceResult {
                        invoice: existing,
                        outcome: SubmissionOutcome::AlreadySubmitted,
                    });
                }
            }
            return Err(e.into());
        }
        invoices.mark_sent(&invoice.id, now).await?;

        info!(
            invoice_id = %invoice.id,
            invoice_number = %invoice.invoice_number,
            serial = %device.serial_number,
            "Submitting invoice"
        );

        let outcome = match self.deliver(&device, &invoice, &lines, &secret, now).await {
            Ok(receipt) => {
                invoices.confirm(&invoice.id, &receipt.to_confirmation(), now).await?;
                self.after_success(&device, &invoice, &receipt, now).await?;
                SubmissionOutcome::Confirmed {
                    receipt_number: receipt.receipt_number,
                }
            }
            Err(failure) => match failure.outcome(false) {
                AttemptOutcome::Transient => {
                    let next_retry_at = self.policy.first_retry_at(now);
                    let note = failure.note();
                    self.db
                        .retry_queue()
                        .enqueue(&invoice.id, &invoice.tenant_id, next_retry_at, &note, now)
                        .await?;
                    SubmissionOutcome::Queued { next_retry_at }
                }
                AttemptOutcome::Permanent | AttemptOutcome::Accepted => {
                    invoices.mark_failed(&invoice.id, &failure.detail(), now).await?;
                    self.after_permanent(&device, &invoice, &failure);
                    SubmissionOutcome::Rejected {
                        code: failure.code.clone(),
                        message: failure.message.clone(),
                    }
                }
            },
        };

        let invoice = self.load_invoice(&invoice.id).await?;
        Ok(InvoiceResult { invoice, outcome })
    }

    // =========================================================================
    // ResyncInvoice
    // =========================================================================

    pub async fn resync_invoice(&self, ctx: &TenantContext, invoice_id: &str) -> GatewayResult<ResyncOutcome> {
        self.resync_invoice_at(ctx, invoice_id, Utc::now()).await
    }

    /// Makes an invoice eligible for an immediate retry.
    ///
    /// ```text
    /// failed                      ──► retry, latest entry reopened (attempts kept)
    /// retry, entry pending        ──► entry due now (attempts kept)
    /// retry, no entry             ──► fresh entry due now
    /// entry processing, or
    /// pending/sent without entry  ──► Err(InFlight)
    /// confirmed                   ──► Err(AlreadyConfirmed)
    /// ```
    pub async fn resync_invoice_at(
        &self,
        ctx: &TenantContext,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<ResyncOutcome> {
        let invoice = self.get_invoice(ctx, invoice_id).await?;
        let queue = self.db.retry_queue();
        let in_flight = || GatewayError::InFlight {
            invoice_id: invoice_id.to_string(),
        };

        let outcome = match invoice.status {
            InvoiceStatus::Confirmed => {
                return Err(GatewayError::AlreadyConfirmed {
                    invoice_id: invoice_id.to_string(),
                })
            }
            status if can_reopen(status) => {
                let entry = queue
                    .rearm_failed(&invoice.id, &invoice.tenant_id, now)
                    .await?
                    .ok_or_else(in_flight)?;
                ResyncOutcome::Rearmed {
                    entry_id: entry.id,
                    attempt_count: entry.attempt_count,
                }
            }
            _ => {
                match queue.active_for_invoice(&invoice.id).await? {
                    Some(entry) if entry.status == RetryStatus::Pending => {
                        if !queue.expedite(&entry.id, now).await? {
                            return Err(in_flight());
                        }
                        ResyncOutcome::Expedited { entry_id: entry.id }
                    }
                    Some(_) => return Err(in_flight()),
                    None if invoice.status == InvoiceStatus::Retry => {
                        let note = FailureNote::new("manual resync", None);
                        let entry = queue
                            .enqueue(&invoice.id, &invoice.tenant_id, now, &note, now)
                            .await?
                            .ok_or_else(in_flight)?;
                        ResyncOutcome::Enqueued { entry_id: entry.id }
                    }
                    None => return Err(in_flight()),
                }
            }
        };

        info!(invoice_id = %invoice_id, ?outcome, "Invoice resync requested");
        Ok(outcome)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Tenant-scoped invoice lookup.
    pub async fn get_invoice(&self, ctx: &TenantContext, invoice_id: &str) -> GatewayResult<Invoice> {
        validate_uuid("invoice_id", invoice_id)?;
        match self.db.invoices().get(invoice_id).await? {
            Some(invoice) if invoice.tenant_id == ctx.tenant_id => Ok(invoice),
            _ => Err(GatewayError::InvoiceNotFound {
                id: invoice_id.to_string(),
            }),
        }
    }

    pub async fn get_invoice_lines(&self, ctx: &TenantContext, invoice_id: &str) -> GatewayResult<Vec<InvoiceLine>> {
        let invoice = self.get_invoice(ctx, invoice_id).await?;
        Ok(self.db.invoices().get_lines(&invoice.id).await?)
    }

    /// Invoices in `status` across tenants, oldest first.
    pub async fn list_invoices_by_status(&self, status: InvoiceStatus, limit: u32) -> GatewayResult<Vec<Invoice>> {
        Ok(self.db.invoices().list_by_status(status, limit).await?)
    }

    pub async fn invoice_counts(&self) -> GatewayResult<Vec<(InvoiceStatus, i64)>> {
        Ok(self.db.invoices().count_by_status().await?)
    }

    pub async fn retry_queue_counts(&self) -> GatewayResult<Vec<(RetryStatus, i64)>> {
        Ok(self.db.retry_queue().count_by_status().await?)
    }

    // =========================================================================
    // Delivery (shared with the retry orchestrator)
    // =========================================================================

    /// Rebuilds the payload from stored rows, checks it against the stored
    /// checksum, signs it with a timestamp for `now` and submits it.
    pub(crate) async fn deliver(
        &self,
        device: &Device,
        invoice: &Invoice,
        lines: &[InvoiceLine],
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<Receipt, GatewayFailure> {
        let payload_json = payload::build(device, invoice, lines)
            .map_err(|e| GatewayFailure::data_drift(format!("payload no longer builds: {e}")))?
            .canonical_json()
            .map_err(|e| GatewayFailure::data_drift(format!("payload not serializable: {e}")))?;

        let checksum_ok = invoice
            .payload_checksum
            .as_deref()
            .is_some_and(|expected| verify_checksum(&payload_json, secret, expected));
        if !checksum_ok {
            warn!(invoice_id = %invoice.id, "Stored invoice data does not match its checksum");
            return Err(GatewayFailure::data_drift(
                "stored payload does not match its checksum",
            ));
        }

        let timestamp = now.format(DATETIME_FORMAT).to_string();
        let signature = self.signer.sign(&payload_json, secret, &timestamp);
        let submission = SignedSubmission {
            credentials: DeviceCredentials::for_device(device, secret),
            invoice_number: invoice.invoice_number.clone(),
            payload_json,
            signature,
            timestamp,
        };

        self.with_timeout(self.gateway.submit_invoice(&submission)).await
    }

    /// Bookkeeping after a receipt was stored.
    pub(crate) async fn after_success(
        &self,
        device: &Device,
        invoice: &Invoice,
        receipt: &Receipt,
        now: DateTime<Utc>,
    ) -> GatewayResult<()> {
        self.db.devices().touch_last_sync(&device.id, now).await?;
        self.tracker.record_success(&device.id);

        info!(
            invoice_id = %invoice.id,
            receipt_number = %receipt.receipt_number,
            "Invoice confirmed"
        );
        self.events.emit(&GatewayEvent::InvoiceConfirmed {
            invoice_id: invoice.id.clone(),
            tenant_id: invoice.tenant_id.clone(),
            receipt_number: receipt.receipt_number.clone(),
        });
        Ok(())
    }

    /// Events after a permanent rejection was stored.
    pub(crate) fn after_permanent(&self, device: &Device, invoice: &Invoice, failure: &GatewayFailure) {
        warn!(
            invoice_id = %invoice.id,
            error = %failure.detail(),
            "Invoice permanently rejected"
        );
        self.events.emit(&GatewayEvent::InvoiceFailed {
            invoice_id: invoice.id.clone(),
            tenant_id: invoice.tenant_id.clone(),
            error: failure.detail(),
        });

        if let Some(consecutive) = self.tracker.record_permanent(&device.id) {
            self.events
                .emit(&GatewayEvent::AdminAlert(AdminAlert::RepeatedPermanentFailures {
                    device_id: device.id.clone(),
                    serial_number: device.serial_number.clone(),
                    consecutive,
                }));
        }
    }

    pub(crate) fn device_secret(&self, device: &Device) -> GatewayResult<String> {
        let stored = device
            .encrypted_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ComplianceError::MissingSecret {
                serial: device.serial_number.clone(),
            })?;
        Ok(self.cipher.decrypt(stored)?)
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, GatewayFailure>
    where
        F: std::future::Future<Output = Result<T, GatewayFailure>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayFailure::timeout(format!(
                "no answer within {}s",
                self.call_timeout.as_secs_f64()
            ))),
        }
    }

    async fn device_for(&self, ctx: &TenantContext, serial_number: &str) -> GatewayResult<Device> {
        match self.db.devices().get_by_serial(serial_number.trim()).await? {
            Some(device) if device.tenant_id == ctx.tenant_id => Ok(device),
            _ => Err(GatewayError::DeviceNotFound {
                serial: serial_number.to_string(),
            }),
        }
    }

    async fn load_invoice(&self, invoice_id: &str) -> GatewayResult<Invoice> {
        self.db
            .invoices()
            .get(invoice_id)
            .await?
            .ok_or_else(|| GatewayError::InvoiceNotFound {
                id: invoice_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FailureKind;
    use crate::events::GatewayEvent;
    use crate::testing::{drain, mock_harness, sale, t0, SERIAL, TENANT, TIN};
    use chrono::Duration as ChronoDuration;
    use fiscal_core::{PaymentMethod, TransactionType};

    fn ctx() -> TenantContext {
        TenantContext::new(TENANT)
    }

    // Scenario A: happy path
    #[tokio::test]
    async fn test_create_invoice_confirms_synchronously() {
        let (mut h, mock) = mock_harness().await;
        let now = t0() + ChronoDuration::hours(1);

        let result = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), now).await.unwrap();

        let SubmissionOutcome::Confirmed { receipt_number } = &result.outcome else {
            panic!("expected confirmation, got {:?}", result.outcome);
        };
        let invoice = &result.invoice;
        assert_eq!(invoice.status, InvoiceStatus::Confirmed);
        assert_eq!(invoice.receipt_number.as_ref(), Some(receipt_number));
        assert!(invoice.has_authority_fields());
        assert_eq!(invoice.confirmed_at, Some(now));
        assert_eq!(mock.submissions(), 1);

        assert!(h.db.retry_queue().active_for_invoice(&invoice.id).await.unwrap().is_none());

        let device = h.db.devices().get_by_serial(SERIAL).await.unwrap().unwrap();
        assert_eq!(device.last_sync_at, Some(now));

        let events = drain(&mut h.events);
        assert!(matches!(
            events.as_slice(),
            [GatewayEvent::InvoiceConfirmed { receipt_number: r, .. }] if r == receipt_number
        ));
    }

    // Scenario B: offline device
    #[tokio::test]
    async fn test_offline_device_is_rejected_before_anything_is_stored() {
        let (h, mock) = mock_harness().await;
        let now = t0() + ChronoDuration::hours(25);

        let err = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), now).await.unwrap_err();
        assert_eq!(err.code(), "OFFLINE_TOO_LONG");
        assert!(!err.is_retryable());
        assert_eq!(mock.submissions(), 0);
        assert!(h.service.invoice_counts().await.unwrap().is_empty());

        // Exactly 24h is still inside the window
        let ok = h
            .service
            .create_invoice_at(&ctx(), sale(SERIAL, "INV-2"), t0() + ChronoDuration::hours(24))
            .await
            .unwrap();
        assert!(matches!(ok.outcome, SubmissionOutcome::Confirmed { .. }));
    }

    #[tokio::test]
    async fn test_validation_failures_store_nothing() {
        let (h, mock) = mock_harness().await;

        let mut bad_totals = sale(SERIAL, "INV-1");
        bad_totals.total_amount_cents += 150;
        let err = h.service.create_invoice_at(&ctx(), bad_totals, t0()).await.unwrap_err();
        assert_eq!(err.code(), "TOTALS_MISMATCH");

        let mut copy = sale(SERIAL, "INV-2");
        copy.is_copy = true;
        let err = h.service.create_invoice_at(&ctx(), copy, t0()).await.unwrap_err();
        assert!(err.is_rule_violation());

        let mut refund = sale(SERIAL, "INV-3");
        refund.transaction_type = TransactionType::Refund;
        let err = h.service.create_invoice_at(&ctx(), refund, t0()).await.unwrap_err();
        assert!(err.is_rule_violation());

        assert_eq!(mock.submissions(), 0);
        assert!(h.service.invoice_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refund_confirms() {
        let (h, _mock) = mock_harness().await;
        let mut refund = sale(SERIAL, "RF-1");
        refund.transaction_type = TransactionType::Refund;
        refund.total_amount_cents = -refund.total_amount_cents;
        refund.tax_amount_cents = -refund.tax_amount_cents;
        refund.payment_method = PaymentMethod::MobileMoney;

        let result = h.service.create_invoice_at(&ctx(), refund, t0()).await.unwrap();
        assert!(matches!(result.outcome, SubmissionOutcome::Confirmed { .. }));
        assert_eq!(result.invoice.total_amount_cents, -116_000);
    }

    #[tokio::test]
    async fn test_transient_failure_queues_retry() {
        let (h, mock) = mock_harness().await;
        mock.script_failure(GatewayFailure::rejected("999", "system busy"));

        let result = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        assert_eq!(
            result.outcome,
            SubmissionOutcome::Queued {
                next_retry_at: t0() + ChronoDuration::seconds(60)
            }
        );
        assert_eq!(result.invoice.status, InvoiceStatus::Retry);
        assert!(result.invoice.has_no_authority_fields());

        let entry = h
            .db
            .retry_queue()
            .active_for_invoice(&result.invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.status, RetryStatus::Pending);
        assert_eq!(entry.last_error_code.as_deref(), Some("999"));
    }

    #[tokio::test]
    async fn test_permanent_rejection_fails_invoice() {
        let (mut h, mock) = mock_harness().await;
        mock.script_failure(GatewayFailure::rejected("910", "duplicate invoice number"));

        let result = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        assert_eq!(
            result.outcome,
            SubmissionOutcome::Rejected {
                code: Some("910".into()),
                message: "duplicate invoice number".into()
            }
        );
        assert_eq!(result.invoice.status, InvoiceStatus::Failed);
        assert_eq!(
            result.invoice.error_detail.as_deref(),
            Some("910: duplicate invoice number")
        );
        assert!(h.db.retry_queue().latest_for_invoice(&result.invoice.id).await.unwrap().is_none());

        let events = drain(&mut h.events);
        assert!(matches!(events.as_slice(), [GatewayEvent::InvoiceFailed { .. }]));
    }

    #[tokio::test]
    async fn test_repeated_permanent_failures_raise_alert() {
        let (mut h, mock) = mock_harness().await;
        for n in 1..=3 {
            mock.script_failure(GatewayFailure::rejected("902", "invalid item"));
            h.service
                .create_invoice_at(&ctx(), sale(SERIAL, &format!("INV-{n}")), t0())
                .await
                .unwrap();
        }

        let alerts: Vec<_> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::AdminAlert(alert) => Some(alert),
                _ => None,
            })
            .collect();
        assert_eq!(alerts.len(), 1);
        assert!(matches!(
            &alerts[0],
            AdminAlert::RepeatedPermanentFailures { consecutive: 3, serial_number, .. } if serial_number == SERIAL
        ));
    }

    #[tokio::test]
    async fn test_resubmitting_a_number_returns_the_stored_invoice() {
        let (h, mock) = mock_harness().await;
        let first = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        let again = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();

        assert_eq!(again.outcome, SubmissionOutcome::AlreadySubmitted);
        assert_eq!(again.invoice.id, first.invoice.id);
        assert_eq!(again.invoice.receipt_number, first.invoice.receipt_number);
        assert_eq!(mock.submissions(), 1);
    }

    #[tokio::test]
    async fn test_unknown_device_and_foreign_tenant() {
        let (h, _mock) = mock_harness().await;

        let err = h.service.create_invoice_at(&ctx(), sale("NOPE", "INV-1"), t0()).await.unwrap_err();
        assert_eq!(err.code(), "DEVICE_NOT_FOUND");

        let other = TenantContext::new("tenant-2");
        let err = h.service.create_invoice_at(&other, sale(SERIAL, "INV-1"), t0()).await.unwrap_err();
        assert_eq!(err.code(), "DEVICE_NOT_FOUND");

        let mine = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        let err = h.service.get_invoice(&other, &mine.invoice.id).await.unwrap_err();
        assert_eq!(err.code(), "INVOICE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_gateway_timeout_is_enforced() {
        use crate::testing::StallingGateway;

        let (h, _mock) = mock_harness().await;
        let service = h
            .service
            .clone()
            .with_call_timeout(std::time::Duration::from_millis(50));
        let service = SubmissionService {
            gateway: Arc::new(StallingGateway),
            ..service
        };

        let result = service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        assert!(matches!(result.outcome, SubmissionOutcome::Queued { .. }));
        let entry = h
            .db
            .retry_queue()
            .active_for_invoice(&result.invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert!(entry.last_error.unwrap().contains("no answer"));
    }

    #[tokio::test]
    async fn test_activation_lifecycle() {
        let (h, mock) = mock_harness().await;
        let registration = DeviceRegistration {
            tin: TIN.into(),
            branch_id: "01".into(),
            serial_number: "OSCU002".into(),
            name: "Till 2".into(),
            device_class: DeviceClass::Oscu,
        };
        let device = h.service.register_device_at(&ctx(), &registration, t0()).await.unwrap();
        assert_eq!(device.status, fiscal_core::DeviceStatus::Pending);
        assert!(!device.has_secret());

        let device = h.service.activate_device_at(&ctx(), "OSCU002", t0()).await.unwrap();
        assert_eq!(device.status, fiscal_core::DeviceStatus::Active);
        assert!(device.is_certified);
        assert_eq!(device.last_sync_at, Some(t0()));

        // Stored encrypted, never in plaintext
        let stored = device.encrypted_secret.clone().unwrap();
        let plain = crate::client::mock::derive_secret(TIN, "OSCU002");
        assert_ne!(stored, plain);
        assert_eq!(h.service.device_secret(&device).unwrap(), plain);

        // Unregistered identity fails closed and marks the device failed
        mock.registry().unregister(TIN);
        let err = h.service.activate_device_at(&ctx(), "OSCU002", t0()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authority(ref f) if f.kind == FailureKind::Unregistered));
        let device = h.db.devices().get_by_serial("OSCU002").await.unwrap().unwrap();
        assert_eq!(device.status, fiscal_core::DeviceStatus::Failed);
    }

    #[tokio::test]
    async fn test_activation_without_secret_key_stores_nothing() {
        let (h, _mock) = mock_harness().await;
        let service = h.service.clone().with_cipher(SecretCipher::disabled());
        let registration = DeviceRegistration {
            tin: TIN.into(),
            branch_id: "02".into(),
            serial_number: "OSCU003".into(),
            name: "Till 3".into(),
            device_class: DeviceClass::Oscu,
        };
        service.register_device_at(&ctx(), &registration, t0()).await.unwrap();

        let err = service.activate_device_at(&ctx(), "OSCU003", t0()).await.unwrap_err();
        assert_eq!(err.code(), "SECRET_ERROR");
        let device = h.db.devices().get_by_serial("OSCU003").await.unwrap().unwrap();
        assert_eq!(device.status, fiscal_core::DeviceStatus::Pending);
        assert!(!device.has_secret());
    }

    #[tokio::test]
    async fn test_refresh_and_deregister() {
        let (h, _mock) = mock_harness().await;
        let later = t0() + ChronoDuration::hours(30);

        let device = h.service.refresh_device_status_at(&ctx(), SERIAL, later).await.unwrap();
        assert_eq!(device.last_sync_at, Some(later));

        // A fresh contact reopens the offline window
        let result = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), later).await.unwrap();
        assert!(matches!(result.outcome, SubmissionOutcome::Confirmed { .. }));

        let device = h.service.deregister_device_at(&ctx(), SERIAL, later).await.unwrap();
        assert_eq!(device.status, fiscal_core::DeviceStatus::Inactive);
        let err = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-2"), later).await.unwrap_err();
        assert_eq!(err.code(), "DEVICE_INACTIVE");
    }

    #[tokio::test]
    async fn test_resync_rules() {
        let (h, mock) = mock_harness().await;

        // confirmed
        let done = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        let err = h.service.resync_invoice_at(&ctx(), &done.invoice.id, t0()).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_CONFIRMED");

        // retry with a pending entry: made due now, attempts kept
        mock.script_failure(GatewayFailure::timeout("t"));
        let queued = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-2"), t0()).await.unwrap();
        let later = t0() + ChronoDuration::seconds(5);
        let outcome = h.service.resync_invoice_at(&ctx(), &queued.invoice.id, later).await.unwrap();
        let ResyncOutcome::Expedited { entry_id } = outcome else {
            panic!("expected expedite, got {outcome:?}");
        };
        let entry = h.db.retry_queue().get(&entry_id).await.unwrap().unwrap();
        assert_eq!(entry.next_retry_at, later);
        assert_eq!(entry.attempt_count, 0);

        // processing entry: in flight
        assert!(h.db.retry_queue().claim(&entry_id, later).await.unwrap());
        let err = h.service.resync_invoice_at(&ctx(), &queued.invoice.id, later).await.unwrap_err();
        assert_eq!(err.code(), "IN_FLIGHT");

        // failed: reopened
        mock.script_failure(GatewayFailure::rejected("910", "dup"));
        let failed = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-3"), t0()).await.unwrap();
        let outcome = h.service.resync_invoice_at(&ctx(), &failed.invoice.id, later).await.unwrap();
        assert!(matches!(outcome, ResyncOutcome::Rearmed { attempt_count: 0, .. }));
        let invoice = h.service.get_invoice(&ctx(), &failed.invoice.id).await.unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Retry);

        let unknown = Uuid::new_v4().to_string();
        let err = h.service.resync_invoice_at(&ctx(), &unknown, later).await.unwrap_err();
        assert_eq!(err.code(), "INVOICE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_malformed_invoice_id_rejected() {
        let (h, _mock) = mock_harness().await;

        let err = h.service.get_invoice(&ctx(), "INV-1").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_FORMAT");

        let err = h.service.resync_invoice_at(&ctx(), " ", t0()).await.unwrap_err();
        assert_eq!(err.code(), "REQUIRED");

        let err = h.service.get_invoice_lines(&ctx(), "../etc").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_FORMAT");
    }
}
