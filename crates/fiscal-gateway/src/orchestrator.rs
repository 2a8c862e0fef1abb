//! # Retry Orchestrator
//!
//! Drains the retry queue: claims due entries, re-delivers the stored
//! invoice, and settles each attempt.
//!
//! ## Per-Entry Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  due(now) ──► claim (CAS pending → processing) ──✗──► skipped           │
//! │                    │                                                    │
//! │                    ▼                                                    │
//! │  invoice terminal? ──✓──► close entry (completed / failed)              │
//! │                    │                                                    │
//! │                    ▼                                                    │
//! │  device certified + secret? ──✗──► transient "device not ready"         │
//! │                    │                                                    │
//! │                    ▼                                                    │
//! │  rebuild payload, verify checksum ──✗──► permanent DRIFT                │
//! │                    │                                                    │
//! │                    ▼                                                    │
//! │  sign (fresh timestamp) + submit                                        │
//! │     ├── receipt     ──► complete: entry completed, invoice confirmed    │
//! │     ├── transient   ──► attempt+1 < max ? reschedule (backoff)          │
//! │     │                                   : fail + RetryExhausted alert   │
//! │     └── permanent   ──► fail: entry failed, invoice failed              │
//! │                                                                         │
//! │  Any error after the claim puts the entry back to pending.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Up to `workers` entries are processed at once. A claim is the only way
//! to work on an entry, so concurrent runs (or processes) never submit the
//! same entry twice.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use fiscal_core::retry::RetryDecision;
use fiscal_core::state::AttemptOutcome;
use fiscal_core::{compliance, Device, Invoice, InvoiceStatus, RetryQueueEntry, RetryStatus};
use fiscal_db::FailureNote;

use crate::client::GatewayFailure;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::events::{AdminAlert, GatewayEvent};
use crate::service::SubmissionService;

/// Run stalled-work recovery on every Nth scheduler tick.
const RECOVERY_EVERY_TICKS: u64 = 10;

// =============================================================================
// Summaries
// =============================================================================

/// What happened to one claimed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Another worker got the claim first, or took it back mid-attempt.
    Skipped,
    Confirmed,
    Rescheduled,
    Failed,
    /// The invoice was already terminal; the entry was closed untouched.
    Closed,
}

/// Counters for one `run_due` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub due: usize,
    pub confirmed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub closed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Skipped => self.skipped += 1,
            EntryOutcome::Confirmed => self.confirmed += 1,
            EntryOutcome::Rescheduled => self.rescheduled += 1,
            EntryOutcome::Failed => self.failed += 1,
            EntryOutcome::Closed => self.closed += 1,
        }
    }

    /// Entries this pass actually worked on.
    pub fn processed(&self) -> usize {
        self.confirmed + self.rescheduled + self.failed + self.closed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// `sent` invoices put back on the queue.
    pub requeued: usize,
    /// Claims older than the cutoff returned to pending.
    pub released: u64,
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Clone)]
pub struct RetryOrchestrator {
    service: SubmissionService,
    batch_size: u32,
    workers: usize,
    stalled_after: ChronoDuration,
}

impl RetryOrchestrator {
    pub fn new(service: SubmissionService) -> Self {
        RetryOrchestrator {
            service,
            batch_size: 50,
            workers: 4,
            stalled_after: ChronoDuration::minutes(5),
        }
    }

    pub fn from_config(service: SubmissionService, config: &GatewayConfig) -> Self {
        Self::new(service)
            .with_batch_size(config.retry.batch_size)
            .with_workers(config.retry.workers)
            .with_stalled_after(config.stalled_sent_after())
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_stalled_after(mut self, stalled_after: ChronoDuration) -> Self {
        self.stalled_after = stalled_after;
        self
    }

    pub fn service(&self) -> &SubmissionService {
        &self.service
    }

    pub async fn run_due(&self) -> GatewayResult<RunSummary> {
        self.run_due_at(Utc::now()).await
    }

    /// Processes up to `batch_size` entries due at `now`.
    pub async fn run_due_at(&self, now: DateTime<Utc>) -> GatewayResult<RunSummary> {
        let entries = self
            .service
            .db
            .retry_queue()
            .due(now, self.batch_size)
            .await?;

        let mut summary = RunSummary {
            due: entries.len(),
            ..RunSummary::default()
        };
        if entries.is_empty() {
            debug!("No retry entries due");
            return Ok(summary);
        }

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for entry in entries {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| GatewayError::Internal(format!("worker pool closed: {e}")))?;
            let worker = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let entry_id = entry.id.clone();
                (entry_id, worker.claim_and_process(entry, now).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => summary.record(outcome),
                Ok((entry_id, Err(e))) => {
                    error!(%entry_id, error = %e, "Retry attempt failed");
                    summary.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "Retry worker panicked");
                    summary.errors += 1;
                }
            }
        }

        info!(
            due = summary.due,
            confirmed = summary.confirmed,
            rescheduled = summary.rescheduled,
            failed = summary.failed,
            closed = summary.closed,
            skipped = summary.skipped,
            errors = summary.errors,
            "Retry pass finished"
        );
        Ok(summary)
    }

    /// Claims `entry` and runs one attempt. Errors after the claim release
    /// the entry back to pending.
    pub async fn claim_and_process(
        &self,
        mut entry: RetryQueueEntry,
        now: DateTime<Utc>,
    ) -> GatewayResult<EntryOutcome> {
        let queue = self.service.db.retry_queue();
        if !queue.claim(&entry.id, now).await? {
            return Ok(EntryOutcome::Skipped);
        }
        entry.status = RetryStatus::Processing;
        entry.claimed_at = Some(now);

        match self.process_claimed(&entry, now).await {
            Ok(outcome) => Ok(outcome),
            Err(GatewayError::Database(e)) if e.is_claim_lost() => {
                warn!(
                    entry_id = %entry.id,
                    "Claim was taken back mid-attempt; leaving the entry to its new holder"
                );
                Ok(EntryOutcome::Skipped)
            }
            Err(e) => {
                if let Err(release_err) = queue.release(&entry, now).await {
                    error!(
                        entry_id = %entry.id,
                        error = %release_err,
                        "Could not release claim; stuck-claim recovery will pick it up"
                    );
                }
                Err(e)
            }
        }
    }

    async fn process_claimed(
        &self,
        entry: &RetryQueueEntry,
        now: DateTime<Utc>,
    ) -> GatewayResult<EntryOutcome> {
        let db = &self.service.db;
        let queue = db.retry_queue();

        let Some(invoice) = db.invoices().get(&entry.invoice_id).await? else {
            warn!(entry_id = %entry.id, invoice_id = %entry.invoice_id, "Retry entry for a missing invoice");
            queue.close(&entry.id, RetryStatus::Failed, now).await?;
            return Ok(EntryOutcome::Closed);
        };

        if invoice.status.is_terminal() {
            let status = if invoice.status == InvoiceStatus::Confirmed {
                RetryStatus::Completed
            } else {
                RetryStatus::Failed
            };
            debug!(invoice_id = %invoice.id, status = %invoice.status, "Invoice already settled");
            queue.close(&entry.id, status, now).await?;
            return Ok(EntryOutcome::Closed);
        }

        let device = db
            .devices()
            .get_by_id(&invoice.device_id)
            .await?
            .ok_or_else(|| GatewayError::Internal(format!("invoice {} has no device", invoice.id)))?;

        let attempt = match self.ready_secret(&device) {
            Ok(secret) => {
                let lines = db.invoices().get_lines(&invoice.id).await?;
                self.service
                    .deliver(&device, &invoice, &lines, &secret, now)
                    .await
            }
            Err(failure) => Err(failure),
        };

        match attempt {
            Ok(receipt) => {
                if queue.complete(entry, &receipt.to_confirmation(), now).await? {
                    self.service.after_success(&device, &invoice, &receipt, now).await?;
                    Ok(EntryOutcome::Confirmed)
                } else {
                    Ok(EntryOutcome::Closed)
                }
            }
            Err(failure) => self.settle_failure(entry, &device, &invoice, failure, now).await,
        }
    }

    async fn settle_failure(
        &self,
        entry: &RetryQueueEntry,
        device: &Device,
        invoice: &Invoice,
        failure: GatewayFailure,
        now: DateTime<Utc>,
    ) -> GatewayResult<EntryOutcome> {
        let queue = self.service.db.retry_queue();
        let note = failure.note();

        match failure.outcome(entry.unknown_retried) {
            AttemptOutcome::Transient => {
                match self
                    .service
                    .policy
                    .after_transient_failure(entry.attempt_count, now)
                {
                    RetryDecision::Reschedule {
                        attempt,
                        next_retry_at,
                    } => {
                        if !queue
                            .reschedule(entry, attempt, next_retry_at, &note, now)
                            .await?
                        {
                            warn!(entry_id = %entry.id, "Claim was taken back before rescheduling");
                            return Ok(EntryOutcome::Skipped);
                        }
                        info!(
                            invoice_id = %invoice.id,
                            attempt,
                            %next_retry_at,
                            error = %note.message,
                            "Retry rescheduled"
                        );
                        Ok(EntryOutcome::Rescheduled)
                    }
                    RetryDecision::Exhausted { attempts } => {
                        queue.fail(entry, attempts, &note, now).await?;
                        warn!(invoice_id = %invoice.id, attempts, "Retry attempts exhausted");

                        let events = &self.service.events;
                        events.emit(&GatewayEvent::InvoiceFailed {
                            invoice_id: invoice.id.clone(),
                            tenant_id: invoice.tenant_id.clone(),
                            error: note.message.clone(),
                        });
                        events.emit(&GatewayEvent::AdminAlert(AdminAlert::RetryExhausted {
                            invoice_id: invoice.id.clone(),
                            tenant_id: invoice.tenant_id.clone(),
                            attempts,
                            last_error: note.message.clone(),
                        }));
                        Ok(EntryOutcome::Failed)
                    }
                }
            }
            AttemptOutcome::Permanent | AttemptOutcome::Accepted => {
                queue
                    .fail(entry, entry.attempt_count.saturating_add(1), &note, now)
                    .await?;
                self.service.after_permanent(device, invoice, &failure);
                Ok(EntryOutcome::Failed)
            }
        }
    }

    /// The device's plaintext key, if it may submit right now.
    fn ready_secret(&self, device: &Device) -> Result<String, GatewayFailure> {
        compliance::is_certified(device)
            .map_err(|e| GatewayFailure::device_not_ready(e.to_string()))?;
        self.service
            .device_secret(device)
            .map_err(|e| GatewayFailure::device_not_ready(e.to_string()))
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    pub async fn recover_stalled(&self) -> GatewayResult<RecoverySummary> {
        self.recover_stalled_at(Utc::now()).await
    }

    /// Requeues invoices left in `sent` and releases claims held longer
    /// than `stalled_after`.
    pub async fn recover_stalled_at(&self, now: DateTime<Utc>) -> GatewayResult<RecoverySummary> {
        let db = &self.service.db;
        let queue = db.retry_queue();
        let cutoff = now - self.stalled_after;
        let mut summary = RecoverySummary::default();

        let stalled = db.invoices().find_stalled_sent(cutoff, self.batch_size).await?;
        let note = FailureNote::new("delivery outcome unknown; process stopped mid-call", None);
        for invoice in stalled {
            match queue.enqueue(&invoice.id, &invoice.tenant_id, now, &note, now).await {
                Ok(Some(_)) => summary.requeued += 1,
                Ok(None) => {}
                Err(e) if e.is_unique_violation() => {}
                Err(e) => return Err(e.into()),
            }
        }

        summary.released = queue.release_stuck(cutoff, now).await?;

        if summary.requeued > 0 || summary.released > 0 {
            warn!(
                requeued = summary.requeued,
                released = summary.released,
                "Recovered stalled work"
            );
        }
        Ok(summary)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Runs the orchestrator on a fixed interval until shut down.
pub struct RetryScheduler {
    orchestrator: RetryOrchestrator,
    poll_interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping a running [`RetryScheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    /// Triggers graceful shutdown. The current pass finishes first.
    pub async fn shutdown(&self) -> GatewayResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| GatewayError::Internal("Shutdown channel closed".into()))
    }
}

impl RetryScheduler {
    pub fn new(orchestrator: RetryOrchestrator, poll_interval: Duration) -> (Self, SchedulerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let scheduler = RetryScheduler {
            orchestrator,
            poll_interval,
            shutdown_rx,
        };
        (scheduler, SchedulerHandle { shutdown_tx })
    }

    /// Runs the scheduler loop.
    ///
    /// This should be spawned as a background task. The first tick runs
    /// immediately, including stalled-work recovery.
    pub async fn run(mut self) {
        info!(poll_interval = ?self.poll_interval, "Retry scheduler starting");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if ticks % RECOVERY_EVERY_TICKS == 0 {
                        if let Err(e) = self.orchestrator.recover_stalled().await {
                            error!(error = %e, "Stalled-work recovery failed");
                        }
                    }
                    ticks = ticks.wrapping_add(1);

                    if let Err(e) = self.orchestrator.run_due().await {
                        error!(error = %e, "Retry pass failed");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Retry scheduler shutting down");
                    break;
                }
            }
        }

        info!("Retry scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::client::LiveGateway;
    use crate::config::EndpointPaths;
    use crate::service::SubmissionOutcome;
    use crate::testing::{
        drain, harness_with, mock_harness, sale, t0, FakeAuthority, FakeReply, SERIAL, TENANT,
    };
    use fiscal_core::TenantContext;

    fn ctx() -> TenantContext {
        TenantContext::new(TENANT)
    }

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    async fn entry_for(orch: &RetryOrchestrator, invoice_id: &str) -> RetryQueueEntry {
        orch.service
            .db
            .retry_queue()
            .latest_for_invoice(invoice_id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_transient_failure_then_retry_confirms() {
        let (mut h, mock) = mock_harness().await;
        mock.script_failure(GatewayFailure::timeout("authority slow"));
        let orch = RetryOrchestrator::new(h.service.clone());

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        assert!(matches!(created.outcome, SubmissionOutcome::Queued { .. }));

        let early = orch.run_due_at(t0() + secs(59)).await.unwrap();
        assert_eq!(early.due, 0);

        let summary = orch.run_due_at(t0() + secs(60)).await.unwrap();
        assert_eq!(summary.confirmed, 1);
        assert_eq!(mock.submissions(), 2);

        let invoice = h.db.invoices().get(&created.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Confirmed);
        assert!(invoice.has_authority_fields());

        let entry = entry_for(&orch, &invoice.id).await;
        assert_eq!(entry.status, RetryStatus::Completed);

        let events = drain(&mut h.events);
        assert!(matches!(events.as_slice(), [GatewayEvent::InvoiceConfirmed { .. }]));
    }

    #[tokio::test]
    async fn test_backoff_until_exhausted_raises_alert() {
        let (mut h, mock) = mock_harness().await;
        for _ in 0..6 {
            mock.script_failure(GatewayFailure::connection("refused"));
        }
        let orch = RetryOrchestrator::new(h.service.clone());

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        let mut entry = entry_for(&orch, &created.invoice.id).await;
        let mut delays = vec![(entry.next_retry_at - t0()).num_seconds()];

        loop {
            let now = entry.next_retry_at;
            orch.run_due_at(now).await.unwrap();
            entry = entry_for(&orch, &created.invoice.id).await;
            if entry.status != RetryStatus::Pending {
                break;
            }
            delays.push((entry.next_retry_at - now).num_seconds());
        }

        assert_eq!(delays, vec![60, 120, 240, 480, 960]);
        assert_eq!(entry.status, RetryStatus::Failed);
        assert_eq!(entry.attempt_count, 5);
        assert_eq!(mock.submissions(), 6);

        let invoice = h.db.invoices().get(&created.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Failed);
        assert_eq!(invoice.retry_count, 5);
        assert!(invoice.has_no_authority_fields());

        let alerts: Vec<_> = drain(&mut h.events)
            .into_iter()
            .filter(|e| matches!(e, GatewayEvent::AdminAlert(_)))
            .collect();
        assert!(matches!(
            alerts.as_slice(),
            [GatewayEvent::AdminAlert(AdminAlert::RetryExhausted { attempts: 5, .. })]
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_on_retry() {
        let (h, mock) = mock_harness().await;
        mock.script_failure(GatewayFailure::timeout("slow"));
        mock.script_failure(GatewayFailure::rejected("910", "duplicate"));
        let orch = RetryOrchestrator::new(h.service.clone());

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        let summary = orch.run_due_at(t0() + secs(60)).await.unwrap();
        assert_eq!(summary.failed, 1);

        let entry = entry_for(&orch, &created.invoice.id).await;
        assert_eq!(entry.status, RetryStatus::Failed);
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(entry.last_error_code.as_deref(), Some("910"));

        let invoice = h.db.invoices().get(&created.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Failed);
        assert_eq!(invoice.error_detail.as_deref(), Some("910: duplicate"));
    }

    #[tokio::test]
    async fn test_unknown_codes_escalate_on_repeat() {
        let (h, mock) = mock_harness().await;
        mock.script_failure(GatewayFailure::rejected("777", "new code"));
        mock.script_failure(GatewayFailure::rejected("778", "another new code"));
        let orch = RetryOrchestrator::new(h.service.clone());

        // First unknown code: retried
        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        assert!(matches!(created.outcome, SubmissionOutcome::Queued { .. }));

        // Second on the same entry: permanent
        let summary = orch.run_due_at(t0() + secs(60)).await.unwrap();
        assert_eq!(summary.failed, 1);
        let invoice = h.db.invoices().get(&created.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_code_retried_once_per_entry() {
        let (h, mock) = mock_harness().await;
        mock.script_failure(GatewayFailure::rejected("777", "new code"));
        mock.script_failure(GatewayFailure::timeout("slow"));
        mock.script_failure(GatewayFailure::rejected("777", "new code"));
        let orch = RetryOrchestrator::new(h.service.clone());

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        assert!(matches!(created.outcome, SubmissionOutcome::Queued { .. }));

        // A timeout in between does not earn the unknown code a second retry
        let first = orch.run_due_at(t0() + secs(60)).await.unwrap();
        assert_eq!(first.rescheduled, 1);
        let entry = entry_for(&orch, &created.invoice.id).await;
        assert!(entry.unknown_retried);
        assert_eq!(entry.last_error_code, None);

        let second = orch.run_due_at(entry.next_retry_at).await.unwrap();
        assert_eq!(second.failed, 1);
        assert_eq!(mock.submissions(), 3);

        let entry = entry_for(&orch, &created.invoice.id).await;
        assert_eq!(entry.status, RetryStatus::Failed);
        assert_eq!(entry.attempt_count, 2);
        let invoice = h.db.invoices().get(&created.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Failed);
        assert_eq!(invoice.error_detail.as_deref(), Some("777: new code"));
    }

    #[tokio::test]
    async fn test_unknown_code_after_transient_is_retried() {
        let (h, mock) = mock_harness().await;
        mock.script_failure(GatewayFailure::timeout("slow"));
        mock.script_failure(GatewayFailure::rejected("777", "new code"));
        let orch = RetryOrchestrator::new(h.service.clone());

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        let first = orch.run_due_at(t0() + secs(60)).await.unwrap();
        assert_eq!(first.rescheduled, 1);

        let entry = entry_for(&orch, &created.invoice.id).await;
        let second = orch.run_due_at(entry.next_retry_at).await.unwrap();
        assert_eq!(second.confirmed, 1);
    }

    #[tokio::test]
    async fn test_uncertified_device_is_rescheduled_without_submitting() {
        let (h, mock) = mock_harness().await;
        mock.script_failure(GatewayFailure::timeout("slow"));
        let orch = RetryOrchestrator::new(h.service.clone());

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        h.service.deregister_device_at(&ctx(), SERIAL, t0()).await.unwrap();

        let summary = orch.run_due_at(t0() + secs(60)).await.unwrap();
        assert_eq!(summary.rescheduled, 1);
        assert_eq!(mock.submissions(), 1);

        let entry = entry_for(&orch, &created.invoice.id).await;
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(entry.status, RetryStatus::Pending);
        assert!(entry.last_error.unwrap().contains(SERIAL));
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_as_drift() {
        let (h, mock) = mock_harness().await;
        mock.script_failure(GatewayFailure::timeout("slow"));
        let orch = RetryOrchestrator::new(h.service.clone());

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        sqlx::query("UPDATE invoices SET customer_name = 'Someone Else' WHERE id = ?1")
            .bind(&created.invoice.id)
            .execute(h.db.pool())
            .await
            .unwrap();

        let summary = orch.run_due_at(t0() + secs(60)).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(mock.submissions(), 1);

        let entry = entry_for(&orch, &created.invoice.id).await;
        assert_eq!(entry.last_error_code.as_deref(), Some(crate::codes::DATA_DRIFT_CODE));
    }

    #[tokio::test]
    async fn test_settled_invoice_closes_entry() {
        let (h, mock) = mock_harness().await;
        mock.script_failure(GatewayFailure::timeout("slow"));
        let orch = RetryOrchestrator::new(h.service.clone());

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        h.db.invoices()
            .mark_failed(&created.invoice.id, "cancelled by operator", t0())
            .await
            .unwrap();

        let summary = orch.run_due_at(t0() + secs(60)).await.unwrap();
        assert_eq!(summary.closed, 1);
        assert_eq!(mock.submissions(), 1);
        assert_eq!(
            entry_for(&orch, &created.invoice.id).await.status,
            RetryStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_concurrent_passes_submit_each_entry_once() {
        let (h, mock) = mock_harness().await;
        for n in 0..4 {
            mock.script_failure(GatewayFailure::timeout("slow"));
            h.service
                .create_invoice_at(&ctx(), sale(SERIAL, &format!("INV-{n}")), t0())
                .await
                .unwrap();
        }
        assert_eq!(mock.submissions(), 4);

        let a = RetryOrchestrator::new(h.service.clone()).with_workers(2);
        let b = a.clone();
        let now = t0() + secs(60);
        let (ra, rb) = tokio::join!(a.run_due_at(now), b.run_due_at(now));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.confirmed + rb.confirmed, 4);
        assert_eq!(ra.skipped + rb.skipped, ra.due + rb.due - 4);
        assert_eq!(mock.submissions(), 8);
    }

    #[tokio::test]
    async fn test_recovers_stalled_sent_invoices_and_claims() {
        let (h, mock) = mock_harness().await;
        let orch = RetryOrchestrator::new(h.service.clone()).with_stalled_after(ChronoDuration::minutes(5));

        // An invoice left in `sent` by a crash
        mock.script_failure(GatewayFailure::rejected("910", "dup"));
        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        sqlx::query("UPDATE invoices SET status = 'sent', error_detail = NULL, updated_at = ?2 WHERE id = ?1")
            .bind(&created.invoice.id)
            .bind(t0())
            .execute(h.db.pool())
            .await
            .unwrap();

        // A claim abandoned by a crashed worker
        mock.script_failure(GatewayFailure::timeout("slow"));
        let other = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-2"), t0()).await.unwrap();
        let stuck = entry_for(&orch, &other.invoice.id).await;
        assert!(h.db.retry_queue().claim(&stuck.id, t0() + secs(60)).await.unwrap());

        let later = t0() + ChronoDuration::minutes(10);
        let recovered = orch.recover_stalled_at(later).await.unwrap();
        assert_eq!(recovered, RecoverySummary { requeued: 1, released: 1 });

        // Running again finds nothing new
        let again = orch.recover_stalled_at(later).await.unwrap();
        assert_eq!(again, RecoverySummary::default());

        let summary = orch.run_due_at(later).await.unwrap();
        assert_eq!(summary.confirmed, 2);
    }

    // Live client against a scripted HTTP authority

    async fn live_harness(fake: &FakeAuthority, timeout: std::time::Duration) -> crate::testing::Harness {
        let live = LiveGateway::new(
            url::Url::parse(&fake.base_url).unwrap(),
            EndpointPaths::default(),
            timeout,
            Arc::new(MemoryAuditLog::new()),
        )
        .unwrap();
        harness_with(Arc::new(live)).await
    }

    #[tokio::test]
    async fn test_live_timeout_then_retry_confirms() {
        let fake = FakeAuthority::start().await;
        fake.script_submit(FakeReply::delayed(
            std::time::Duration::from_millis(800),
            FakeReply::success(),
        ));
        let h = live_harness(&fake, std::time::Duration::from_millis(200)).await;
        let orch = RetryOrchestrator::new(h.service.clone());

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        assert_eq!(created.invoice.status, InvoiceStatus::Retry);
        let entry = entry_for(&orch, &created.invoice.id).await;
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.next_retry_at, t0() + secs(60));

        let summary = orch.run_due_at(t0() + secs(61)).await.unwrap();
        assert_eq!(summary.confirmed, 1);

        let invoice = h.db.invoices().get(&created.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Confirmed);
        assert_eq!(invoice.receipt_number.as_deref(), Some("RCPT-1"));

        // One entry for the invoice, reused by the retry and now completed
        assert_eq!(
            h.db.retry_queue().count_by_status().await.unwrap(),
            vec![(RetryStatus::Completed, 1)]
        );
        assert_eq!(entry_for(&orch, &invoice.id).await.id, entry.id);

        // Both attempts used the issued key and a signature
        let submits: Vec<_> = fake
            .requests()
            .into_iter()
            .filter(|r| r.path == "/api/v1/invoices")
            .collect();
        assert_eq!(submits.len(), 2);
        for request in &submits {
            assert_eq!(request.header("x-device-key"), Some(FakeAuthority::DEVICE_KEY));
            assert!(request.header("x-signature").is_some_and(|s| !s.is_empty()));
        }
        // Each attempt is signed with its own timestamp
        assert_ne!(submits[0].header("x-timestamp"), submits[1].header("x-timestamp"));
    }

    #[tokio::test]
    async fn test_live_permanent_rejection() {
        let fake = FakeAuthority::start().await;
        fake.script_submit(FakeReply::result_code("910", "duplicate invoice number"));
        let h = live_harness(&fake, std::time::Duration::from_secs(5)).await;

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        assert_eq!(created.invoice.status, InvoiceStatus::Failed);
        assert!(matches!(
            created.outcome,
            SubmissionOutcome::Rejected { ref code, .. } if code.as_deref() == Some("910")
        ));
        assert!(h
            .db
            .retry_queue()
            .latest_for_invoice(&created.invoice.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(fake.submissions(), 1);
    }

    #[tokio::test]
    async fn test_live_http_503_is_queued() {
        let fake = FakeAuthority::start().await;
        fake.script_submit(FakeReply::raw(503, "maintenance"));
        let h = live_harness(&fake, std::time::Duration::from_secs(5)).await;

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        assert!(matches!(created.outcome, SubmissionOutcome::Queued { .. }));
        let entry = h
            .db
            .retry_queue()
            .active_for_invoice(&created.invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.last_error_code.as_deref(), Some("http:503"));
        assert!(!entry.unknown_retried);
    }

    #[tokio::test]
    async fn test_live_unknown_code_after_http_503_is_retried() {
        let fake = FakeAuthority::start().await;
        fake.script_submit(FakeReply::raw(503, "maintenance"));
        fake.script_submit(FakeReply::result_code("777", "new code"));
        let h = live_harness(&fake, std::time::Duration::from_secs(5)).await;
        let orch = RetryOrchestrator::new(h.service.clone());

        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();
        assert!(matches!(created.outcome, SubmissionOutcome::Queued { .. }));

        // The first unknown code gets its retry
        let first = orch.run_due_at(t0() + secs(60)).await.unwrap();
        assert_eq!(first.rescheduled, 1);
        let entry = entry_for(&orch, &created.invoice.id).await;
        assert_eq!(entry.last_error_code.as_deref(), Some("777"));
        assert!(entry.unknown_retried);

        let second = orch.run_due_at(entry.next_retry_at).await.unwrap();
        assert_eq!(second.confirmed, 1);
        let invoice = h.db.invoices().get(&created.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Confirmed);
        assert_eq!(fake.submissions(), 3);
    }

    #[tokio::test]
    async fn test_scheduler_drains_queue_and_stops() {
        let (h, mock) = mock_harness().await;
        mock.script_failure(GatewayFailure::timeout("slow"));
        let created = h.service.create_invoice_at(&ctx(), sale(SERIAL, "INV-1"), t0()).await.unwrap();

        let orch = RetryOrchestrator::new(h.service.clone());
        let (scheduler, handle) = RetryScheduler::new(orch, std::time::Duration::from_millis(20));
        let task = tokio::spawn(scheduler.run());

        let mut confirmed = false;
        for _ in 0..100 {
            let invoice = h.db.invoices().get(&created.invoice.id).await.unwrap().unwrap();
            if invoice.status == InvoiceStatus::Confirmed {
                confirmed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(confirmed);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
