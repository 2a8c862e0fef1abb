//! # Retry Queue Repository
//!
//! Durable retry entries and the transactions that move an invoice and its
//! entry together.
//!
//! ## Entry Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  enqueue ──► pending ──claim (CAS)──► processing                        │
//! │                 ▲                        │                               │
//! │                 │ reschedule             ├── complete ──► completed      │
//! │                 └────────────────────────┤                               │
//! │                 ▲                        └── fail ──────► failed         │
//! │                 │ release (aborted run)                      │           │
//! │                 │                                            │           │
//! │                 └──────────── rearm_failed (manual) ─────────┘           │
//! │                                                                         │
//! │  claim:  UPDATE retry_queue SET status = 'processing'                   │
//! │          WHERE id = ? AND status = 'pending' AND next_retry_at <= ?     │
//! │          rows_affected = 1 → claimed, 0 → someone else has it           │
//! │                                                                         │
//! │  reschedule / complete / fail / release match the claim itself:        │
//! │          WHERE id = ? AND status = 'processing' AND claimed_at = ?      │
//! │          so a holder whose claim was released and retaken changes      │
//! │          nothing.                                                       │
//! │                                                                         │
//! │  At most one pending/processing entry per invoice (partial unique      │
//! │  index `idx_retry_queue_one_active`).                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use super::invoice::{confirm_with, fail_with, retry_with, Confirmation};
use super::{reopenable_sql, sources_sql};
use crate::error::{DbError, DbResult};
use fiscal_core::{InvoiceStatus, RetryQueueEntry, RetryStatus};

const ENTRY_COLUMNS: &str = r#"
    id, tenant_id, invoice_id, attempt_count, next_retry_at, last_error,
    last_error_code, unknown_retried, status, claimed_at, created_at, updated_at
"#;

/// Failure details recorded on an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureNote {
    pub message: String,
    /// Failure code, when the failure carried one.
    pub code: Option<String>,
    /// The failure was an authority result code with no known meaning.
    pub unknown_code: bool,
}

impl FailureNote {
    pub fn new(message: impl Into<String>, code: Option<String>) -> Self {
        FailureNote {
            message: message.into(),
            code,
            unknown_code: false,
        }
    }

    pub fn with_unknown_code(mut self, unknown_code: bool) -> Self {
        self.unknown_code = unknown_code;
        self
    }
}

/// Repository for retry queue operations.
#[derive(Debug, Clone)]
pub struct RetryQueueRepository {
    pool: SqlitePool,
}

impl RetryQueueRepository {
    /// Creates a new RetryQueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RetryQueueRepository { pool }
    }

    /// Moves a live invoice to `retry` and creates its entry at attempt 0.
    ///
    /// Returns `None` if the invoice is no longer live (already confirmed
    /// or failed); nothing is written in that case.
    ///
    /// ## Errors
    /// `UniqueViolation` if the invoice already has an active entry.
    pub async fn enqueue(
        &self,
        invoice_id: &str,
        tenant_id: &str,
        next_retry_at: DateTime<Utc>,
        note: &FailureNote,
        now: DateTime<Utc>,
    ) -> DbResult<Option<RetryQueueEntry>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        if !retry_with(&mut tx, invoice_id, Some(0), now).await? {
            tx.rollback()
                .await
                .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
            return Ok(None);
        }

        let entry = RetryQueueEntry {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            invoice_id: invoice_id.to_string(),
            attempt_count: 0,
            next_retry_at,
            last_error: Some(note.message.clone()),
            last_error_code: note.code.clone(),
            unknown_retried: note.unknown_code,
            status: RetryStatus::Pending,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO retry_queue (
                id, tenant_id, invoice_id, attempt_count, next_retry_at, last_error,
                last_error_code, unknown_retried, status, claimed_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.tenant_id)
        .bind(&entry.invoice_id)
        .bind(entry.attempt_count)
        .bind(entry.next_retry_at)
        .bind(&entry.last_error)
        .bind(&entry.last_error_code)
        .bind(entry.unknown_retried)
        .bind(entry.status)
        .bind(entry.claimed_at)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match DbError::from(e) {
            err if err.is_unique_violation() => DbError::duplicate("retry_queue.invoice_id", invoice_id),
            err => err,
        })?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        info!(
            invoice_id = %invoice_id,
            next_retry_at = %next_retry_at,
            "Invoice queued for retry"
        );

        Ok(Some(entry))
    }

    /// Gets an entry by ID.
    pub async fn get(&self, id: &str) -> DbResult<Option<RetryQueueEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM retry_queue WHERE id = ?1");
        let entry = sqlx::query_as::<_, RetryQueueEntry>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// The invoice's pending or processing entry, if any.
    pub async fn active_for_invoice(&self, invoice_id: &str) -> DbResult<Option<RetryQueueEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM retry_queue
            WHERE invoice_id = ?1 AND status IN ('pending', 'processing')
            "#
        );
        let entry = sqlx::query_as::<_, RetryQueueEntry>(&sql)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// The invoice's most recently created entry, any status.
    pub async fn latest_for_invoice(&self, invoice_id: &str) -> DbResult<Option<RetryQueueEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM retry_queue
            WHERE invoice_id = ?1
            ORDER BY created_at DESC, updated_at DESC
            LIMIT 1
            "#
        );
        let entry = sqlx::query_as::<_, RetryQueueEntry>(&sql)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// Pending entries due at or before `now`, earliest first.
    pub async fn due(&self, now: DateTime<Utc>, limit: u32) -> DbResult<Vec<RetryQueueEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM retry_queue
            WHERE status = 'pending' AND next_retry_at <= ?1
            ORDER BY next_retry_at ASC
            LIMIT ?2
            "#
        );
        let entries = sqlx::query_as::<_, RetryQueueEntry>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    /// Atomically claims a due entry. `false` means skip it.
    pub async fn claim(&self, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE retry_queue SET status = 'processing', claimed_at = ?2, updated_at = ?2
            WHERE id = ?1 AND status = 'pending' AND next_retry_at <= ?2
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() == 1;
        debug!(entry_id = %id, claimed, "Claim attempt");
        Ok(claimed)
    }

    /// Returns a claimed entry to `pending` with a new attempt count and
    /// due time; mirrors the count onto the invoice.
    ///
    /// `entry` must carry the claim time. Returns `false`, writing nothing,
    /// if that claim is no longer held.
    pub async fn reschedule(
        &self,
        entry: &RetryQueueEntry,
        attempt: i64,
        next_retry_at: DateTime<Utc>,
        note: &FailureNote,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE retry_queue SET
                status = 'pending',
                attempt_count = ?2,
                next_retry_at = ?3,
                last_error = ?4,
                last_error_code = ?5,
                unknown_retried = unknown_retried OR ?6,
                claimed_at = NULL,
                updated_at = ?7
            WHERE id = ?1 AND status = 'processing' AND claimed_at = ?8
            "#,
        )
        .bind(&entry.id)
        .bind(attempt)
        .bind(next_retry_at)
        .bind(&note.message)
        .bind(&note.code)
        .bind(note.unknown_code)
        .bind(now)
        .bind(entry.claimed_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
            return Ok(false);
        }

        retry_with(&mut tx, &entry.invoice_id, Some(attempt), now).await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        Ok(true)
    }

    /// Confirms the invoice and completes the entry in one transaction.
    ///
    /// Returns whether the invoice row changed; `false` means it was
    /// already confirmed and the stored receipt data was kept.
    ///
    /// ## Errors
    /// `ClaimLost` if `entry`'s claim is no longer held; nothing is written.
    pub async fn complete(
        &self,
        entry: &RetryQueueEntry,
        confirmation: &Confirmation,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE retry_queue SET status = 'completed', claimed_at = NULL, updated_at = ?2
            WHERE id = ?1 AND status = 'processing' AND claimed_at = ?3
            "#,
        )
        .bind(&entry.id)
        .bind(now)
        .bind(entry.claimed_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
            return Err(DbError::ClaimLost {
                entry_id: entry.id.clone(),
            });
        }

        let confirmed = confirm_with(&mut tx, &entry.invoice_id, confirmation, now).await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        Ok(confirmed)
    }

    /// Fails the claimed entry and the invoice in one transaction.
    ///
    /// `attempts` is the entry's final attempt count.
    ///
    /// ## Errors
    /// `ClaimLost` if `entry`'s claim is no longer held; nothing is written.
    pub async fn fail(
        &self,
        entry: &RetryQueueEntry,
        attempts: i64,
        note: &FailureNote,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE retry_queue SET
                status = 'failed',
                attempt_count = ?2,
                last_error = ?3,
                last_error_code = ?4,
                unknown_retried = unknown_retried OR ?5,
                claimed_at = NULL,
                updated_at = ?6
            WHERE id = ?1 AND status = 'processing' AND claimed_at = ?7
            "#,
        )
        .bind(&entry.id)
        .bind(attempts)
        .bind(&note.message)
        .bind(&note.code)
        .bind(note.unknown_code)
        .bind(now)
        .bind(entry.claimed_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
            return Err(DbError::ClaimLost {
                entry_id: entry.id.clone(),
            });
        }

        let sql = format!(
            "UPDATE invoices SET retry_count = ?2 WHERE id = ?1 AND status IN {}",
            sources_sql(InvoiceStatus::Failed)
        );
        sqlx::query(&sql)
            .bind(&entry.invoice_id)
            .bind(attempts)
            .execute(&mut *tx)
            .await?;

        let failed = fail_with(&mut tx, &entry.invoice_id, &note.message, now).await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        Ok(failed)
    }

    /// Completes an entry whose invoice is already terminal.
    pub async fn close(&self, entry_id: &str, status: RetryStatus, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE retry_queue SET status = ?2, claimed_at = NULL, updated_at = ?3
            WHERE id = ?1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(entry_id)
        .bind(status)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns a claimed entry to `pending` unchanged (processing aborted
    /// before an attempt was made). `false` if the claim is no longer held.
    pub async fn release(&self, entry: &RetryQueueEntry, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE retry_queue SET status = 'pending', claimed_at = NULL, updated_at = ?2
            WHERE id = ?1 AND status = 'processing' AND claimed_at = ?3
            "#,
        )
        .bind(&entry.id)
        .bind(now)
        .bind(entry.claimed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Releases entries claimed before `claimed_before` (crashed workers).
    pub async fn release_stuck(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE retry_queue SET status = 'pending', claimed_at = NULL, updated_at = ?2
            WHERE status = 'processing' AND claimed_at < ?1
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Manual resync
    // =========================================================================

    /// Makes a pending entry due now. The attempt count is kept.
    pub async fn expedite(&self, entry_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE retry_queue SET next_retry_at = ?2, updated_at = ?2
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(entry_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Re-arms a failed invoice: `failed → retry`, and its latest failed
    /// entry goes back to `pending` due now (attempt count and unknown-code
    /// flag kept). With no
    /// prior entry a fresh one is created at attempt 0.
    ///
    /// Returns `None` if the invoice is not `failed`.
    pub async fn rearm_failed(
        &self,
        invoice_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Option<RetryQueueEntry>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let sql = format!(
            r#"
            UPDATE invoices SET status = 'retry', error_detail = NULL, updated_at = ?2
            WHERE id = ?1 AND status IN {}
            "#,
            reopenable_sql()
        );
        let reopened = sqlx::query(&sql)
            .bind(invoice_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        if reopened.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
            return Ok(None);
        }

        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM retry_queue
            WHERE invoice_id = ?1 AND status = 'failed'
            ORDER BY updated_at DESC
            LIMIT 1
            "#
        );
        let previous = sqlx::query_as::<_, RetryQueueEntry>(&sql)
            .bind(invoice_id)
            .fetch_optional(&mut *tx)
            .await?;

        let entry = match previous {
            Some(mut entry) => {
                sqlx::query(
                    r#"
                    UPDATE retry_queue SET
                        status = 'pending', next_retry_at = ?2, claimed_at = NULL, updated_at = ?2
                    WHERE id = ?1
                    "#,
                )
                .bind(&entry.id)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                entry.status = RetryStatus::Pending;
                entry.next_retry_at = now;
                entry.claimed_at = None;
                entry.updated_at = now;
                entry
            }
            None => {
                let entry = RetryQueueEntry {
                    id: Uuid::new_v4().to_string(),
                    tenant_id: tenant_id.to_string(),
                    invoice_id: invoice_id.to_string(),
                    attempt_count: 0,
                    next_retry_at: now,
                    last_error: None,
                    last_error_code: None,
                    unknown_retried: false,
                    status: RetryStatus::Pending,
                    claimed_at: None,
                    created_at: now,
                    updated_at: now,
                };
                sqlx::query(
                    r#"
                    INSERT INTO retry_queue (
                        id, tenant_id, invoice_id, attempt_count, next_retry_at, last_error,
                        last_error_code, unknown_retried, status, claimed_at, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, 0, ?4, NULL, NULL, 0, 'pending', NULL, ?4, ?4)
                    "#,
                )
                .bind(&entry.id)
                .bind(&entry.tenant_id)
                .bind(&entry.invoice_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                entry
            }
        };

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        info!(invoice_id = %invoice_id, entry_id = %entry.id, "Failed invoice re-armed");
        Ok(Some(entry))
    }

    /// Counts entries per status.
    pub async fn count_by_status(&self) -> DbResult<Vec<(RetryStatus, i64)>> {
        let rows: Vec<(RetryStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM retry_queue GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
