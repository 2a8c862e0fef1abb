//! # Invoice Repository
//!
//! Invoices, their lines, and compare-and-set status changes.
//!
//! ## Write Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  insert_with_lines   one transaction: invoice row + every line row     │
//! │                      UNIQUE (device_id, invoice_number)                 │
//! │                                                                         │
//! │  mark_sent           pending            ──► sent                        │
//! │  confirm             pending|sent|retry ──► confirmed  (+ receipt data) │
//! │  mark_failed         pending|sent|retry ──► failed     (+ error detail) │
//! │  mark_retry          pending|sent|retry ──► retry                       │
//! │                                                                         │
//! │  Each returns `true` only if this call changed the row. A `false`       │
//! │  from `confirm` on an already-confirmed invoice is the idempotent       │
//! │  no-op: the original receipt data stays untouched.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use super::sources_sql;
use crate::error::{DbError, DbResult};
use fiscal_core::{Invoice, InvoiceLine, InvoiceStatus};

pub(crate) const INVOICE_COLUMNS: &str = r#"
    id, tenant_id, device_id, invoice_number, receipt_number,
    total_amount_cents, tax_amount_cents, customer_reference, customer_name,
    payment_method, transaction_type, is_copy, original_receipt_number,
    status, retry_count, authority_signature, internal_data, qr_payload,
    error_detail, payload_checksum, created_at, updated_at, confirmed_at
"#;

const LINE_COLUMNS: &str = r#"
    id, invoice_id, line_number, item_code, item_name, quantity, unit_price_cents,
    unit_of_measure, tax_code, tax_rate_bps, total_price_cents, tax_amount_cents
"#;

/// Authority data written by a confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub receipt_number: String,
    pub signature: String,
    pub internal_data: String,
    pub qr_payload: Option<String>,
}

/// Repository for invoice database operations.
#[derive(Debug, Clone)]
pub struct InvoiceRepository {
    pool: SqlitePool,
}

impl InvoiceRepository {
    /// Creates a new InvoiceRepository.
    pub fn new(pool: SqlitePool) -> Self {
        InvoiceRepository { pool }
    }

    /// Inserts an invoice and its lines atomically.
    ///
    /// ## Errors
    /// `UniqueViolation { field: "invoice_number" }` when the device already
    /// has an invoice with this number.
    pub async fn insert_with_lines(&self, invoice: &Invoice, lines: &[InvoiceLine]) -> DbResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, tenant_id, device_id, invoice_number, receipt_number,
                total_amount_cents, tax_amount_cents, customer_reference, customer_name,
                payment_method, transaction_type, is_copy, original_receipt_number,
                status, retry_count, authority_signature, internal_data, qr_payload,
                error_detail, payload_checksum, created_at, updated_at, confirmed_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23
            )
            "#,
        )
        .bind(&invoice.id)
        .bind(&invoice.tenant_id)
        .bind(&invoice.device_id)
        .bind(&invoice.invoice_number)
        .bind(&invoice.receipt_number)
        .bind(invoice.total_amount_cents)
        .bind(invoice.tax_amount_cents)
        .bind(&invoice.customer_reference)
        .bind(&invoice.customer_name)
        .bind(invoice.payment_method)
        .bind(invoice.transaction_type)
        .bind(invoice.is_copy)
        .bind(&invoice.original_receipt_number)
        .bind(invoice.status)
        .bind(invoice.retry_count)
        .bind(&invoice.authority_signature)
        .bind(&invoice.internal_data)
        .bind(&invoice.qr_payload)
        .bind(&invoice.error_detail)
        .bind(&invoice.payload_checksum)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .bind(invoice.confirmed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match DbError::from(e) {
            err if err.is_unique_violation() => {
                DbError::duplicate("invoice_number", &invoice.invoice_number)
            }
            err => err,
        })?;

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO invoice_lines (
                    id, invoice_id, line_number, item_code, item_name, quantity, unit_price_cents,
                    unit_of_measure, tax_code, tax_rate_bps, total_price_cents, tax_amount_cents
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(&line.id)
            .bind(&invoice.id)
            .bind(line.line_number)
            .bind(&line.item_code)
            .bind(&line.item_name)
            .bind(line.quantity)
            .bind(line.unit_price_cents)
            .bind(&line.unit_of_measure)
            .bind(line.tax_code)
            .bind(line.tax_rate_bps)
            .bind(line.total_price_cents)
            .bind(line.tax_amount_cents)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(
            invoice_id = %invoice.id,
            invoice_number = %invoice.invoice_number,
            lines = lines.len(),
            "Invoice stored"
        );

        Ok(())
    }

    /// Gets an invoice by ID.
    pub async fn get(&self, id: &str) -> DbResult<Option<Invoice>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1");
        let invoice = sqlx::query_as::<_, Invoice>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(invoice)
    }

    /// Finds a device's invoice by its number.
    pub async fn find_by_number(
        &self,
        device_id: &str,
        invoice_number: &str,
    ) -> DbResult<Option<Invoice>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE device_id = ?1 AND invoice_number = ?2"
        );
        let invoice = sqlx::query_as::<_, Invoice>(&sql)
            .bind(device_id)
            .bind(invoice_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(invoice)
    }

    /// Gets an invoice's lines in line order.
    pub async fn get_lines(&self, invoice_id: &str) -> DbResult<Vec<InvoiceLine>> {
        let sql = format!(
            "SELECT {LINE_COLUMNS} FROM invoice_lines WHERE invoice_id = ?1 ORDER BY line_number ASC"
        );
        let lines = sqlx::query_as::<_, InvoiceLine>(&sql)
            .bind(invoice_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(lines)
    }

    /// Lists invoices in a status, oldest first.
    pub async fn list_by_status(&self, status: InvoiceStatus, limit: u32) -> DbResult<Vec<Invoice>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2"
        );
        let invoices = sqlx::query_as::<_, Invoice>(&sql)
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(invoices)
    }

    /// Invoices left in `sent` since before `older_than` (crashed mid-call).
    pub async fn find_stalled_sent(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<Invoice>> {
        let sql = format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE status = 'sent' AND updated_at < ?1
            ORDER BY updated_at ASC
            LIMIT ?2
            "#
        );
        let invoices = sqlx::query_as::<_, Invoice>(&sql)
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(invoices)
    }

    /// Counts invoices per status.
    pub async fn count_by_status(&self) -> DbResult<Vec<(InvoiceStatus, i64)>> {
        let rows: Vec<(InvoiceStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM invoices GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // =========================================================================
    // Compare-and-set transitions
    // =========================================================================

    /// `pending → sent`, immediately before the synchronous gateway call.
    pub async fn mark_sent(&self, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let sql = format!(
            "UPDATE invoices SET status = 'sent', updated_at = ?2 WHERE id = ?1 AND status IN {}",
            sources_sql(InvoiceStatus::Sent)
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Writes the authority fields and moves to `confirmed`.
    ///
    /// Returns `false` (and writes nothing) if the invoice is already
    /// confirmed or failed.
    pub async fn confirm(
        &self,
        id: &str,
        confirmation: &Confirmation,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        confirm_with(&mut conn, id, confirmation, now).await
    }

    /// Moves a live invoice to `failed` with a reason.
    pub async fn mark_failed(&self, id: &str, detail: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        fail_with(&mut conn, id, detail, now).await
    }

    /// Moves a live invoice to `retry`.
    pub async fn mark_retry(&self, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        retry_with(&mut conn, id, None, now).await
    }
}

// =============================================================================
// Connection-level transitions (shared with the retry queue transactions)
// =============================================================================

pub(crate) async fn confirm_with(
    conn: &mut SqliteConnection,
    id: &str,
    confirmation: &Confirmation,
    now: DateTime<Utc>,
) -> DbResult<bool> {
    let sql = format!(
        r#"
        UPDATE invoices SET
            status = 'confirmed',
            receipt_number = ?2,
            authority_signature = ?3,
            internal_data = ?4,
            qr_payload = ?5,
            error_detail = NULL,
            confirmed_at = ?6,
            updated_at = ?6
        WHERE id = ?1 AND status IN {}
        "#,
        sources_sql(InvoiceStatus::Confirmed)
    );
    let result = sqlx::query(&sql)
        .bind(id)
        .bind(&confirmation.receipt_number)
        .bind(&confirmation.signature)
        .bind(&confirmation.internal_data)
        .bind(&confirmation.qr_payload)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

pub(crate) async fn fail_with(
    conn: &mut SqliteConnection,
    id: &str,
    detail: &str,
    now: DateTime<Utc>,
) -> DbResult<bool> {
    let sql = format!(
        r#"
        UPDATE invoices SET status = 'failed', error_detail = ?2, updated_at = ?3
        WHERE id = ?1 AND status IN {}
        "#,
        sources_sql(InvoiceStatus::Failed)
    );
    let result = sqlx::query(&sql)
        .bind(id)
        .bind(detail)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// `retry_count` is left alone when `None`.
pub(crate) async fn retry_with(
    conn: &mut SqliteConnection,
    id: &str,
    retry_count: Option<i64>,
    now: DateTime<Utc>,
) -> DbResult<bool> {
    let sql = format!(
        r#"
        UPDATE invoices SET
            status = 'retry',
            retry_count = COALESCE(?2, retry_count),
            updated_at = ?3
        WHERE id = ?1 AND status IN {}
        "#,
        sources_sql(InvoiceStatus::Retry)
    );
    let result = sqlx::query(&sql)
        .bind(id)
        .bind(retry_count)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}
