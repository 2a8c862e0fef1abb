//! # Repository Module
//!
//! Database repository implementations, one per aggregate.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SubmissionService / RetryOrchestrator                                 │
//! │       │                                                                 │
//! │       │  db.retry_queue().claim(&entry.id, now)                        │
//! │       ▼                                                                 │
//! │  DeviceRepository      InvoiceRepository      RetryQueueRepository     │
//! │  ├── register          ├── insert_with_lines  ├── enqueue              │
//! │  ├── apply_init_result ├── mark_sent (CAS)    ├── due / claim (CAS)    │
//! │  ├── touch_last_sync   ├── confirm (CAS)      ├── reschedule / complete│
//! │  └── deregister        └── mark_failed (CAS)  └── fail / resync        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! │  Status changes are compare-and-set: `UPDATE … WHERE status IN (…)`.   │
//! │  Invoice lists come from the core transition table (`sources_sql`).    │
//! │  `rows_affected() == 1` means this caller won; 0 means someone else    │
//! │  already moved the row, and the caller must not proceed.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`device::DeviceRepository`] - Device registry
//! - [`invoice::InvoiceRepository`] - Invoices and their lines
//! - [`retry::RetryQueueRepository`] - Retry queue and cross-table transitions

use fiscal_core::state;
use fiscal_core::InvoiceStatus;

pub mod device;
pub mod invoice;
pub mod retry;

/// SQL list of the statuses an invoice may move to `to` from,
/// e.g. `('pending', 'sent', 'retry')` for `confirmed`.
pub(crate) fn sources_sql(to: InvoiceStatus) -> String {
    sql_list(&state::sources_of(to))
}

/// SQL list of the statuses a manual resync may reopen.
pub(crate) fn reopenable_sql() -> String {
    sql_list(&state::reopenable())
}

fn sql_list(statuses: &[InvoiceStatus]) -> String {
    let quoted: Vec<String> = statuses.iter().map(|s| format!("'{}'", s.as_str())).collect();
    format!("({})", quoted.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_follow_transition_table() {
        assert_eq!(sources_sql(InvoiceStatus::Sent), "('pending')");
        assert_eq!(sources_sql(InvoiceStatus::Confirmed), "('pending', 'sent', 'retry')");
        assert_eq!(sources_sql(InvoiceStatus::Failed), "('pending', 'sent', 'retry')");
        assert_eq!(sources_sql(InvoiceStatus::Retry), "('pending', 'sent', 'retry')");
        assert_eq!(reopenable_sql(), "('failed')");
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use fiscal_core::{
        DeviceClass, Invoice, InvoiceLine, InvoiceStatus, PaymentMethod, TaxCode, TransactionType,
    };
    use uuid::Uuid;

    use crate::{Database, DbConfig};

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    pub async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    /// Registers and activates a device; returns its id.
    pub async fn active_device(db: &Database, serial: &str) -> String {
        let device = db
            .devices()
            .register("tenant-1", "P051234567X", "00", serial, "Till", DeviceClass::Oscu, t0())
            .await
            .unwrap();
        db.devices()
            .apply_init_result(&device.id, Some("v1:cafe"), true, t0())
            .await
            .unwrap();
        device.id
    }

    /// A pending 2 × 500.00 @ 16% sale with one line.
    pub fn invoice(device_id: &str, number: &str) -> (Invoice, Vec<InvoiceLine>) {
        let id = Uuid::new_v4().to_string();
        let invoice = Invoice {
            id: id.clone(),
            tenant_id: "tenant-1".into(),
            device_id: device_id.into(),
            invoice_number: number.into(),
            receipt_number: None,
            total_amount_cents: 116_000,
            tax_amount_cents: 16_000,
            customer_reference: None,
            customer_name: None,
            payment_method: PaymentMethod::Cash,
            transaction_type: TransactionType::Sale,
            is_copy: false,
            original_receipt_number: None,
            status: InvoiceStatus::Pending,
            retry_count: 0,
            authority_signature: None,
            internal_data: None,
            qr_payload: None,
            error_detail: None,
            payload_checksum: Some("abc".into()),
            created_at: t0(),
            updated_at: t0(),
            confirmed_at: None,
        };
        let line = InvoiceLine {
            id: Uuid::new_v4().to_string(),
            invoice_id: id,
            line_number: 1,
            item_code: "SOAP-01".into(),
            item_name: "Bar Soap".into(),
            quantity: 2,
            unit_price_cents: 50_000,
            unit_of_measure: "pcs".into(),
            tax_code: TaxCode::A,
            tax_rate_bps: 1600,
            total_price_cents: 100_000,
            tax_amount_cents: 16_000,
        };
        (invoice, vec![line])
    }

    /// Inserts a pending invoice and returns its id.
    pub async fn pending_invoice(db: &Database, device_id: &str, number: &str) -> String {
        let (invoice, lines) = invoice(device_id, number);
        db.invoices().insert_with_lines(&invoice, &lines).await.unwrap();
        invoice.id
    }

    pub fn minutes(n: i64) -> Duration {
        Duration::minutes(n)
    }
}
