//! # Gateway Audit Log
//!
//! Every live authority call produces one [`AuditRecord`]. Where records go
//! is up to the [`AuditLog`] implementation; the default writes a
//! structured `tracing` event on the `fiscal::audit` target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

/// One authority call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// "init_device", "submit_invoice", "check_device_status".
    pub operation: String,
    pub serial_number: String,
    pub url: String,
    pub request_body: String,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub latency_ms: u64,
    /// Result code on success, failure detail otherwise.
    pub outcome: String,
    pub success: bool,
    pub at: DateTime<Utc>,
}

/// Sink for audit records.
pub trait AuditLog: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Writes each record as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, record: AuditRecord) {
        info!(
            target: "fiscal::audit",
            operation = %record.operation,
            serial = %record.serial_number,
            url = %record.url,
            status = ?record.response_status,
            latency_ms = record.latency_ms,
            success = record.success,
            outcome = %record.outcome,
            request = %record.request_body,
            response = ?record.response_body,
            "Authority call"
        );
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditLog for MemoryAuditLog {
    fn record(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}
