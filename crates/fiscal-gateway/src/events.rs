//! # Gateway Events
//!
//! Outcomes the rest of the system may want to react to: confirmations,
//! terminal failures, and alerts that need a human.
//!
//! ```text
//! SubmissionService ──┐
//!                     ├──► EventSink::emit(&GatewayEvent)
//! RetryOrchestrator ──┘        │
//!                              ├── NoOpSink
//!                              ├── TracingSink   (structured log lines)
//!                              └── ChannelSink   (tokio mpsc, for embedders and tests)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

// =============================================================================
// Events
// =============================================================================

/// Something that needs an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum AdminAlert {
    /// An invoice used up its retry attempts.
    RetryExhausted {
        invoice_id: String,
        tenant_id: String,
        attempts: i64,
        last_error: String,
    },
    /// A device keeps getting permanent rejections.
    RepeatedPermanentFailures {
        device_id: String,
        serial_number: String,
        consecutive: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    InvoiceConfirmed {
        invoice_id: String,
        tenant_id: String,
        receipt_number: String,
    },
    InvoiceFailed {
        invoice_id: String,
        tenant_id: String,
        error: String,
    },
    AdminAlert(AdminAlert),
}

// =============================================================================
// Sinks
// =============================================================================

/// Receiver of gateway events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &GatewayEvent);
}

/// Drops every event.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: &GatewayEvent) {}
}

/// Logs every event on the `fiscal::events` target.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::InvoiceConfirmed {
                invoice_id,
                receipt_number,
                ..
            } => info!(target: "fiscal::events", %invoice_id, %receipt_number, "Invoice confirmed"),
            GatewayEvent::InvoiceFailed {
                invoice_id, error, ..
            } => warn!(target: "fiscal::events", %invoice_id, %error, "Invoice failed"),
            GatewayEvent::AdminAlert(alert) => {
                error!(target: "fiscal::events", ?alert, "Admin alert")
            }
        }
    }
}

/// Forwards events into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &GatewayEvent) {
        // A dropped receiver just means nobody is listening
        let _ = self.tx.send(event.clone());
    }
}

// =============================================================================
// Permanent Failure Tracker
// =============================================================================

/// Counts consecutive permanent rejections per device.
#[derive(Debug)]
pub struct PermanentFailureTracker {
    threshold: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl PermanentFailureTracker {
    pub fn new(threshold: u32) -> Self {
        PermanentFailureTracker {
            threshold: threshold.max(1),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Records a permanent rejection. Returns the streak length when it
    /// reaches the threshold; the streak then starts over.
    pub fn record_permanent(&self, device_id: &str) -> Option<u32> {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(device_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            let reached = *count;
            counts.remove(device_id);
            Some(reached)
        } else {
            None
        }
    }

    pub fn record_success(&self, device_id: &str) {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id);
    }
}
