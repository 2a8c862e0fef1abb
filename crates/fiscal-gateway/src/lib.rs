//! # fiscal-gateway: Authority Submission & Retry Reconciliation
//!
//! Takes invoices from the point of sale to a tax-authority receipt, and
//! keeps trying when the authority cannot be reached.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Fiscal Gateway Architecture                      │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  SubmissionService (service.rs)                  │  │
//! │  │                                                                  │  │
//! │  │  RegisterDevice / ActivateDevice / RefreshDeviceStatus          │  │
//! │  │  CreateInvoice ── validate ─ guard ─ persist ─ sign ─ submit    │  │
//! │  │  ResyncInvoice                                                   │  │
//! │  └──────────────┬─────────────────────────────────┬─────────────────┘  │
//! │                 │                                 │                     │
//! │                 ▼                                 ▼                     │
//! │  ┌────────────────────────────┐   ┌────────────────────────────────┐   │
//! │  │  AuthorityGateway (client/)│   │  RetryOrchestrator             │   │
//! │  │                            │   │  (orchestrator.rs)             │   │
//! │  │  MockGateway  in-process   │◄──│                                │   │
//! │  │  LiveGateway  reqwest+audit│   │  claim due ─ re-deliver ─      │   │
//! │  │                            │   │  reschedule / fail / complete  │   │
//! │  └────────────────────────────┘   │  RetryScheduler: poll loop     │   │
//! │                                   └────────────────────────────────┘   │
//! │                                                                         │
//! │  Supporting modules:                                                   │
//! │  • signing  RSA-PSS payload signatures, HMAC payload checksums         │
//! │  • secret   AES-256-GCM device secrets at rest                         │
//! │  • codes    result code → retryability table                           │
//! │  • events   confirmations, failures, admin alerts                      │
//! │  • audit    one record per live authority call                         │
//! │  • config   TOML file + FISCAL_* environment overrides                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fiscal_gateway::{GatewayConfig, RetryOrchestrator, RetryScheduler, SubmissionService};
//!
//! let config = GatewayConfig::load(None)?;
//! let service = SubmissionService::from_config(db, gateway, signer, &config);
//!
//! let result = service.create_invoice(&ctx, new_invoice).await?;
//!
//! let orchestrator = RetryOrchestrator::from_config(service, &config);
//! let (scheduler, handle) = RetryScheduler::new(orchestrator, config.poll_interval());
//! tokio::spawn(scheduler.run());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod audit;
pub mod client;
pub mod codes;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod secret;
pub mod service;
pub mod signing;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use audit::{AuditLog, AuditRecord, MemoryAuditLog, TracingAuditLog};
pub use client::{
    AuthorityGateway, FailureKind, GatewayFailure, LiveGateway, MockGateway, MockIdentityRegistry,
    Receipt,
};
pub use codes::Retryability;
pub use config::{AuthorityMode, GatewayConfig};
pub use error::{GatewayError, GatewayResult};
pub use events::{AdminAlert, ChannelSink, EventSink, GatewayEvent, NoOpSink, TracingSink};
pub use orchestrator::{RecoverySummary, RetryOrchestrator, RetryScheduler, RunSummary, SchedulerHandle};
pub use secret::{SecretCipher, SecretKey};
pub use service::{
    DeviceRegistration, InvoiceResult, ResyncOutcome, SubmissionOutcome, SubmissionService,
};
pub use signing::PayloadSigner;
