//! # fiscal-db: Database Layer for the Fiscal Gateway
//!
//! SQLite persistence for devices, invoices, invoice lines and the retry
//! queue, via sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Fiscal Gateway Data Flow                         │
//! │                                                                         │
//! │  SubmissionService / RetryOrchestrator (fiscal-gateway)                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     fiscal-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │  │   │
//! │  │   │               │    │ DeviceRepo     │   │              │  │   │
//! │  │   │ SqlitePool    │◄───│ InvoiceRepo    │   │ 001_initial_ │  │   │
//! │  │   │ WAL, FKs on   │    │ RetryQueueRepo │   │   schema.sql │  │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database file (path from [database] config)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fiscal_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("gateway.db")).await?;
//! let device = db.devices().get_by_serial("SN-001").await?;
//! let due = db.retry_queue().due(chrono::Utc::now(), 50).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::device::DeviceRepository;
pub use repository::invoice::{Confirmation, InvoiceRepository};
pub use repository::retry::{FailureNote, RetryQueueRepository};
