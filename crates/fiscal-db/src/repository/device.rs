//! # Device Repository
//!
//! Registry of sales control units.
//!
//! ## Device Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  register() ──► pending                                                │
//! │                    │                                                    │
//! │                    │ apply_init_result(success = true)                  │
//! │                    ▼                                                    │
//! │                  active, certified, last_sync = now, secret stored      │
//! │                    │            │                                       │
//! │   touch_last_sync ─┘            │ deregister()                          │
//! │                                 ▼                                       │
//! │                              inactive (row kept, deregistered_at set)   │
//! │                                                                         │
//! │  apply_init_result(success = false) ──► failed (row kept)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The secret column only ever receives ciphertext produced by the
//! gateway's secret cipher.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use fiscal_core::{Device, DeviceClass, DeviceStatus};

const DEVICE_COLUMNS: &str = r#"
    id, tenant_id, tin, branch_id, serial_number, name, device_class, status,
    is_certified, last_sync_at, encrypted_secret, created_at, updated_at, deregistered_at
"#;

/// Repository for device database operations.
#[derive(Debug, Clone)]
pub struct DeviceRepository {
    pool: SqlitePool,
}

impl DeviceRepository {
    /// Creates a new DeviceRepository.
    pub fn new(pool: SqlitePool) -> Self {
        DeviceRepository { pool }
    }

    /// Registers a device in `pending` status.
    ///
    /// ## Errors
    /// `UniqueViolation { field: "serial_number" }` if the serial is taken.
    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        tenant_id: &str,
        tin: &str,
        branch_id: &str,
        serial_number: &str,
        name: &str,
        device_class: DeviceClass,
        now: DateTime<Utc>,
    ) -> DbResult<Device> {
        let device = Device {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            tin: tin.to_string(),
            branch_id: branch_id.to_string(),
            serial_number: serial_number.to_string(),
            name: name.to_string(),
            device_class,
            status: DeviceStatus::Pending,
            is_certified: false,
            last_sync_at: None,
            encrypted_secret: None,
            created_at: now,
            updated_at: now,
            deregistered_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO devices (
                id, tenant_id, tin, branch_id, serial_number, name, device_class, status,
                is_certified, last_sync_at, encrypted_secret, created_at, updated_at, deregistered_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&device.id)
        .bind(&device.tenant_id)
        .bind(&device.tin)
        .bind(&device.branch_id)
        .bind(&device.serial_number)
        .bind(&device.name)
        .bind(device.device_class)
        .bind(device.status)
        .bind(device.is_certified)
        .bind(device.last_sync_at)
        .bind(&device.encrypted_secret)
        .bind(device.created_at)
        .bind(device.updated_at)
        .bind(device.deregistered_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            err if err.is_unique_violation() => DbError::duplicate("serial_number", serial_number),
            err => err,
        })?;

        info!(serial = %serial_number, tenant = %tenant_id, "Device registered");
        Ok(device)
    }

    /// Gets a device by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1");
        let device = sqlx::query_as::<_, Device>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    /// Gets a device by serial number.
    pub async fn get_by_serial(&self, serial_number: &str) -> DbResult<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE serial_number = ?1");
        let device = sqlx::query_as::<_, Device>(&sql)
            .bind(serial_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    /// Lists a tenant's devices, deregistered ones included.
    pub async fn list_by_tenant(&self, tenant_id: &str) -> DbResult<Vec<Device>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE tenant_id = ?1 ORDER BY created_at ASC"
        );
        let devices = sqlx::query_as::<_, Device>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(devices)
    }

    /// Records the outcome of an authority `InitDevice` call.
    ///
    /// ## Success
    /// status `active`, certified, `last_sync_at = now`, secret replaced,
    /// any deregistration cleared.
    ///
    /// ## Failure
    /// status `failed`; secret and certification untouched.
    pub async fn apply_init_result(
        &self,
        device_id: &str,
        encrypted_secret: Option<&str>,
        success: bool,
        now: DateTime<Utc>,
    ) -> DbResult<Device> {
        let result = if success {
            sqlx::query(
                r#"
                UPDATE devices SET
                    status = 'active',
                    is_certified = 1,
                    last_sync_at = ?2,
                    encrypted_secret = ?3,
                    deregistered_at = NULL,
                    updated_at = ?2
                WHERE id = ?1
                "#,
            )
            .bind(device_id)
            .bind(now)
            .bind(encrypted_secret)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE devices SET status = 'failed', updated_at = ?2 WHERE id = ?1")
                .bind(device_id)
                .bind(now)
                .execute(&self.pool)
                .await?
        };

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Device", device_id));
        }

        debug!(device_id = %device_id, success, "Init result applied");

        self.get_by_id(device_id)
            .await?
            .ok_or_else(|| DbError::not_found("Device", device_id))
    }

    /// Records a successful authority contact.
    ///
    /// Never moves `last_sync_at` backwards.
    pub async fn touch_last_sync(&self, device_id: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE devices SET last_sync_at = ?2, updated_at = ?2
            WHERE id = ?1 AND (last_sync_at IS NULL OR last_sync_at < ?2)
            "#,
        )
        .bind(device_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Sets the device status reported by the authority.
    pub async fn update_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query("UPDATE devices SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(device_id)
            .bind(status)
            .bind(now)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Device", device_id));
        }
        Ok(())
    }

    /// Soft-deregisters a device: status `inactive`, row and history kept.
    pub async fn deregister(&self, device_id: &str, now: DateTime<Utc>) -> DbResult<Device> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET status = 'inactive', deregistered_at = ?2, updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(device_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Device", device_id));
        }

        info!(device_id = %device_id, "Device deregistered");

        self.get_by_id(device_id)
            .await?
            .ok_or_else(|| DbError::not_found("Device", device_id))
    }
}
