//! # Mock Authority Gateway
//!
//! In-process stand-in for the authority, used by tests and demo
//! environments. No network I/O.
//!
//! ## Behaviour
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  MockIdentityRegistry (injected, one per test / run)                    │
//! │    register("10001234567")                                              │
//! │                                                                         │
//! │  init_device      TIN not registered ──► Unregistered (permanent)       │
//! │                   otherwise          ──► secret = sha256(tin:serial)    │
//! │                                                                         │
//! │  submit_invoice   TIN not registered ──► Unregistered (permanent)       │
//! │                   wrong device key   ──► Rejected 901 (permanent)       │
//! │                   (tin, number) seen ──► the original Receipt again     │
//! │                   otherwise          ──► Receipt derived from inputs    │
//! │                                          and the submission timestamp   │
//! │                                                                         │
//! │  script_failure(f) queues failures returned by the next submissions.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use fiscal_core::{DeviceStatus, RESULT_SUCCESS};

use super::{
    AuthorityGateway, DeviceCredentials, DeviceInit, DeviceStatusReport, GatewayFailure,
    InitDeviceRequest, Receipt, SignedSubmission,
};

/// Result code the mock uses for a device key that does not match.
const INVALID_KEY_CODE: &str = "901";

// =============================================================================
// Identity Registry
// =============================================================================

/// The set of taxpayer identities the mock authority knows about.
#[derive(Debug, Default)]
pub struct MockIdentityRegistry {
    tins: RwLock<HashSet<String>>,
}

impl MockIdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tins<I, S>(tins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for tin in tins {
            registry.register(tin);
        }
        registry
    }

    pub fn register(&self, tin: impl Into<String>) {
        self.tins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tin.into());
    }

    pub fn unregister(&self, tin: &str) -> bool {
        self.tins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tin)
    }

    pub fn is_registered(&self, tin: &str) -> bool {
        self.tins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(tin)
    }
}

/// Device key the mock issues for `(tin, serial)`.
pub fn derive_secret(tin: &str, serial_number: &str) -> String {
    let digest = Sha256::digest(format!("{tin}:{serial_number}").as_bytes());
    hex::encode(&digest[..16])
}

// =============================================================================
// Mock Gateway
// =============================================================================

pub struct MockGateway {
    registry: Arc<MockIdentityRegistry>,
    issued: Mutex<HashMap<(String, String), Receipt>>,
    scripted: Mutex<VecDeque<GatewayFailure>>,
    submissions: AtomicUsize,
}

impl MockGateway {
    pub fn new(registry: Arc<MockIdentityRegistry>) -> Self {
        MockGateway {
            registry,
            issued: Mutex::new(HashMap::new()),
            scripted: Mutex::new(VecDeque::new()),
            submissions: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<MockIdentityRegistry> {
        &self.registry
    }

    /// Makes the next `submit_invoice` call fail with `failure`. Calls
    /// queue up in order.
    pub fn script_failure(&self, failure: GatewayFailure) {
        self.scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(failure);
    }

    /// Number of `submit_invoice` calls so far.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    fn require_registered(&self, tin: &str) -> Result<(), GatewayFailure> {
        if self.registry.is_registered(tin) {
            Ok(())
        } else {
            Err(GatewayFailure::unregistered(format!(
                "identity not registered: {tin}"
            )))
        }
    }

    fn synthesize_receipt(submission: &SignedSubmission) -> Receipt {
        let creds = &submission.credentials;
        let number_digest = Sha256::digest(
            format!("{}:{}:{}", creds.tin, creds.serial_number, submission.invoice_number).as_bytes(),
        );
        let receipt_number = format!("RC{}", hex::encode_upper(&number_digest[..6]));

        let data_digest = Sha256::digest(
            format!(
                "{}|{}|{}",
                submission.payload_json, submission.signature, submission.timestamp
            )
            .as_bytes(),
        );
        let internal_data = hex::encode_upper(&data_digest[..16]);

        let sig_digest = Sha256::digest(
            format!("{}|{}|{}", creds.device_key, internal_data, submission.timestamp).as_bytes(),
        );
        let signature = hex::encode_upper(&sig_digest[..16]);

        Receipt {
            qr_payload: Some(format!(
                "{}|{}|{}|{}",
                creds.tin, creds.branch_id, receipt_number, submission.timestamp
            )),
            receipt_number,
            internal_data,
            signature,
            result_code: RESULT_SUCCESS.to_string(),
        }
    }
}

#[async_trait]
impl AuthorityGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn init_device(&self, request: &InitDeviceRequest) -> Result<DeviceInit, GatewayFailure> {
        self.require_registered(&request.tin)?;

        debug!(tin = %request.tin, serial = %request.serial_number, "Mock device init");

        Ok(DeviceInit {
            secret: derive_secret(&request.tin, &request.serial_number),
            result_code: RESULT_SUCCESS.to_string(),
            message: Some("device initialized".to_string()),
        })
    }

    async fn submit_invoice(&self, submission: &SignedSubmission) -> Result<Receipt, GatewayFailure> {
        self.submissions.fetch_add(1, Ordering::SeqCst);

        if let Some(failure) = self
            .scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(failure);
        }

        let creds = &submission.credentials;
        self.require_registered(&creds.tin)?;

        if creds.device_key != derive_secret(&creds.tin, &creds.serial_number) {
            return Err(GatewayFailure::rejected(INVALID_KEY_CODE, "invalid device key"));
        }

        let key = (creds.tin.clone(), submission.invoice_number.clone());
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        let receipt = issued
            .entry(key)
            .or_insert_with(|| Self::synthesize_receipt(submission))
            .clone();

        debug!(
            invoice_number = %submission.invoice_number,
            receipt_number = %receipt.receipt_number,
            "Mock invoice accepted"
        );

        Ok(receipt)
    }

    async fn check_device_status(
        &self,
        credentials: &DeviceCredentials,
    ) -> Result<DeviceStatusReport, GatewayFailure> {
        self.require_registered(&credentials.tin)?;
        Ok(DeviceStatusReport {
            status: DeviceStatus::Active,
            last_activity: Some(Utc::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::Retryability;
    use crate::client::FailureKind;

    fn gateway(tins: &[&str]) -> MockGateway {
        MockGateway::new(Arc::new(MockIdentityRegistry::with_tins(tins.iter().copied())))
    }

    fn submission(tin: &str, number: &str, timestamp: &str) -> SignedSubmission {
        SignedSubmission {
            credentials: DeviceCredentials {
                tin: tin.into(),
                branch_id: "00".into(),
                serial_number: "OSCU001".into(),
                device_key: derive_secret(tin, "OSCU001"),
            },
            invoice_number: number.into(),
            payload_json: "{}".into(),
            signature: "abcd".into(),
            timestamp: timestamp.into(),
        }
    }

    fn init_request(tin: &str) -> InitDeviceRequest {
        InitDeviceRequest {
            tin: tin.into(),
            branch_id: "00".into(),
            serial_number: "OSCU001".into(),
            device_name: "Till".into(),
        }
    }

    #[tokio::test]
    async fn test_unregistered_identity_fails_closed() {
        let mock = gateway(&[]);

        let err = mock.init_device(&init_request("10001234567")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Unregistered);
        assert_eq!(err.retryability, Retryability::Permanent);

        let err = mock
            .submit_invoice(&submission("10001234567", "INV-1", "20240301120000"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Unregistered);
    }

    #[tokio::test]
    async fn test_init_secret_is_deterministic() {
        let mock = gateway(&["10001234567"]);
        let a = mock.init_device(&init_request("10001234567")).await.unwrap();
        let b = mock.init_device(&init_request("10001234567")).await.unwrap();
        assert_eq!(a.secret, b.secret);
        assert_eq!(a.secret, derive_secret("10001234567", "OSCU001"));
        assert_ne!(a.secret, derive_secret("10001234567", "OSCU002"));
    }

    #[tokio::test]
    async fn test_resubmission_returns_original_receipt() {
        let mock = gateway(&["10001234567"]);
        let first = mock
            .submit_invoice(&submission("10001234567", "INV-1", "20240301120000"))
            .await
            .unwrap();
        let second = mock
            .submit_invoice(&submission("10001234567", "INV-1", "20240301130000"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert!(!first.receipt_number.is_empty());
        assert_eq!(mock.submissions(), 2);

        let other = mock
            .submit_invoice(&submission("10001234567", "INV-2", "20240301120000"))
            .await
            .unwrap();
        assert_ne!(other.receipt_number, first.receipt_number);
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let mock = gateway(&["10001234567"]);
        let mut sub = submission("10001234567", "INV-1", "t");
        sub.credentials.device_key = "forged".into();

        let err = mock.submit_invoice(&sub).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("901"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_scripted_failures_come_first() {
        let mock = gateway(&["10001234567"]);
        mock.script_failure(GatewayFailure::timeout("scripted"));

        let sub = submission("10001234567", "INV-1", "t");
        assert_eq!(mock.submit_invoice(&sub).await.unwrap_err().kind, FailureKind::Timeout);
        assert!(mock.submit_invoice(&sub).await.is_ok());
    }

    #[tokio::test]
    async fn test_registries_are_isolated() {
        let a = gateway(&["111"]);
        let b = gateway(&[]);
        assert!(a.registry().is_registered("111"));
        assert!(!b.registry().is_registered("111"));

        a.registry().unregister("111");
        assert!(a.init_device(&init_request("111")).await.is_err());
    }
}
