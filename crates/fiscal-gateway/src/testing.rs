//! Shared fixtures for the crate's tests: a wired service over an in-memory
//! database, sample invoices, and a scripted HTTP authority.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;

use fiscal_core::{
    Device, DeviceClass, NewInvoice, NewInvoiceLine, PaymentMethod, TaxCode, TenantContext,
    TransactionType,
};
use fiscal_db::{Database, DbConfig};

use crate::client::{
    AuthorityGateway, DeviceCredentials, DeviceInit, DeviceStatusReport, GatewayFailure,
    InitDeviceRequest, MockGateway, MockIdentityRegistry, Receipt, SignedSubmission,
};
use crate::config::EndpointPaths;
use crate::events::{ChannelSink, GatewayEvent};
use crate::secret::{SecretCipher, SecretKey};
use crate::service::{DeviceRegistration, SubmissionService};
use crate::signing::PayloadSigner;

pub(crate) const TIN: &str = "10001234567";
pub(crate) const SERIAL: &str = "OSCU001";
pub(crate) const TENANT: &str = "tenant-1";

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// One RSA key for the whole test binary; generation is slow.
pub(crate) fn test_signer() -> &'static PayloadSigner {
    static SIGNER: OnceLock<PayloadSigner> = OnceLock::new();
    SIGNER.get_or_init(|| PayloadSigner::generate(1024).unwrap())
}

pub(crate) fn test_cipher() -> SecretCipher {
    SecretCipher::new(&SecretKey::from_bytes([7u8; 32]))
}

/// A 2 × 500.00 sale at 16%: total 1160.00, tax 160.00.
pub(crate) fn sale(serial: &str, number: &str) -> NewInvoice {
    NewInvoice {
        device_serial: serial.to_string(),
        invoice_number: number.to_string(),
        customer_reference: None,
        customer_name: None,
        payment_method: PaymentMethod::Cash,
        transaction_type: TransactionType::Sale,
        is_copy: false,
        original_receipt_number: None,
        total_amount_cents: 116_000,
        tax_amount_cents: 16_000,
        lines: vec![NewInvoiceLine {
            item_code: "SOAP-01".to_string(),
            item_name: "Bar Soap".to_string(),
            quantity: 2,
            unit_price_cents: 50_000,
            unit_of_measure: "pcs".to_string(),
            tax_code: TaxCode::A,
            tax_rate_bps: 1600,
        }],
    }
}

pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// Harness
// =============================================================================

pub(crate) struct Harness {
    pub db: Arc<Database>,
    pub service: SubmissionService,
    pub events: mpsc::UnboundedReceiver<GatewayEvent>,
    pub device: Device,
}

/// Service over the mock authority with [`TIN`] registered and device
/// [`SERIAL`] activated at [`t0`].
pub(crate) async fn mock_harness() -> (Harness, Arc<MockGateway>) {
    let registry = Arc::new(MockIdentityRegistry::with_tins([TIN]));
    let mock = Arc::new(MockGateway::new(registry));
    let harness = harness_with(mock.clone()).await;
    (harness, mock)
}

pub(crate) async fn harness_with(gateway: Arc<dyn AuthorityGateway>) -> Harness {
    let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
    let (sink, events) = ChannelSink::new();
    let service = SubmissionService::new(db.clone(), gateway, Arc::new(test_signer().clone()))
        .with_cipher(test_cipher())
        .with_events(Arc::new(sink));

    let ctx = TenantContext::new(TENANT);
    let registration = DeviceRegistration {
        tin: TIN.to_string(),
        branch_id: "00".to_string(),
        serial_number: SERIAL.to_string(),
        name: "Till 1".to_string(),
        device_class: DeviceClass::Oscu,
    };
    service.register_device_at(&ctx, &registration, t0()).await.unwrap();
    let device = service.activate_device_at(&ctx, SERIAL, t0()).await.unwrap();

    Harness {
        db,
        service,
        events,
        device,
    }
}

/// Never answers.
pub(crate) struct StallingGateway;

#[async_trait]
impl AuthorityGateway for StallingGateway {
    fn name(&self) -> &'static str {
        "stalling"
    }

    async fn init_device(&self, _request: &InitDeviceRequest) -> Result<DeviceInit, GatewayFailure> {
        std::future::pending().await
    }

    async fn submit_invoice(&self, _submission: &SignedSubmission) -> Result<Receipt, GatewayFailure> {
        std::future::pending().await
    }

    async fn check_device_status(
        &self,
        _credentials: &DeviceCredentials,
    ) -> Result<DeviceStatusReport, GatewayFailure> {
        std::future::pending().await
    }
}

// =============================================================================
// Fake HTTP Authority
// =============================================================================

/// A scripted reply from [`FakeAuthority`].
#[derive(Debug, Clone)]
pub(crate) enum FakeReply {
    Json(u16, Value),
    Raw(u16, String),
    Delay(Duration, Box<FakeReply>),
}

impl FakeReply {
    /// A `000` receipt with a placeholder number.
    pub fn success() -> Self {
        Self::receipt("RCPT-SCRIPTED")
    }

    fn receipt(number: &str) -> Self {
        FakeReply::Json(
            200,
            json!({
                "resultCd": "000",
                "resultMsg": "It is succeeded",
                "data": {
                    "rcptNo": number,
                    "intrlData": format!("INTRL-{number}"),
                    "rcptSign": format!("SIGN-{number}"),
                    "qrCode": format!("QR-{number}"),
                }
            }),
        )
    }

    pub fn result_code(code: &str, message: &str) -> Self {
        FakeReply::Json(200, json!({ "resultCd": code, "resultMsg": message, "data": null }))
    }

    pub fn raw(status: u16, body: &str) -> Self {
        FakeReply::Raw(status, body.to_string())
    }

    pub fn delayed(delay: Duration, reply: FakeReply) -> Self {
        FakeReply::Delay(delay, Box::new(reply))
    }
}

/// A request the fake authority received.
#[derive(Debug, Clone)]
pub(crate) struct SeenRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

struct FakeState {
    paths: EndpointPaths,
    submit_script: Mutex<VecDeque<FakeReply>>,
    seen: Mutex<Vec<SeenRequest>>,
    receipts: AtomicUsize,
}

/// Authority stand-in on a random local port.
///
/// Unscripted submissions succeed with receipt numbers `RCPT-1`, `RCPT-2`, ...
pub(crate) struct FakeAuthority {
    pub base_url: String,
    state: Arc<FakeState>,
}

impl FakeAuthority {
    /// Key returned by every `InitDevice`.
    pub const DEVICE_KEY: &'static str = "fake-device-key";

    pub async fn start() -> Self {
        let state = Arc::new(FakeState {
            paths: EndpointPaths::default(),
            submit_script: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            receipts: AtomicUsize::new(0),
        });

        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        FakeAuthority {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    /// Queues the reply for the next unscripted submission.
    pub fn script_submit(&self, reply: FakeReply) {
        self.state.submit_script.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.state.seen.lock().unwrap().clone()
    }

    pub fn submissions(&self) -> usize {
        let path = &self.state.paths.submit_invoice;
        self.requests().iter().filter(|r| &r.path == path).count()
    }
}

async fn handle(
    State(state): State<Arc<FakeState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    state.seen.lock().unwrap().push(SeenRequest {
        path: path.clone(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    let mut reply = if path == state.paths.init_device {
        FakeReply::Json(
            200,
            json!({
                "resultCd": "000",
                "resultMsg": "initialized",
                "data": { "cmcKey": FakeAuthority::DEVICE_KEY }
            }),
        )
    } else if path == state.paths.submit_invoice {
        let scripted = state.submit_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            let n = state.receipts.fetch_add(1, Ordering::SeqCst) + 1;
            FakeReply::receipt(&format!("RCPT-{n}"))
        })
    } else if path == state.paths.device_status {
        FakeReply::Json(
            200,
            json!({
                "resultCd": "000",
                "data": { "status": "active", "lastActivity": "20240301120000" }
            }),
        )
    } else {
        FakeReply::raw(404, "no such endpoint")
    };

    loop {
        match reply {
            FakeReply::Delay(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }
            FakeReply::Json(status, value) => {
                return (status_code(status), Json(value)).into_response();
            }
            FakeReply::Raw(status, text) => {
                return (status_code(status), text).into_response();
            }
        }
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
