//! # Live Authority Gateway
//!
//! HTTP client for the authority's JSON API.
//!
//! ## Wire Format
//! ```text
//! POST {base}{path}
//!   X-Device-Serial: OSCU001
//!   X-Device-Key:    <device secret>        (submit, status)
//!   X-Timestamp:     20240301120000
//!   X-Signature:     <hex RSA-PSS>          (submit)
//!   body:            canonical payload JSON (submit) or identity JSON
//!
//! 200 { "resultCd": "000", "resultMsg": "...", "resultDt": "...", "data": {...} }
//! ```
//!
//! ## Failure Mapping
//! ```text
//! timeout            ──► Timeout      retryable
//! connect / send     ──► Connection   retryable
//! HTTP 429, 5xx      ──► HttpStatus   retryable
//! other HTTP 4xx     ──► HttpStatus   permanent
//! 2xx, bad body      ──► Decode       retryable
//! resultCd != "000"  ──► Rejected     per code table
//! ```
//!
//! Every call is written to the [`AuditLog`]. Device keys sent in headers
//! are not recorded, and the key issued by `InitDevice` is masked in the
//! recorded response body.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

use fiscal_core::payload::DATETIME_FORMAT;
use fiscal_core::{DeviceStatus, RESULT_SUCCESS};

use super::{
    AuthorityGateway, DeviceCredentials, DeviceInit, DeviceStatusReport, GatewayFailure,
    InitDeviceRequest, Receipt, SignedSubmission,
};
use crate::audit::{AuditLog, AuditRecord};
use crate::config::{AuthoritySettings, EndpointPaths};
use crate::error::{GatewayError, GatewayResult};

/// Response bodies longer than this are cut in failure messages.
const MAX_MESSAGE_LEN: usize = 256;

/// Response fields that carry a device secret.
const SECRET_FIELDS: [&str; 1] = ["cmcKey"];

/// Replaces the value of any [`SECRET_FIELDS`] entry.
const REDACTED: &str = "***";

// =============================================================================
// Response Envelope
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    result_cd: String,
    #[serde(default)]
    result_msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitData {
    cmc_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptData {
    rcpt_no: String,
    intrl_data: String,
    rcpt_sign: String,
    #[serde(default)]
    qr_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusData {
    status: DeviceStatus,
    #[serde(default)]
    last_activity: Option<String>,
}

/// What came back from one HTTP exchange, for the audit record.
struct Exchange<T> {
    result: Result<(String, T), GatewayFailure>,
    status: Option<u16>,
    body: Option<String>,
}

// =============================================================================
// Live Gateway
// =============================================================================

pub struct LiveGateway {
    client: Client,
    base_url: Url,
    paths: EndpointPaths,
    audit: Arc<dyn AuditLog>,
}

impl LiveGateway {
    pub fn new(
        base_url: Url,
        paths: EndpointPaths,
        timeout: Duration,
        audit: Arc<dyn AuditLog>,
    ) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(LiveGateway {
            client,
            base_url,
            paths,
            audit,
        })
    }

    pub fn from_settings(settings: &AuthoritySettings, audit: Arc<dyn AuditLog>) -> GatewayResult<Self> {
        let raw = settings.base_url.as_deref().ok_or_else(|| {
            GatewayError::InvalidConfig("authority.base_url is required in live mode".into())
        })?;
        Self::new(
            Url::parse(raw)?,
            settings.paths.clone(),
            Duration::from_secs(settings.timeout_secs),
            audit,
        )
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Posts `body`, decodes the envelope, and audits the exchange.
    async fn call<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        serial_number: &str,
        path: &str,
        headers: &[(&'static str, &str)],
        body: String,
    ) -> Result<(String, T), GatewayFailure> {
        let url = self.endpoint(path);
        let started = Instant::now();

        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.clone());
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let exchange = Self::exchange::<T>(request).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (outcome, success) = match &exchange.result {
            Ok((code, _)) => (code.clone(), true),
            Err(failure) => (failure.detail(), false),
        };
        self.audit.record(AuditRecord {
            operation: operation.to_string(),
            serial_number: serial_number.to_string(),
            url,
            request_body: body,
            response_status: exchange.status,
            response_body: exchange.body.as_deref().map(redact_secrets),
            latency_ms,
            outcome,
            success,
            at: Utc::now(),
        });

        if let Err(failure) = &exchange.result {
            warn!(
                operation,
                serial = %serial_number,
                kind = ?failure.kind,
                retryability = %failure.retryability,
                latency_ms,
                "Authority call failed: {}",
                failure.detail()
            );
        } else {
            debug!(operation, serial = %serial_number, latency_ms, "Authority call succeeded");
        }

        exchange.result
    }

    async fn exchange<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Exchange<T> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Exchange {
                    result: Err(transport_failure(&e)),
                    status: None,
                    body: None,
                }
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return Exchange {
                    result: Err(transport_failure(&e)),
                    status: Some(status.as_u16()),
                    body: None,
                }
            }
        };

        let result = if !status.is_success() {
            Err(GatewayFailure::http_status(status.as_u16(), truncate(&text)))
        } else {
            decode_envelope::<T>(&text)
        };

        Exchange {
            result,
            status: Some(status.as_u16()),
            body: Some(text),
        }
    }
}

fn transport_failure(err: &reqwest::Error) -> GatewayFailure {
    if err.is_timeout() {
        GatewayFailure::timeout(format!("authority did not answer in time: {err}"))
    } else if err.is_decode() {
        GatewayFailure::decode(err.to_string())
    } else {
        GatewayFailure::connection(err.to_string())
    }
}

fn decode_envelope<T: DeserializeOwned>(text: &str) -> Result<(String, T), GatewayFailure> {
    let envelope: Envelope<T> = serde_json::from_str(text)
        .map_err(|e| GatewayFailure::decode(format!("unreadable response: {e}")))?;

    if envelope.result_cd != RESULT_SUCCESS {
        let message = envelope
            .result_msg
            .unwrap_or_else(|| "rejected by authority".to_string());
        return Err(GatewayFailure::rejected(envelope.result_cd, message));
    }

    let data = envelope
        .data
        .ok_or_else(|| GatewayFailure::decode("success response without data"))?;
    Ok((envelope.result_cd, data))
}

/// Masks device secrets in a response body before it is recorded.
///
/// Bodies that are not JSON are kept as they are; a JSON body is written
/// back compactly.
fn redact_secrets(body: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };
    if mask_fields(&mut value) {
        value.to_string()
    } else {
        body.to_string()
    }
}

fn mask_fields(value: &mut serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => {
            let mut masked = false;
            for (key, field) in map.iter_mut() {
                if SECRET_FIELDS.contains(&key.as_str()) && !field.is_null() {
                    *field = serde_json::Value::String(REDACTED.to_string());
                    masked = true;
                } else {
                    masked |= mask_fields(field);
                }
            }
            masked
        }
        serde_json::Value::Array(items) => {
            let mut masked = false;
            for item in items.iter_mut() {
                masked |= mask_fields(item);
            }
            masked
        }
        _ => false,
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

fn timestamp_now() -> String {
    Utc::now().format(DATETIME_FORMAT).to_string()
}

#[async_trait]
impl AuthorityGateway for LiveGateway {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn init_device(&self, request: &InitDeviceRequest) -> Result<DeviceInit, GatewayFailure> {
        let body = json!({
            "tin": request.tin,
            "bhfId": request.branch_id,
            "dvcSrlNo": request.serial_number,
            "deviceName": request.device_name,
        })
        .to_string();
        let timestamp = timestamp_now();

        let (result_code, data) = self
            .call::<InitData>(
                "init_device",
                &request.serial_number,
                &self.paths.init_device,
                &[
                    ("X-Device-Serial", request.serial_number.as_str()),
                    ("X-Timestamp", timestamp.as_str()),
                ],
                body,
            )
            .await?;

        if data.cmc_key.trim().is_empty() {
            return Err(GatewayFailure::decode("authority returned an empty device key"));
        }

        Ok(DeviceInit {
            secret: data.cmc_key,
            result_code,
            message: None,
        })
    }

    async fn submit_invoice(&self, submission: &SignedSubmission) -> Result<Receipt, GatewayFailure> {
        let creds = &submission.credentials;
        let (result_code, data) = self
            .call::<ReceiptData>(
                "submit_invoice",
                &creds.serial_number,
                &self.paths.submit_invoice,
                &[
                    ("X-Device-Serial", creds.serial_number.as_str()),
                    ("X-Device-Key", creds.device_key.as_str()),
                    ("X-Timestamp", submission.timestamp.as_str()),
                    ("X-Signature", submission.signature.as_str()),
                ],
                submission.payload_json.clone(),
            )
            .await?;

        Ok(Receipt {
            receipt_number: data.rcpt_no,
            internal_data: data.intrl_data,
            signature: data.rcpt_sign,
            qr_payload: data.qr_code,
            result_code,
        })
    }

    async fn check_device_status(
        &self,
        credentials: &DeviceCredentials,
    ) -> Result<DeviceStatusReport, GatewayFailure> {
        let body = json!({
            "tin": credentials.tin,
            "bhfId": credentials.branch_id,
            "dvcSrlNo": credentials.serial_number,
        })
        .to_string();
        let timestamp = timestamp_now();

        let (_, data) = self
            .call::<StatusData>(
                "check_device_status",
                &credentials.serial_number,
                &self.paths.device_status,
                &[
                    ("X-Device-Serial", credentials.serial_number.as_str()),
                    ("X-Device-Key", credentials.device_key.as_str()),
                    ("X-Timestamp", timestamp.as_str()),
                ],
                body,
            )
            .await?;

        let last_activity = data
            .last_activity
            .as_deref()
            .and_then(|s| NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).ok())
            .map(|naive| naive.and_utc());

        Ok(DeviceStatusReport {
            status: data.status,
            last_activity,
        })
    }
}
