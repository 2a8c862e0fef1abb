//! # Authority Result Codes
//!
//! Fixed classification of everything the authority (or the network in
//! front of it) can answer with.
//!
//! ## Classification Table
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Source              Value                         Retryability         │
//! │  ──────────────────  ────────────────────────────  ───────────────────  │
//! │  resultCd            000                           (success)            │
//! │  resultCd            891 892 893 894 990 996 999   Retryable            │
//! │  resultCd            001 899 900 901 902 903       Permanent            │
//! │                      910 911 912 921 924 994 995                        │
//! │  resultCd            anything else                 Unknown              │
//! │  HTTP status         5xx, 429   (code http:NNN)    Retryable            │
//! │  HTTP status         other 4xx  (code http:NNN)    Permanent            │
//! │  Transport           timeout, connect error        Retryable            │
//! │  2xx body            not decodable                 Retryable            │
//! │                                                                         │
//! │  Unknown: retried once per retry entry. The entry remembers it          │
//! │  (`unknown_retried`); any later unknown code on that entry is          │
//! │  permanent, whatever failures came in between.                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Codes the authority uses for temporary conditions.
pub const RETRYABLE_CODES: [&str; 7] = ["891", "892", "893", "894", "990", "996", "999"];

/// Codes the authority uses for final rejections.
pub const PERMANENT_CODES: [&str; 14] = [
    "001", "899", "900", "901", "902", "903", "910", "911", "912", "921", "924", "994", "995",
    // Raised locally when the stored payload no longer matches its checksum
    DATA_DRIFT_CODE,
];

/// Local code for payload checksum mismatches.
pub const DATA_DRIFT_CODE: &str = "DRIFT";

/// Prefix that keeps HTTP statuses apart from authority result codes.
pub const HTTP_CODE_PREFIX: &str = "http:";

/// Failure code recorded for a non-2xx HTTP status, e.g. `http:503`.
pub fn http_status_code(status: u16) -> String {
    format!("{HTTP_CODE_PREFIX}{status}")
}

/// Whether a failed call may be repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retryability {
    Retryable,
    Permanent,
    /// Not in the table. See [`resolve_unknown`].
    Unknown,
}

impl fmt::Display for Retryability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retryability::Retryable => write!(f, "retryable"),
            Retryability::Permanent => write!(f, "permanent"),
            Retryability::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classifies a non-success `resultCd`.
pub fn classify_result_code(code: &str) -> Retryability {
    let code = code.trim();
    if RETRYABLE_CODES.contains(&code) {
        Retryability::Retryable
    } else if PERMANENT_CODES.contains(&code) {
        Retryability::Permanent
    } else {
        Retryability::Unknown
    }
}

/// Classifies a non-2xx HTTP status.
pub fn classify_http_status(status: u16) -> Retryability {
    match status {
        429 | 500..=599 => Retryability::Retryable,
        400..=499 => Retryability::Permanent,
        // 1xx/3xx never reach us with redirects followed; treat as outage
        _ => Retryability::Retryable,
    }
}

/// Settles an [`Retryability::Unknown`] failure: `true` means retry.
///
/// `already_retried` is whether the retry entry has retried an unknown
/// code before.
pub fn resolve_unknown(already_retried: bool) -> bool {
    !already_retried
}
