//! Request/response envelope fields every payload embeds.
//!
//! The bodies themselves stay opaque `serde_json::Value` — the core does
//! not interpret most payloads — but the envelope fields it does
//! inspect (container id, result code, error records) get their own types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fields embedded in every request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestBase {
    pub container_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<Uuid>,
    /// Opaque to the core; carried through unexamined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opencensus_span_context: Option<serde_json::Value>,
}

impl RequestBase {
    pub fn new(container_id: Uuid) -> Self {
        RequestBase {
            container_id,
            activity_id: None,
            opencensus_span_context: None,
        }
    }
}

/// One structured diagnostic record the guest may attach to an error
/// response. Used only for logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorRecord {
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub module_name: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub result: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Fields embedded in every response payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseBase {
    #[serde(default)]
    pub result: i32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_records: Option<Vec<ErrorRecord>>,
}

impl ResponseBase {
    pub fn is_success(&self) -> bool {
        self.result == 0
    }
}
