//! Small request/response shapes the core itself inspects. Everything
//! else in a payload is opaque `serde_json::Value`.

use serde::{Deserialize, Serialize};

use crate::envelope::ResponseBase;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NegotiateProtocolRequest {
    pub minimum_version: u32,
    pub maximum_version: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GcsCapabilities {
    #[serde(default)]
    pub send_host_create_message: bool,
    #[serde(default)]
    pub send_host_start_message: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NegotiateProtocolResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub capabilities: GcsCapabilities,
    #[serde(default)]
    pub guest_os: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerRequest {
    pub container_config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifySettingsRequest {
    pub request: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DumpStacksResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    #[serde(default)]
    pub guest_stacks: String,
}

/// Reflection struct used only to discover which standard streams a
/// process wants piped — no more, no less.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessPipeFlags {
    #[serde(default)]
    pub create_std_in_pipe: bool,
    #[serde(default)]
    pub create_std_out_pipe: bool,
    #[serde(default)]
    pub create_std_err_pipe: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecuteProcessRequest {
    pub settings: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vsock_stdio_relay_settings: Option<VsockStdioRelaySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hvsock_stdio_relay_settings: Option<HvsockStdioRelaySettings>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VsockStdioRelaySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin_port: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_port: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_port: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HvsockStdioRelaySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<HvsockAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<HvsockAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<HvsockAddress>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HvsockAddress {
    pub service_id: uuid::Uuid,
    pub host_id: uuid::Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecuteProcessResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    #[serde(default)]
    pub process_id: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitForProcessRequest {
    pub process_id: u32,
    pub timeout_in_ms: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitForProcessResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    #[serde(default)]
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignalProcessRequest {
    pub process_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResizeConsoleRequest {
    pub process_id: u32,
    pub height: u16,
    pub width: u16,
}
