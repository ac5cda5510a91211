//! Error taxonomy: four kinds, not four types. `BridgeError`
//! distinguishes them as variants so callers can match on the ones they
//! care about (e.g. the two HRESULT special cases in container/process).

use thiserror::Error;

/// A specialized `Result` type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// Transport fatal: a failure reading/writing the byte stream, an
    /// oversize or undersize message, an unknown message category, an
    /// unmatched response, or an unmarshal failure. Always kills the
    /// bridge; every in-flight and future RPC inherits this cause.
    #[error("transport error: {0}")]
    Transport(String),

    /// A response whose `Result` field was non-zero. Carries the signed
    /// guest status so callers can match known HRESULTs.
    #[error("guest rpc error (result={result:#x}): {message}")]
    Rpc { result: i32, message: String },

    /// The caller's context was cancelled while `allow_cancel = true`.
    #[error("operation cancelled")]
    Cancelled,

    /// The bridge is closed (or became closed during the call, including
    /// as the result of a per-RPC timeout): `reason` is the stored
    /// shutdown cause, verbatim, or the generic message below if the
    /// bridge was killed without an explicit one.
    #[error("{0}")]
    BridgeClosed(String),

    /// A sink was already registered for this container id.
    #[error("notification sink already registered for container {0}")]
    AlreadyRegistered(uuid::Uuid),

    /// An operation that requires a completed wait was invoked before the
    /// wait resolved (e.g. `Process::exit_code` before `wait()`).
    #[error("{0}")]
    NotReady(String),
}

impl BridgeError {
    pub fn bridge_closed_default() -> Self {
        BridgeError::BridgeClosed("bridge closed".to_string())
    }

    /// `true` if this is the "guest rpc error" variant carrying the given
    /// HRESULT, used by the two documented result-code special cases.
    pub fn is_guest_result(&self, result: i32) -> bool {
        matches!(self, BridgeError::Rpc { result: r, .. } if *r == result)
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Transport(format!("unmarshal error: {err}"))
    }
}
