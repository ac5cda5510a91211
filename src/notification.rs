//! The generic container notification payload.
//!
//! The core inspects only the `ContainerId` and the notification category;
//! everything else in the payload is opaque.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The handful of notification categories the dispatcher itself acts on.
/// Anything else is logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationCategory {
    ForcedExit,
    GracefulExit,
    UnexpectedExit,
    OutOfMemory,
    Unknown(String),
}

impl NotificationCategory {
    /// Forced/graceful/unexpected exit all mean the same thing to the
    /// dispatcher: the container's silo has exited.
    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            NotificationCategory::ForcedExit
                | NotificationCategory::GracefulExit
                | NotificationCategory::UnexpectedExit
        )
    }

    fn from_operation(op: &str) -> Self {
        match op {
            "ForcedExit" => NotificationCategory::ForcedExit,
            "GracefulExit" => NotificationCategory::GracefulExit,
            "UnexpectedExit" => NotificationCategory::UnexpectedExit,
            "OutOfMemory" => NotificationCategory::OutOfMemory,
            other => NotificationCategory::Unknown(other.to_string()),
        }
    }
}

/// A `NotifyContainer` message body. Deserialized generically; the core
/// reads `container_id` and `operation`, nothing else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerNotification {
    #[serde(default)]
    pub container_id: Uuid,
    pub operation: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContainerNotification {
    pub fn category(&self) -> NotificationCategory {
        NotificationCategory::from_operation(&self.operation)
    }
}
