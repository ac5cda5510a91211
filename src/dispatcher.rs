//! The notification dispatcher.
//!
//! Maintains a map from container id to a per-container sink. Never blocks
//! on delivery: the notify side of a sink is a bounded channel, and a full
//! channel means the caller logs and drops rather than backing up the
//! bridge's single receive loop.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::notification::ContainerNotification;

/// Bound on the per-container notification queue. Chosen generously since
/// OOM notifications (the only kind that land here) are rare; a full queue
/// means the consumer has stopped draining it.
const NOTIFY_QUEUE_DEPTH: usize = 32;

/// The host-side half of a container's notification plumbing, handed to
/// `Container` on creation. The dispatcher holds the other half.
pub struct NotificationSink {
    pub notify_rx: mpsc::Receiver<ContainerNotification>,
    pub close_rx: oneshot::Receiver<()>,
}

struct SinkEntry {
    notify_tx: mpsc::Sender<ContainerNotification>,
    close_tx: Option<oneshot::Sender<()>>,
}

/// Creates a fresh sink pair: the dispatcher-facing entry and the
/// container-facing handle.
pub fn new_sink() -> (NotificationSink, SinkEntryHandle) {
    let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
    let (close_tx, close_rx) = oneshot::channel();
    (
        NotificationSink { notify_rx, close_rx },
        SinkEntryHandle {
            entry: SinkEntry {
                notify_tx,
                close_tx: Some(close_tx),
            },
        },
    )
}

/// Opaque wrapper so callers of `new_sink` can hand the dispatcher-facing
/// half to `register` without reaching into dispatcher internals.
pub struct SinkEntryHandle {
    entry: SinkEntry,
}

#[derive(Default)]
pub struct NotificationDispatcher {
    sinks: Mutex<HashMap<Uuid, SinkEntry>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        NotificationDispatcher {
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `sink` under `cid`. Fails if a sink is already registered
    /// for this id.
    pub fn register(&self, cid: Uuid, sink: SinkEntryHandle) -> Result<()> {
        let mut sinks = self.sinks.lock().unwrap();
        if sinks.contains_key(&cid) {
            return Err(BridgeError::AlreadyRegistered(cid));
        }
        sinks.insert(cid, sink.entry);
        Ok(())
    }

    pub fn unregister(&self, cid: &Uuid) {
        self.sinks.lock().unwrap().remove(cid);
    }

    /// Routes one notification to its container's sink. Absence of a
    /// matching sink is reported to the caller; the bridge treats that as
    /// fatal.
    pub fn deliver(&self, notification: ContainerNotification) -> Result<()> {
        let category = notification.category();
        let cid = notification.container_id;

        let mut sinks = self.sinks.lock().unwrap();

        if category.is_exit() {
            if let Some(entry) = sinks.remove(&cid) {
                close_entry(entry);
                Ok(())
            } else {
                Err(BridgeError::NotReady(format!(
                    "notification for unregistered container {cid}"
                )))
            }
        } else if matches!(category, crate::notification::NotificationCategory::OutOfMemory) {
            match sinks.get(&cid) {
                Some(entry) => {
                    if entry.notify_tx.try_send(notification).is_err() {
                        warn!(%cid, "dropping notification: container sink queue is full");
                    }
                    Ok(())
                }
                None => Err(BridgeError::NotReady(format!(
                    "notification for unregistered container {cid}"
                ))),
            }
        } else {
            debug!(%cid, operation = %notification.operation, "dropping notification of unknown category");
            Ok(())
        }
    }

    /// Drains and closes every sink. Called once at bridge shutdown.
    pub fn clear(&self) {
        let mut sinks = self.sinks.lock().unwrap();
        for (_, entry) in sinks.drain() {
            close_entry(entry);
        }
    }
}

fn close_entry(mut entry: SinkEntry) {
    if let Some(close_tx) = entry.close_tx.take() {
        let _ = close_tx.send(());
    }
    // Dropping `notify_tx` here (as `entry` goes out of scope) closes the
    // notify side too, so a receiver sees the channel end after the close
    // signal it's already observed.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::ContainerNotification;

    fn notification(cid: Uuid, operation: &str) -> ContainerNotification {
        ContainerNotification {
            container_id: cid,
            operation: operation.to_string(),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn register_rejects_duplicate_id() {
        let dispatcher = NotificationDispatcher::new();
        let cid = Uuid::new_v4();
        let (_sink_a, entry_a) = new_sink();
        let (_sink_b, entry_b) = new_sink();

        dispatcher.register(cid, entry_a).unwrap();
        let err = dispatcher.register(cid, entry_b).unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyRegistered(id) if id == cid));
    }

    #[tokio::test]
    async fn exit_notification_closes_sink_and_removes_entry() {
        let dispatcher = NotificationDispatcher::new();
        let cid = Uuid::new_v4();
        let (mut sink, entry) = new_sink();
        dispatcher.register(cid, entry).unwrap();

        dispatcher
            .deliver(notification(cid, "GracefulExit"))
            .unwrap();

        sink.close_rx.await.unwrap();
        assert_eq!(sink.notify_rx.recv().await, None);

        // The entry is gone: a second exit notification for the same id
        // is reported as unregistered, not silently accepted twice.
        assert!(dispatcher.deliver(notification(cid, "GracefulExit")).is_err());
    }

    #[tokio::test]
    async fn oom_notification_is_queued_not_closed() {
        let dispatcher = NotificationDispatcher::new();
        let cid = Uuid::new_v4();
        let (mut sink, entry) = new_sink();
        dispatcher.register(cid, entry).unwrap();

        dispatcher
            .deliver(notification(cid, "OutOfMemory"))
            .unwrap();

        let received = sink.notify_rx.recv().await.unwrap();
        assert_eq!(received.operation, "OutOfMemory");
        assert!(sink.close_rx.try_recv().is_err());
    }

    #[test]
    fn unknown_category_is_dropped_not_errored() {
        let dispatcher = NotificationDispatcher::new();
        let cid = Uuid::new_v4();
        let (_sink, entry) = new_sink();
        dispatcher.register(cid, entry).unwrap();

        assert!(dispatcher.deliver(notification(cid, "SomethingElse")).is_ok());
    }

    #[test]
    fn delivery_to_unregistered_container_is_an_error() {
        let dispatcher = NotificationDispatcher::new();
        assert!(dispatcher
            .deliver(notification(Uuid::new_v4(), "GracefulExit"))
            .is_err());
    }

    #[tokio::test]
    async fn clear_closes_every_sink() {
        let dispatcher = NotificationDispatcher::new();
        let cid_a = Uuid::new_v4();
        let cid_b = Uuid::new_v4();
        let (sink_a, entry_a) = new_sink();
        let (sink_b, entry_b) = new_sink();
        dispatcher.register(cid_a, entry_a).unwrap();
        dispatcher.register(cid_b, entry_b).unwrap();

        dispatcher.clear();

        sink_a.close_rx.await.unwrap();
        sink_b.close_rx.await.unwrap();
    }
}
