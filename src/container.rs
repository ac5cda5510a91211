//! The container object: wraps one container id
//! already known to the guest, tracks its exit via the notification sink a
//! `GuestConnection` registered for it, and forwards everything else to the
//! bridge.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::constants::HR_COMPUTE_SYSTEM_DOES_NOT_EXIST;
use crate::dispatcher::NotificationSink;
use crate::envelope::RequestBase;
use crate::error::{BridgeError, Result};
use crate::guest_connection::GuestConnection;
use crate::message::{Category, MessageIdentifier, Operation};
use crate::notification::ContainerNotification;
use crate::process::Process;
use crate::requests::ModifySettingsRequest;
use crate::transport::merge_request_base;

const NOTIFICATION_QUEUE_DEPTH: usize = 16;

enum WaitOutcome {
    Pending,
    Exited,
    Failed(BridgeError),
}

/// One container hosted inside the guest.
pub struct Container {
    connection: Arc<GuestConnection>,
    id: Uuid,
    wait_state: Mutex<WaitOutcome>,
    wait_ready: Notify,
    notify_tx: mpsc::Sender<ContainerNotification>,
    notify_rx: Mutex<Option<mpsc::Receiver<ContainerNotification>>>,
}

impl Container {
    pub(crate) fn new(
        connection: Arc<GuestConnection>,
        id: Uuid,
        sink: NotificationSink,
    ) -> Arc<Container> {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_QUEUE_DEPTH);

        let container = Arc::new(Container {
            connection,
            id,
            wait_state: Mutex::new(WaitOutcome::Pending),
            wait_ready: Notify::new(),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        });

        tokio::spawn(run_sink(container.clone(), sink));
        container
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        self.simple_rpc(Operation::Start, json!({})).await
    }

    /// `forced = false` issues `ShutdownGraceful`, `true` issues
    /// `ShutdownForced`. A guest response carrying
    /// `hrComputeSystemDoesNotExist` is treated as success either way: the
    /// container is already gone.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, forced: bool) -> Result<()> {
        let op = if forced {
            Operation::ShutdownForced
        } else {
            Operation::ShutdownGraceful
        };
        let ctx = CancellationToken::new();
        let base = RequestBase::new(self.id);
        let payload = merge_request_base(base, json!({}))?;
        let deadline = self.connection.bridge().config().container_shutdown_deadline;

        tokio::select! {
            biased;
            result = self.connection.bridge().rpc(
                &ctx,
                MessageIdentifier::request(Category::Container, op),
                payload,
                false,
            ) => {
                match result {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_guest_result(HR_COMPUTE_SYSTEM_DOES_NOT_EXIST) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            _ = tokio::time::sleep(deadline) => {
                ctx.cancel();
                Err(BridgeError::NotReady(format!(
                    "{} timed out waiting for the guest to respond",
                    if forced { "forced shutdown" } else { "graceful shutdown" }
                )))
            }
        }
    }

    /// Alias for `shutdown(true)`.
    pub async fn terminate(&self) -> Result<()> {
        self.shutdown(true).await
    }

    pub async fn modify(&self, settings: serde_json::Value) -> Result<()> {
        let base = RequestBase::new(self.id);
        let payload = merge_request_base(
            base,
            serde_json::to_value(ModifySettingsRequest { request: settings })?,
        )?;
        self.connection
            .bridge()
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, Operation::ModifySettings),
                payload,
                false,
            )
            .await?;
        Ok(())
    }

    /// Both property schema versions share the `GetProperties` operation
    /// code; the query body picks the version.
    pub async fn properties_v1(&self, query: serde_json::Value) -> Result<serde_json::Value> {
        self.get_properties(query).await
    }

    pub async fn properties_v2(&self, query: serde_json::Value) -> Result<serde_json::Value> {
        self.get_properties(query).await
    }

    async fn get_properties(&self, query: serde_json::Value) -> Result<serde_json::Value> {
        let base = RequestBase::new(self.id);
        let payload = merge_request_base(base, query)?;
        self.connection
            .bridge()
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, Operation::GetProperties),
                payload,
                true,
            )
            .await
    }

    pub async fn create_process(
        self: &Arc<Self>,
        settings: serde_json::Value,
    ) -> Result<Arc<Process>> {
        Process::exec(self.connection.clone(), self.id, settings).await
    }

    /// Blocks until the container exits, the bridge closes, or `close` is
    /// called locally — whichever happens first.
    pub async fn wait(&self) -> Result<()> {
        loop {
            let notified = self.wait_ready.notified();
            tokio::pin!(notified);
            {
                let state = self.wait_state.lock().unwrap();
                match &*state {
                    WaitOutcome::Pending => {}
                    WaitOutcome::Exited => return Ok(()),
                    WaitOutcome::Failed(err) => return Err(err.clone()),
                }
            }
            notified.await;
        }
    }

    /// Out-of-memory (and any other non-exit) notifications for this
    /// container, as they arrive: a single-consumer stream, since only one
    /// place in a caller's code typically drains it. Returns `None` if
    /// called more than once.
    pub fn notifications(&self) -> Option<ReceiverStream<ContainerNotification>> {
        self.notify_rx.lock().unwrap().take().map(ReceiverStream::new)
    }

    /// Resolves any pending `wait()` locally, without waiting on the guest.
    pub fn close(&self) {
        let mut state = self.wait_state.lock().unwrap();
        if matches!(&*state, WaitOutcome::Pending) {
            *state = WaitOutcome::Failed(BridgeError::NotReady(
                "container closed locally".to_string(),
            ));
        }
        drop(state);
        self.wait_ready.notify_waiters();
    }

    async fn simple_rpc(&self, op: Operation, extra: serde_json::Value) -> Result<()> {
        let base = RequestBase::new(self.id);
        let payload = merge_request_base(base, extra)?;
        self.connection
            .bridge()
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, op),
                payload,
                false,
            )
            .await?;
        Ok(())
    }
}

/// Background task owning the notification sink: republishes non-exit
/// notifications, and resolves `wait()` when the dispatcher reports the
/// container has exited or tears the sink down for any other reason.
async fn run_sink(container: Arc<Container>, mut sink: NotificationSink) {
    loop {
        tokio::select! {
            biased;
            _ = &mut sink.close_rx => {
                // The dispatcher closes both halves of the sink together
                // on exit; drain whatever was already buffered on the
                // notify side so a notification delivered just before the
                // exit isn't lost to the `biased` race with this branch.
                while let Ok(notification) = sink.notify_rx.try_recv() {
                    let _ = container.notify_tx.send(notification).await;
                }
                resolve(&container, WaitOutcome::Exited);
                break;
            }
            notification = sink.notify_rx.recv() => {
                match notification {
                    Some(notification) => {
                        let _ = container.notify_tx.send(notification).await;
                    }
                    None => {
                        resolve(&container, WaitOutcome::Failed(BridgeError::bridge_closed_default()));
                        break;
                    }
                }
            }
        }
    }
}

fn resolve(container: &Arc<Container>, outcome: WaitOutcome) {
    let mut state = container.wait_state.lock().unwrap();
    if matches!(&*state, WaitOutcome::Pending) {
        *state = outcome;
    }
    drop(state);
    container.wait_ready.notify_waiters();
}
