//! The bridge: owns the transport, the send
//! queue, and the table of in-flight RPCs; provides `rpc`/`async_rpc`;
//! routes responses by id and notifications to the dispatcher callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use crate::config::BridgeConfig;
use crate::envelope::ResponseBase;
use crate::error::{BridgeError, Result};
use crate::message::{MessageIdentifier, MessageType};
use crate::notification::ContainerNotification;
use crate::transport::{MessageReader, MessageWriter};

/// Invoked by the receive loop on every inbound `NotifyContainer`
/// notification. Supplied by whoever owns the dispatcher (`GuestConnection`
/// in production, a test harness in unit tests).
pub type NotificationCallback = Arc<dyn Fn(ContainerNotification) -> Result<()> + Send + Sync>;

struct RpcCall {
    identifier: MessageIdentifier,
    payload: serde_json::Value,
    response_tx: oneshot::Sender<Result<serde_json::Value>>,
}

/// The host-side future representing one outstanding request/response
/// pair. Returned by `async_rpc`; `rpc` waits on it internally.
pub struct RpcHandle {
    rx: oneshot::Receiver<Result<serde_json::Value>>,
}

impl RpcHandle {
    pub async fn wait(self) -> Result<serde_json::Value> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::bridge_closed_default()),
        }
    }
}

type InFlightTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>>>;

/// The multiplexed request/response/notification channel over a single
/// byte stream.
pub struct Bridge {
    call_tx: mpsc::Sender<RpcCall>,
    in_flight: InFlightTable,
    closed_cause: Arc<Mutex<Option<BridgeError>>>,
    shutdown_tx: broadcast::Sender<()>,
    config: BridgeConfig,
}

const CALL_QUEUE_DEPTH: usize = 64;

impl Bridge {
    /// Builds a bridge over `stream`, split into independent read/write
    /// halves so the send loop and the receive loop each own one. Does not
    /// start the loops; call `start` once constructed.
    pub fn new<S>(stream: S, notify: NotificationCallback, config: BridgeConfig) -> Arc<Bridge>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader_half, writer_half) = tokio::io::split(stream);
        let (call_tx, call_rx) = mpsc::channel(CALL_QUEUE_DEPTH);
        let (shutdown_tx, _) = broadcast::channel(1);
        let in_flight: InFlightTable = Arc::new(Mutex::new(HashMap::new()));
        let closed_cause = Arc::new(Mutex::new(None));
        let max_message_size = config.max_message_size;

        let bridge = Arc::new(Bridge {
            call_tx,
            in_flight: in_flight.clone(),
            closed_cause: closed_cause.clone(),
            shutdown_tx: shutdown_tx.clone(),
            config,
        });

        tokio::spawn(send_loop(
            call_rx,
            MessageWriter::new(writer_half),
            in_flight.clone(),
            shutdown_tx.subscribe(),
            bridge.clone(),
        ));
        tokio::spawn(recv_loop(
            MessageReader::with_max_message_size(reader_half, max_message_size),
            in_flight,
            notify,
            shutdown_tx.subscribe(),
            bridge.clone(),
        ));

        bridge
    }

    /// The config this bridge was constructed with. `Container` reads
    /// `container_shutdown_deadline` off this rather than a bare constant,
    /// so the deadline tracks whatever `BridgeConfig` the caller supplied.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Number of RPCs currently awaiting a response. Test-only
    /// introspection used to assert the in-flight table empties on close.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_cause.lock().unwrap().is_some()
    }

    /// A receiver for the bridge's shutdown broadcast. `GuestConnection`
    /// subscribes once to clear its notification sinks after the bridge
    /// dies.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Submits `(identifier, payload)` for sending and returns immediately
    /// once the call has been accepted onto the submission channel.
    #[instrument(skip(self, ctx, payload))]
    pub async fn async_rpc(
        &self,
        ctx: &CancellationToken,
        identifier: MessageIdentifier,
        payload: serde_json::Value,
    ) -> Result<RpcHandle> {
        if ctx.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        if let Some(cause) = self.closed_cause.lock().unwrap().clone() {
            return Err(cause);
        }

        let (response_tx, response_rx) = oneshot::channel();
        let call = RpcCall {
            identifier,
            payload,
            response_tx,
        };

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(BridgeError::Cancelled),
            send_result = self.call_tx.send(call) => {
                match send_result {
                    Ok(()) => Ok(RpcHandle { rx: response_rx }),
                    Err(_) => Err(self
                        .closed_cause
                        .lock()
                        .unwrap()
                        .clone()
                        .unwrap_or_else(BridgeError::bridge_closed_default)),
                }
            }
        }
    }

    /// Issues one RPC and waits for it to settle. `allow_cancel = false`
    /// is required for non-idempotent operations (create, start,
    /// shutdown, modify, signal, execute, wait).
    pub async fn rpc(
        &self,
        ctx: &CancellationToken,
        identifier: MessageIdentifier,
        payload: serde_json::Value,
        allow_cancel: bool,
    ) -> Result<serde_json::Value> {
        let handle = self.async_rpc(ctx, identifier, payload).await?;
        let timeout = self.config.rpc_timeout;

        tokio::select! {
            biased;
            res = handle.rx => {
                match res {
                    Ok(result) => result,
                    Err(_) => Err(self.current_cause()),
                }
            }
            _ = ctx.cancelled(), if allow_cancel => {
                // The handle is abandoned; its eventual response (if any)
                // is silently dropped when the table entry is removed.
                Err(BridgeError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                self.kill(None);
                Err(self.current_cause())
            }
        }
    }

    fn current_cause(&self) -> BridgeError {
        self.closed_cause
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(BridgeError::bridge_closed_default)
    }

    /// Idempotent. Closes the bridge with the generic default cause.
    pub fn close(&self) {
        self.kill(None);
    }

    /// Idempotent. Sets the closed state, fires the shutdown signal, and
    /// drains every still-pending RPC with `cause` (or the generic
    /// default).
    pub fn kill(&self, cause: Option<BridgeError>) {
        let mut closed_cause = self.closed_cause.lock().unwrap();
        if closed_cause.is_some() {
            return;
        }
        let cause = cause.unwrap_or_else(BridgeError::bridge_closed_default);
        *closed_cause = Some(cause.clone());
        drop(closed_cause);

        let _ = self.shutdown_tx.send(());

        let mut in_flight = self.in_flight.lock().unwrap();
        for (_, response_tx) in in_flight.drain() {
            let _ = response_tx.send(Err(cause.clone()));
        }
    }
}

async fn send_loop(
    mut call_rx: mpsc::Receiver<RpcCall>,
    mut writer: MessageWriter<impl AsyncWrite + Unpin>,
    in_flight: InFlightTable,
    mut shutdown_rx: broadcast::Receiver<()>,
    bridge: Arc<Bridge>,
) {
    let mut next_id: u64 = 1;
    loop {
        let call = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            call = call_rx.recv() => match call {
                Some(call) => call,
                None => break,
            },
        };

        let id = next_id;
        next_id += 1;

        in_flight.lock().unwrap().insert(id, call.response_tx);

        if let Err(err) = writer
            .write_message(call.identifier, id, &call.payload)
            .await
        {
            if let Some(response_tx) = in_flight.lock().unwrap().remove(&id) {
                let _ = response_tx.send(Err(err.clone()));
            }
            error!(%err, "fatal error writing to transport");
            bridge.kill(Some(err));
            break;
        }
    }
}

async fn recv_loop(
    mut reader: MessageReader<impl AsyncRead + Unpin>,
    in_flight: InFlightTable,
    notify: NotificationCallback,
    mut shutdown_rx: broadcast::Receiver<()>,
    bridge: Arc<Bridge>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            message = reader.read_message() => message,
        };

        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => {
                bridge.kill(Some(BridgeError::Transport(
                    "transport closed by peer".to_string(),
                )));
                break;
            }
            Err(err) => {
                error!(%err, "fatal transport error");
                bridge.kill(Some(err));
                break;
            }
        };

        match message.identifier.message_type {
            MessageType::Response => {
                let response_tx = match in_flight.lock().unwrap().remove(&message.id) {
                    Some(tx) => tx,
                    None => {
                        let err = BridgeError::Transport(format!(
                            "response for unknown id {}",
                            message.id
                        ));
                        error!(%err);
                        bridge.kill(Some(err));
                        break;
                    }
                };

                match serde_json::from_slice::<serde_json::Value>(&message.body) {
                    Ok(value) => {
                        if let Ok(base) = serde_json::from_value::<ResponseBase>(value.clone()) {
                            if !base.is_success() {
                                if let Some(records) = &base.error_records {
                                    for record in records {
                                        warn!(?record, "guest error record");
                                    }
                                }
                                let _ = response_tx.send(Err(BridgeError::Rpc {
                                    result: base.result,
                                    message: base.error_message.unwrap_or_default(),
                                }));
                                continue;
                            }
                        }
                        let _ = response_tx.send(Ok(value));
                    }
                    Err(err) => {
                        let err = BridgeError::from(err);
                        let _ = response_tx.send(Err(err.clone()));
                        bridge.kill(Some(err));
                        break;
                    }
                }
            }
            MessageType::Notify => {
                if message.identifier.operation != crate::message::Operation::NotifyContainer {
                    let err = BridgeError::Transport(format!(
                        "unexpected notify operation {:?}",
                        message.identifier.operation
                    ));
                    error!(%err);
                    bridge.kill(Some(err));
                    break;
                }

                match serde_json::from_slice::<ContainerNotification>(&message.body) {
                    Ok(notification) => {
                        if let Err(err) = notify(notification) {
                            error!(%err, "notification dispatch error");
                            bridge.kill(Some(err));
                            break;
                        }
                    }
                    Err(err) => {
                        let err = BridgeError::from(err);
                        error!(%err, "failed to decode notification");
                        bridge.kill(Some(err));
                        break;
                    }
                }
            }
            other => {
                let err = BridgeError::Transport(format!("unexpected message type {other:?}"));
                error!(%err);
                bridge.kill(Some(err));
                break;
            }
        }
    }
}
