//! `GuestConnection`: lifecycle and capability
//! negotiation with the guest; factory for `Container`s and `Process`es;
//! allocator of I/O channel ports; closes the bridge on shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::bridge::{Bridge, NotificationCallback};
use crate::config::BridgeConfig;
use crate::constants::{FIRST_IO_CHANNEL_PORT, NULL_CONTAINER_ID, PROTOCOL_VERSION};
use crate::container::Container;
use crate::dispatcher::{self, NotificationDispatcher};
use crate::envelope::RequestBase;
use crate::error::{BridgeError, Result};
use crate::io_channel::{IoChannel, SocketListener};
use crate::message::{Category, MessageIdentifier, Operation};
use crate::process::Process;
use crate::requests::{
    CreateContainerRequest, DumpStacksResponse, GcsCapabilities, ModifySettingsRequest,
    NegotiateProtocolRequest, NegotiateProtocolResponse,
};
use crate::transport::merge_request_base;

/// Capability bits the guest advertised during `NegotiateProtocol`.
#[derive(Debug, Clone, Default)]
pub struct GuestCapabilities {
    inner: GcsCapabilities,
}

impl GuestCapabilities {
    pub fn supports_send_host_create(&self) -> bool {
        self.inner.send_host_create_message
    }

    pub fn supports_send_host_start(&self) -> bool {
        self.inner.send_host_start_message
    }
}

/// A connection to one guest. Owns exactly one `Bridge` and the
/// notification dispatcher; containers and processes hold a non-owning
/// handle to it and address everything else by id.
pub struct GuestConnection {
    bridge: Arc<Bridge>,
    dispatcher: Arc<NotificationDispatcher>,
    listener: Arc<dyn SocketListener>,
    next_port: AtomicU32,
    capabilities: GuestCapabilities,
    os: String,
}

impl GuestConnection {
    /// Wraps `stream` in a new bridge, negotiates the protocol, and — on a
    /// cold start, if the guest advertises support — issues the host-driven
    /// `Create`/`Start` against the null container id.
    #[instrument(skip(stream, listener))]
    pub async fn connect<S>(
        stream: S,
        listener: Arc<dyn SocketListener>,
        config: BridgeConfig,
        cold_start: bool,
    ) -> Result<Arc<GuestConnection>>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let dispatcher = Arc::new(NotificationDispatcher::new());
        let dispatcher_for_callback = dispatcher.clone();
        let notify: NotificationCallback =
            Arc::new(move |notification| dispatcher_for_callback.deliver(notification));

        let bridge = Bridge::new(stream, notify, config);

        let mut shutdown_rx = bridge.subscribe_shutdown();
        let dispatcher_for_shutdown = dispatcher.clone();
        tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            dispatcher_for_shutdown.clear();
        });

        let handshake = GuestConnection {
            bridge,
            dispatcher,
            listener,
            next_port: AtomicU32::new(FIRST_IO_CHANNEL_PORT),
            capabilities: GuestCapabilities::default(),
            os: "windows".to_string(),
        };

        let negotiated = handshake.negotiate_protocol().await?;
        let os = negotiated
            .guest_os
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "windows".to_string())
            .to_lowercase();

        let gc = Arc::new(GuestConnection {
            capabilities: GuestCapabilities {
                inner: negotiated.capabilities,
            },
            os,
            ..handshake
        });

        if cold_start {
            if gc.capabilities.supports_send_host_create() {
                let base = RequestBase::new(NULL_CONTAINER_ID);
                let payload = merge_request_base(
                    base,
                    serde_json::to_value(CreateContainerRequest {
                        container_config: json!({ "SystemType": "Container" }),
                    })?,
                )?;
                gc.bridge
                    .rpc(
                        &CancellationToken::new(),
                        MessageIdentifier::request(Category::Container, Operation::Create),
                        payload,
                        false,
                    )
                    .await?;
            }
            if gc.capabilities.supports_send_host_start() {
                let base = RequestBase::new(NULL_CONTAINER_ID);
                let payload = merge_request_base(base, json!({}))?;
                gc.bridge
                    .rpc(
                        &CancellationToken::new(),
                        MessageIdentifier::request(Category::Container, Operation::Start),
                        payload,
                        false,
                    )
                    .await?;
            }
        }

        Ok(gc)
    }

    async fn negotiate_protocol(&self) -> Result<NegotiateProtocolResponse> {
        let base = RequestBase::new(NULL_CONTAINER_ID);
        let payload = merge_request_base(
            base,
            serde_json::to_value(NegotiateProtocolRequest {
                minimum_version: PROTOCOL_VERSION,
                maximum_version: PROTOCOL_VERSION,
            })?,
        )?;

        let response_value = self
            .bridge
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, Operation::NegotiateProtocol),
                payload,
                false,
            )
            .await?;

        let response: NegotiateProtocolResponse = serde_json::from_value(response_value)?;
        if response.version != PROTOCOL_VERSION {
            return Err(BridgeError::NotReady(format!(
                "guest negotiated protocol version {} but host requires {}",
                response.version, PROTOCOL_VERSION
            )));
        }
        Ok(response)
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn capabilities(&self) -> &GuestCapabilities {
        &self.capabilities
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Creates a new container inside the guest and registers its
    /// notification sink. Not cancellable.
    pub async fn create_container(
        self: &Arc<Self>,
        cid: Uuid,
        config: serde_json::Value,
    ) -> Result<Arc<Container>> {
        let (sink, entry) = dispatcher::new_sink();
        self.dispatcher.register(cid, entry)?;

        let base = RequestBase::new(cid);
        let payload = merge_request_base(
            base,
            serde_json::to_value(CreateContainerRequest {
                container_config: config,
            })?,
        )?;

        if let Err(err) = self
            .bridge
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, Operation::Create),
                payload,
                false,
            )
            .await
        {
            self.dispatcher.unregister(&cid);
            return Err(err);
        }

        Ok(Container::new(self.clone(), cid, sink))
    }

    /// Wraps an id the caller already knows exists inside the guest,
    /// without issuing `Create`.
    pub fn clone_container(self: &Arc<Self>, cid: Uuid) -> Result<Arc<Container>> {
        let (sink, entry) = dispatcher::new_sink();
        self.dispatcher.register(cid, entry)?;
        Ok(Container::new(self.clone(), cid, sink))
    }

    pub async fn modify(&self, settings: serde_json::Value) -> Result<()> {
        let base = RequestBase::new(NULL_CONTAINER_ID);
        let payload = merge_request_base(
            base,
            serde_json::to_value(ModifySettingsRequest { request: settings })?,
        )?;
        self.bridge
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, Operation::ModifySettings),
                payload,
                false,
            )
            .await?;
        Ok(())
    }

    pub async fn dump_stacks(&self) -> Result<String> {
        let base = RequestBase::new(NULL_CONTAINER_ID);
        let payload = merge_request_base(base, json!({}))?;
        let value = self
            .bridge
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, Operation::DumpStacks),
                payload,
                true,
            )
            .await?;
        let response: DumpStacksResponse = serde_json::from_value(value)?;
        Ok(response.guest_stacks)
    }

    pub async fn delete_container_state(&self, cid: Uuid) -> Result<()> {
        let base = RequestBase::new(cid);
        let payload = merge_request_base(base, json!({}))?;
        self.bridge
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, Operation::DeleteContainerState),
                payload,
                false,
            )
            .await?;
        Ok(())
    }

    /// Alias for `exec(null_container_id, settings)`.
    pub async fn create_process(
        self: &Arc<Self>,
        settings: serde_json::Value,
    ) -> Result<Arc<Process>> {
        Process::exec(self.clone(), NULL_CONTAINER_ID, settings).await
    }

    /// Atomically allocates the next I/O channel port and binds a server
    /// endpoint on it.
    pub async fn new_io_channel(&self) -> Result<(Arc<IoChannel>, u32)> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let endpoint = self
            .listener
            .listen(port)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        Ok((IoChannel::new(endpoint), port))
    }

    /// Closes the bridge; the shutdown watcher task wakes and clears every
    /// notification sink.
    pub fn close(&self) {
        self.bridge.close();
    }
}
