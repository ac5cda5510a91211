//! Host-side guest communication bridge.
//!
//! Frames a single host-guest byte stream into an RPC + notification
//! channel ([`bridge`]), and layers a guest connection / container / process
//! object model on top of it ([`guest_connection`], [`container`],
//! [`process`]).

pub mod constants;

pub mod message;
pub use message::{Category, MessageHeader, MessageIdentifier, MessageType, Operation};

pub mod envelope;
pub use envelope::{ErrorRecord, RequestBase, ResponseBase};

pub mod error;
pub use error::{BridgeError, Result};

pub mod transport;
pub use transport::{InboundMessage, MessageReader, MessageWriter};

pub mod notification;
pub use notification::{ContainerNotification, NotificationCategory};

pub mod dispatcher;
pub use dispatcher::NotificationDispatcher;

pub mod config;
pub use config::BridgeConfig;

pub mod bridge;
pub use bridge::{Bridge, RpcHandle};

pub mod io_channel;
pub use io_channel::{IoChannel, ServerEndpoint, SocketListener};

pub mod requests;

pub mod guest_connection;
pub use guest_connection::{GuestCapabilities, GuestConnection};

pub mod container;
pub use container::Container;

pub mod process;
pub use process::{Process, ProcessStdio};
