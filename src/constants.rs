//! Compile-time constants shared across the bridge.
//!
//! There is no mutable global state intrinsic to the core: the null
//! container id, the protocol version, and the well-known GUIDs/ports below
//! are all that is needed.

use uuid::Uuid;

/// The protocol version this bridge negotiates. Negotiation demands an
/// exact match between host and guest.
pub const PROTOCOL_VERSION: u32 = 4;

/// Linux guest vsock port the GCS listens on.
pub const LINUX_GCS_VSOCK_PORT: u32 = 0x4000_0000;

/// First port handed out to I/O channels. `GuestConnection::new_io_channel`
/// starts allocating from here.
pub const FIRST_IO_CHANNEL_PORT: u32 = LINUX_GCS_VSOCK_PORT + 1;

/// Windows GCS service id, used to build hvsock addresses for I/O channels.
pub const WINDOWS_GCS_HVSOCK_SERVICE_ID: Uuid =
    Uuid::from_u128(0xacef_5661_84a1_4e44_856b_6245_e69f_4620);

/// Windows GCS host id (the parent partition's address in hvsock terms).
pub const WINDOWS_GCS_HOST_ID: Uuid = Uuid::from_u128(0x894c_c2d6_9d79_424f_93fe_4296_9ae6_d8d1);

/// The null container id, which addresses the guest itself rather than any
/// container hosted inside it.
pub const NULL_CONTAINER_ID: Uuid = Uuid::nil();

/// `HRESULT` for "the compute system does not exist". Returned by the guest
/// when a container has already exited; `Container::shutdown`/`terminate`
/// treat this as success.
pub const HR_COMPUTE_SYSTEM_DOES_NOT_EXIST: i32 = 0xC037_010Eu32 as i32;

/// `HRESULT` for "not found". Returned by the guest when signalling a
/// process that no longer exists; `Process::signal` treats this as
/// "delivered = false, err = None" rather than an error.
pub const HR_NOT_FOUND: i32 = 0x8007_0490u32 as i32;

/// Size, in bytes, of the fixed wire header every message starts with.
pub const HEADER_SIZE: usize = 16;

/// `WaitForProcess` timeout value meaning "wait forever".
pub const WAIT_TIMEOUT_INFINITE: u32 = u32::MAX;

/// Hyper-V socket service ids are a template GUID with the port patched
/// into the first four bytes (the same convention `AF_VSOCK`/hvsock use on
/// both sides of the platform split). Used to build a distinct stdio relay
/// address per I/O channel port without the guest and host needing any
/// further coordination.
pub fn hvsock_service_id_for_port(port: u32) -> Uuid {
    let mut bytes = *WINDOWS_GCS_HVSOCK_SERVICE_ID.as_bytes();
    bytes[0..4].copy_from_slice(&port.to_be_bytes());
    Uuid::from_bytes(bytes)
}
