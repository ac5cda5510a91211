//! The framed message identifier and wire header.
//!
//! ```text
//!  bits 31..28  Type       {None=0, Request=1, Response=2, Notify=3}
//!  bits 27..20  Category   {Container = 0x01}
//!  bits 19..8   Operation  {Create, Start, ...}
//!  bits  7..0   Version    {V1 = 0x01}
//! ```

use crate::error::{BridgeError, Result};

/// High nibble of the identifier: whether this message is a request, a
/// response, or a fire-and-forget notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    None,
    Request,
    Response,
    Notify,
}

impl MessageType {
    fn from_bits(bits: u32) -> Option<MessageType> {
        match bits {
            0 => Some(MessageType::None),
            1 => Some(MessageType::Request),
            2 => Some(MessageType::Response),
            3 => Some(MessageType::Notify),
            _ => None,
        }
    }

    fn bits(self) -> u32 {
        match self {
            MessageType::None => 0,
            MessageType::Request => 1,
            MessageType::Response => 2,
            MessageType::Notify => 3,
        }
    }
}

/// Bits 27..20. Only `Container` is defined; anything else is an unknown
/// category and is fatal for the bridge when observed inbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Container,
}

impl Category {
    fn from_bits(bits: u32) -> Option<Category> {
        match bits {
            0x01 => Some(Category::Container),
            _ => None,
        }
    }

    fn bits(self) -> u32 {
        match self {
            Category::Container => 0x01,
        }
    }
}

/// Bits 19..8. Operation codes the core issues or must recognize on
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Start,
    ShutdownGraceful,
    ShutdownForced,
    ExecuteProcess,
    WaitForProcess,
    SignalProcess,
    ResizeConsole,
    GetProperties,
    ModifySettings,
    NegotiateProtocol,
    DumpStacks,
    DeleteContainerState,
    UpdateContainer,
    LifecycleNotification,
    NotifyContainer,
}

impl Operation {
    fn from_bits(bits: u32) -> Option<Operation> {
        use Operation::*;
        Some(match bits {
            1 => Create,
            2 => Start,
            3 => ShutdownGraceful,
            4 => ShutdownForced,
            5 => ExecuteProcess,
            6 => WaitForProcess,
            7 => SignalProcess,
            8 => ResizeConsole,
            9 => GetProperties,
            10 => ModifySettings,
            11 => NegotiateProtocol,
            12 => DumpStacks,
            13 => DeleteContainerState,
            14 => UpdateContainer,
            15 => LifecycleNotification,
            16 => NotifyContainer,
            _ => return None,
        })
    }

    fn bits(self) -> u32 {
        use Operation::*;
        match self {
            Create => 1,
            Start => 2,
            ShutdownGraceful => 3,
            ShutdownForced => 4,
            ExecuteProcess => 5,
            WaitForProcess => 6,
            SignalProcess => 7,
            ResizeConsole => 8,
            GetProperties => 9,
            ModifySettings => 10,
            NegotiateProtocol => 11,
            DumpStacks => 12,
            DeleteContainerState => 13,
            UpdateContainer => 14,
            LifecycleNotification => 15,
            NotifyContainer => 16,
        }
    }
}

const VERSION_V1: u32 = 0x01;

/// The 32-bit identifier packed from `(type, category, operation, version)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIdentifier {
    pub message_type: MessageType,
    pub category: Category,
    pub operation: Operation,
}

impl MessageIdentifier {
    pub fn new(message_type: MessageType, category: Category, operation: Operation) -> Self {
        MessageIdentifier {
            message_type,
            category,
            operation,
        }
    }

    pub fn request(category: Category, operation: Operation) -> Self {
        Self::new(MessageType::Request, category, operation)
    }

    /// Returns the same identifier with its type bits replaced, the other
    /// three bitfields preserved. Used to turn a request id into the
    /// matching response id when writing responses in tests/fakes.
    pub fn with_type(self, message_type: MessageType) -> Self {
        MessageIdentifier {
            message_type,
            ..self
        }
    }

    pub fn encode(self) -> u32 {
        (self.message_type.bits() << 28)
            | (self.category.bits() << 20)
            | (self.operation.bits() << 8)
            | VERSION_V1
    }

    pub fn decode(raw: u32) -> Result<Self> {
        let message_type = (raw >> 28) & 0xF;
        let category = (raw >> 20) & 0xFF;
        let operation = (raw >> 8) & 0xFFF;
        let version = raw & 0xFF;

        if version != VERSION_V1 {
            return Err(BridgeError::Transport(format!(
                "unsupported message version {version:#x}"
            )));
        }

        let message_type = MessageType::from_bits(message_type)
            .ok_or_else(|| BridgeError::Transport(format!("unknown message type {message_type:#x}")))?;
        let category = Category::from_bits(category)
            .ok_or_else(|| BridgeError::Transport(format!("unknown message category {category:#x}")))?;
        let operation = Operation::from_bits(operation)
            .ok_or_else(|| BridgeError::Transport(format!("unknown message operation {operation:#x}")))?;

        Ok(MessageIdentifier {
            message_type,
            category,
            operation,
        })
    }
}

/// The 16-byte wire header: identifier, total size (header included), and
/// the correlation id (0 for notifications).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub identifier: MessageIdentifier,
    pub total_size: u32,
    pub id: u64,
}

impl MessageHeader {
    pub fn encode_into(&self, buf: &mut [u8; crate::constants::HEADER_SIZE]) {
        buf[0..4].copy_from_slice(&self.identifier.encode().to_le_bytes());
        buf[4..8].copy_from_slice(&self.total_size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
    }

    pub fn decode(buf: &[u8; crate::constants::HEADER_SIZE]) -> Result<Self> {
        let identifier = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let total_size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let id = u64::from_le_bytes(buf[8..16].try_into().unwrap());

        Ok(MessageHeader {
            identifier: MessageIdentifier::decode(identifier)?,
            total_size,
            id,
        })
    }
}
