//! The framed message transport.
//!
//! Reads and writes a fixed 16-byte header plus a JSON body over any
//! full-duplex byte stream. There is no partial-message framing state:
//! every write is all-or-nothing, and every read either yields a complete
//! message or a fatal error.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::constants::HEADER_SIZE;
use crate::envelope::RequestBase;
use crate::error::{BridgeError, Result};
use crate::message::{MessageHeader, MessageIdentifier};

/// A decoded inbound message: its correlation id, identifier, and raw body
/// bytes. The body is handed back undecoded so the bridge can choose how
/// to interpret it (response vs. notification).
#[derive(Debug)]
pub struct InboundMessage {
    pub id: u64,
    pub identifier: MessageIdentifier,
    pub body: Vec<u8>,
}

/// Reads framed messages off an `AsyncRead` half. Owned by the bridge's
/// receive loop; no other task reads from it.
pub struct MessageReader<R> {
    stream: R,
    max_message_size: u32,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Builds a reader enforcing the default inbound size cap
    /// (`config::DEFAULT_MAX_MESSAGE_SIZE`). The bridge itself always uses
    /// `with_max_message_size` so the cap tracks `BridgeConfig`; this
    /// constructor exists for callers (tests, fakes) that don't carry a
    /// config around.
    pub fn new(stream: R) -> Self {
        Self::with_max_message_size(stream, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(stream: R, max_message_size: u32) -> Self {
        MessageReader {
            stream,
            max_message_size,
        }
    }

    /// Reads one complete message. Returns `Ok(None)` on a clean EOF at a
    /// message boundary. Any other failure — a short read, an oversize or
    /// undersize header, EOF mid-body — is fatal for the bridge.
    pub async fn read_message(&mut self) -> Result<Option<InboundMessage>> {
        let mut header_buf = [0u8; HEADER_SIZE];
        match read_exact_or_eof(&mut self.stream, &mut header_buf).await? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Full => {}
        }

        let header = MessageHeader::decode(&header_buf)?;

        if header.total_size < HEADER_SIZE as u32 {
            return Err(BridgeError::Transport(format!(
                "message size {} is smaller than the header",
                header.total_size
            )));
        }
        if header.total_size > self.max_message_size {
            return Err(BridgeError::Transport(format!(
                "message size {} exceeds the {} byte limit",
                header.total_size, self.max_message_size
            )));
        }

        let body_len = (header.total_size as usize) - HEADER_SIZE;
        let mut body = vec![0u8; body_len];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| BridgeError::Transport(format!("unexpected eof reading body: {e}")))?;

        Ok(Some(InboundMessage {
            id: header.id,
            identifier: header.identifier,
            body,
        }))
    }
}

enum ReadOutcome {
    Full,
    Eof,
}

/// Like `read_exact`, but a zero-byte read at the very start of the call is
/// reported as a clean EOF instead of an error; a short read after any
/// bytes have landed is still fatal.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut [u8],
) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(ReadOutcome::Eof);
            }
            return Err(BridgeError::Transport(
                "unexpected eof reading message header".to_string(),
            ));
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

/// Writes framed messages to an `AsyncWrite` half. Owned by the bridge's
/// send loop; no other task writes to it.
pub struct MessageWriter<W> {
    stream: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(stream: W) -> Self {
        MessageWriter { stream }
    }

    /// Encodes `(identifier, id, payload)` into one contiguous buffer and
    /// writes it in a single call. Partial failure is fatal: there is no
    /// retry of a half-sent message.
    pub async fn write_message<T: serde::Serialize>(
        &mut self,
        identifier: MessageIdentifier,
        id: u64,
        payload: &T,
    ) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        let total_size = (HEADER_SIZE + body.len()) as u32;

        let header = MessageHeader {
            identifier,
            total_size,
            id,
        };

        let mut buf = Vec::with_capacity(total_size as usize);
        let mut header_buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut header_buf);
        buf.extend_from_slice(&header_buf);
        buf.extend_from_slice(&body);

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Convenience for building a request payload by embedding
/// `RequestBase` alongside an opaque extra body. Most requests the core
/// issues are `{ ...RequestBase fields, <op-specific fields> }`; since
/// `serde_json::Value` merges flatly via `#[serde(flatten)]`, callers
/// compose their request structs the same way.
pub fn merge_request_base(base: RequestBase, extra: serde_json::Value) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(base)?;
    if let (Some(obj), serde_json::Value::Object(extra_obj)) = (value.as_object_mut(), extra) {
        obj.extend(extra_obj);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Category, MessageType, Operation};
    use serde_json::json;

    #[tokio::test]
    async fn write_then_read_round_trips_body() {
        let (a, b) = tokio::io::duplex(4096);
        let (_a_read, a_write) = tokio::io::split(a);
        let (b_read, _b_write) = tokio::io::split(b);

        let mut writer = MessageWriter::new(a_write);
        let mut reader = MessageReader::new(b_read);

        let payload = json!({"Hello": "<world> & friends"});
        writer
            .write_message(
                MessageIdentifier::request(Category::Container, Operation::Create),
                7,
                &payload,
            )
            .await
            .unwrap();

        let message = reader.read_message().await.unwrap().unwrap();
        assert_eq!(message.id, 7);
        assert_eq!(message.identifier.message_type, MessageType::Request);

        let decoded: serde_json::Value = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn html_characters_survive_round_trip_unescaped() {
        let (a, b) = tokio::io::duplex(4096);
        let (_a_read, a_write) = tokio::io::split(a);
        let (b_read, _b_write) = tokio::io::split(b);

        let mut writer = MessageWriter::new(a_write);
        let mut reader = MessageReader::new(b_read);

        writer
            .write_message(
                MessageIdentifier::request(Category::Container, Operation::ModifySettings),
                1,
                &json!({"Script": "<a>&amp;</a>"}),
            )
            .await
            .unwrap();

        let message = reader.read_message().await.unwrap().unwrap();
        // serde_json never HTML-escapes, so the raw body bytes already
        // contain the literal angle brackets and ampersand.
        let body_text = String::from_utf8(message.body).unwrap();
        assert!(body_text.contains("<a>&amp;</a>"));
    }

    #[tokio::test]
    async fn clean_eof_at_message_boundary_is_none() {
        let (a, b) = tokio::io::duplex(16);
        drop(a);
        let (b_read, _b_write) = tokio::io::split(b);
        let mut reader = MessageReader::new(b_read);
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undersized_total_size_is_rejected() {
        let (a, b) = tokio::io::duplex(64);
        let (_a_read, mut a_write) = tokio::io::split(a);
        let (b_read, _b_write) = tokio::io::split(b);
        let mut reader = MessageReader::new(b_read);

        let identifier = MessageIdentifier::request(Category::Container, Operation::Create);
        let header = crate::message::MessageHeader {
            identifier,
            total_size: 4,
            id: 1,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut buf);
        use tokio::io::AsyncWriteExt;
        a_write.write_all(&buf).await.unwrap();

        assert!(reader.read_message().await.is_err());
    }

    #[tokio::test]
    async fn oversized_total_size_is_rejected() {
        let (a, b) = tokio::io::duplex(64);
        let (_a_read, mut a_write) = tokio::io::split(a);
        let (b_read, _b_write) = tokio::io::split(b);
        let mut reader = MessageReader::new(b_read);

        let identifier = MessageIdentifier::request(Category::Container, Operation::Create);
        let header = crate::message::MessageHeader {
            identifier,
            total_size: DEFAULT_MAX_MESSAGE_SIZE + 1,
            id: 1,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut buf);
        use tokio::io::AsyncWriteExt;
        a_write.write_all(&buf).await.unwrap();

        assert!(reader.read_message().await.is_err());
    }
}
