//! Message framing and the typed-message seam.
//!
//! Wire format of one frame:
//!
//! ```text
//! [u32 BE type-name length][type-name bytes][u32 BE payload length][payload]
//! ```
//!
//! The runtime never looks inside a payload. Payload schemas are supplied by
//! the embedding application through a [`MessageRegistry`], which maps a type
//! name to a decoder function. Decoding only ever produces one of the four
//! [`DecodeOutcome`] variants.

use crate::runtime::Buffer;
use bytes::Bytes;
use downcast_rs::{impl_downcast, DowncastSync};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use tracing::{debug, warn};

/// Size of each length field in a frame header.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Largest type name or payload accepted by default.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A typed message that can travel inside a frame.
pub trait Message: DowncastSync + Debug {
    /// Name written into the frame header and used to look up the decoder.
    fn type_name(&self) -> &str;

    /// Serialize the payload (without framing) onto the tail of `out`.
    fn encode_payload(&self, out: &mut Buffer);
}

impl_downcast!(sync Message);

/// Decoder for one message type. Receives exactly the payload bytes.
pub type MessageDecoder = fn(&[u8]) -> Result<Box<dyn Message>, String>;

/// Result of trying to decode one frame from a buffer.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A full frame was decoded.
    Decoded {
        message: Box<dyn Message>,
        /// Bytes removed from the buffer.
        consumed: usize,
    },
    /// Not enough bytes buffered yet; nothing was consumed.
    Incomplete,
    /// The frame's type name has no registered decoder. The frame was consumed.
    UnknownType(String),
    /// The payload was rejected by its decoder, or the frame header is
    /// unusable. The frame was consumed.
    ParseError(String),
}

/// Type name → decoder map, populated at startup.
#[derive(Clone, Default)]
pub struct MessageRegistry {
    decoders: HashMap<String, MessageDecoder>,
}

impl MessageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register a decoder for `type_name`, replacing any previous one.
    pub fn register(&mut self, type_name: &str, decoder: MessageDecoder) -> &mut Self {
        debug!(type_name, "Registering message decoder");
        self.decoders.insert(type_name.to_string(), decoder);
        self
    }

    /// Register a message type whose payload is JSON.
    pub fn register_json<T>(&mut self, type_name: &str) -> &mut Self
    where
        T: Message + DeserializeOwned,
    {
        self.register(type_name, decode_json::<T>)
    }

    /// Check if `type_name` has a decoder.
    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Number of registered message types.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Check if no message types are registered.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    fn get(&self, type_name: &str) -> Option<MessageDecoder> {
        self.decoders.get(type_name).copied()
    }
}

impl Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Serialize `value` as JSON into `out`, for use in [`Message::encode_payload`].
pub fn json_payload<T: Serialize>(value: &T, out: &mut Buffer) {
    if let Err(e) = serde_json::to_writer(&mut *out, value) {
        warn!(error = %e, "Failed to serialize JSON payload");
    }
}

fn decode_json<T>(payload: &[u8]) -> Result<Box<dyn Message>, String>
where
    T: Message + DeserializeOwned,
{
    serde_json::from_slice::<T>(payload)
        .map(|message| Box::new(message) as Box<dyn Message>)
        .map_err(|e| e.to_string())
}

/// Append one framed message to `buf`.
///
/// The payload is serialized straight into `buf` behind a placeholder length
/// field, which is patched once the payload size is known.
pub fn encode_frame(message: &dyn Message, buf: &mut Buffer) {
    let name = message.type_name().as_bytes();
    buf.append_u32(name.len() as u32);
    buf.append(name);

    let length_at = buf.len();
    buf.append_u32(0);
    message.encode_payload(buf);
    let payload_len = buf.len() - length_at - LENGTH_FIELD_SIZE;
    buf.set_u32_at(length_at, payload_len as u32);
}

/// Encode one framed message into an owned byte string.
pub fn encode_to_bytes(message: &dyn Message) -> Bytes {
    let mut buf = Buffer::new();
    encode_frame(message, &mut buf);
    Bytes::from(buf.take_all())
}

/// Try to decode one frame from the front of `buf`.
///
/// Restartable: an `Incomplete` outcome leaves every buffered byte in place so
/// the call can be repeated once more bytes arrive. A length field larger than
/// `max_frame_size` can never be satisfied, so the buffer is cleared and a
/// parse error returned.
pub fn decode_frame(
    buf: &mut Buffer,
    registry: &MessageRegistry,
    max_frame_size: usize,
) -> DecodeOutcome {
    let header = 2 * LENGTH_FIELD_SIZE;
    if buf.len() < header {
        return DecodeOutcome::Incomplete;
    }

    let Some(name_len) = buf.peek_u32_at(0).map(|n| n as usize) else {
        return DecodeOutcome::Incomplete;
    };
    if name_len > max_frame_size {
        buf.clear();
        return DecodeOutcome::ParseError(format!("type name length {name_len} exceeds limit"));
    }
    if buf.len() < header + name_len {
        return DecodeOutcome::Incomplete;
    }

    let Some(payload_len) = buf
        .peek_u32_at(LENGTH_FIELD_SIZE + name_len)
        .map(|n| n as usize)
    else {
        return DecodeOutcome::Incomplete;
    };
    if payload_len > max_frame_size {
        buf.clear();
        return DecodeOutcome::ParseError(format!("payload length {payload_len} exceeds limit"));
    }

    let total = header + name_len + payload_len;
    if buf.len() < total {
        return DecodeOutcome::Incomplete;
    }

    let frame = buf.as_slice();
    let name_bytes = &frame[LENGTH_FIELD_SIZE..LENGTH_FIELD_SIZE + name_len];
    let payload = &frame[header + name_len..total];

    let outcome = match std::str::from_utf8(name_bytes)
        .ok()
        .and_then(|name| registry.get(name))
    {
        Some(decoder) => match decoder(payload) {
            Ok(message) => DecodeOutcome::Decoded {
                message,
                consumed: total,
            },
            Err(detail) => DecodeOutcome::ParseError(detail),
        },
        None => DecodeOutcome::UnknownType(String::from_utf8_lossy(name_bytes).into_owned()),
    };

    buf.consume(total);
    outcome
}
