//! Wire codecs.
//!
//! A codec turns a [`Message`] into bytes and back. The codec is chosen once,
//! from [`CodecKind`], when the transport is constructed; peers that talk to
//! each other must use the same kind.
//!
//! Binary codecs produce self-delimiting MessagePack values and can be
//! decoded straight off the stream with [`WireCodec::decode_prefix`].
//! Textual codecs rely on the length-prefixed framing in [`crate::framing`].

use crate::error::{WireError, WireResult};
use peerlink_types::config::CodecKind;
use peerlink_types::message::{Message, Value};
use std::io::{Cursor, ErrorKind};
use std::sync::Arc;

/// Encode/decode strategy for messages on the wire.
pub trait WireCodec: Send + Sync + 'static {
    /// Which codec this is.
    fn kind(&self) -> CodecKind;

    /// Serialize a message (without any frame header).
    fn encode(&self, msg: &Message) -> WireResult<Vec<u8>>;

    /// Deserialize one complete payload.
    fn decode(&self, bytes: &[u8]) -> WireResult<Message>;

    /// Whether the stream needs the explicit 8-digit length header.
    fn needs_framing(&self) -> bool;

    /// Decode one message from the front of `bytes`.
    ///
    /// Returns the message and the number of bytes it occupied, or `None`
    /// when `bytes` holds only part of a value. Only meaningful for codecs
    /// that do not need framing.
    fn decode_prefix(&self, bytes: &[u8]) -> WireResult<Option<(Message, usize)>> {
        if bytes.is_empty() {
            return Ok(None);
        }
        let msg = self.decode(bytes)?;
        Ok(Some((msg, bytes.len())))
    }
}

/// Build the codec for a configured kind.
pub fn codec_for(kind: CodecKind) -> Arc<dyn WireCodec> {
    match kind {
        CodecKind::Binary => Arc::new(BinaryCodec::new(false)),
        CodecKind::BinaryCompat => Arc::new(BinaryCodec::new(true)),
        CodecKind::Document => Arc::new(DocumentCodec),
        CodecKind::StructuredText => Arc::new(StructuredTextCodec),
    }
}

/// MessagePack codec.
///
/// The compatibility mode writes the envelope as a sequence of `[key, value]`
/// pairs instead of a map, which is what older peers expect.
#[derive(Debug, Clone, Copy)]
pub struct BinaryCodec {
    compat: bool,
}

impl BinaryCodec {
    pub fn new(compat: bool) -> Self {
        Self { compat }
    }

    pub fn is_compat(&self) -> bool {
        self.compat
    }
}

fn is_incomplete(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

impl WireCodec for BinaryCodec {
    fn kind(&self) -> CodecKind {
        if self.compat {
            CodecKind::BinaryCompat
        } else {
            CodecKind::Binary
        }
    }

    fn encode(&self, msg: &Message) -> WireResult<Vec<u8>> {
        let bytes = if self.compat {
            let pairs: Vec<(&str, &Value)> = msg.iter().collect();
            rmp_serde::to_vec(&pairs)
        } else {
            rmp_serde::to_vec_named(msg)
        };
        bytes.map_err(|e| WireError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> WireResult<Message> {
        match self.decode_prefix(bytes)? {
            Some((msg, used)) if used == bytes.len() => Ok(msg),
            Some((_, used)) => Err(WireError::Codec(format!(
                "{} trailing bytes after message",
                bytes.len() - used
            ))),
            None => Err(WireError::Codec("truncated message".into())),
        }
    }

    fn needs_framing(&self) -> bool {
        false
    }

    fn decode_prefix(&self, bytes: &[u8]) -> WireResult<Option<(Message, usize)>> {
        if bytes.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(bytes);
        let decoded = if self.compat {
            rmp_serde::from_read::<_, Vec<(String, Value)>>(&mut cursor).map(Message::from_entries)
        } else {
            rmp_serde::from_read::<_, Message>(&mut cursor)
        };
        match decoded {
            Ok(msg) => Ok(Some((msg, cursor.position() as usize))),
            Err(e) if is_incomplete(&e) => Ok(None),
            Err(e) => Err(WireError::Codec(e.to_string())),
        }
    }
}

/// YAML document codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentCodec;

impl WireCodec for DocumentCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Document
    }

    fn encode(&self, msg: &Message) -> WireResult<Vec<u8>> {
        serde_yaml::to_string(msg)
            .map(String::into_bytes)
            .map_err(|e| WireError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> WireResult<Message> {
        serde_yaml::from_slice(bytes).map_err(|e| WireError::Codec(e.to_string()))
    }

    fn needs_framing(&self) -> bool {
        true
    }
}

/// JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredTextCodec;

impl WireCodec for StructuredTextCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::StructuredText
    }

    fn encode(&self, msg: &Message) -> WireResult<Vec<u8>> {
        serde_json::to_vec(msg).map_err(|e| WireError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> WireResult<Message> {
        serde_json::from_slice(bytes).map_err(|e| WireError::Codec(e.to_string()))
    }

    fn needs_framing(&self) -> bool {
        true
    }
}
