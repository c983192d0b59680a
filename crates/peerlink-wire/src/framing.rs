//! Stream framing.
//!
//! TCP does not preserve message boundaries. Textual codecs therefore prefix
//! every payload with its length as an 8-character, zero-padded ASCII
//! decimal header:
//!
//! ```text
//! +--------------------+------------------+
//! | "00000042" (8 B)   | payload (42 B)   |
//! +--------------------+------------------+
//! ```
//!
//! Binary codecs are self-delimiting and are decoded directly off the buffer.

use crate::codec::WireCodec;
use crate::error::{WireError, WireResult, MAX_FRAME_LEN};
use bytes::{Buf, BytesMut};
use peerlink_types::message::Message;
use std::sync::Arc;

/// Width of the textual length header.
pub const HEADER_LEN: usize = 8;

/// Prefix a textual payload with its 8-digit length header.
///
/// Fails with [`WireError::MessageTooLong`] when the length needs more than
/// eight digits; payloads are never truncated.
pub fn encode_frame(payload: &[u8]) -> WireResult<Vec<u8>> {
    let header = format!("{:08}", payload.len());
    if header.len() > HEADER_LEN || payload.len() > MAX_FRAME_LEN {
        return Err(WireError::MessageTooLong { len: payload.len() });
    }
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Parse an 8-byte length header.
pub fn decode_header(header: &[u8]) -> WireResult<usize> {
    if header.len() != HEADER_LEN || !header.iter().all(u8::is_ascii_digit) {
        return Err(WireError::MalformedFrame(format!(
            "invalid length header {:?}",
            String::from_utf8_lossy(header)
        )));
    }
    // All-digit ASCII, so both conversions succeed.
    std::str::from_utf8(header)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| WireError::MalformedFrame("unparseable length header".into()))
}

/// Reassembles length-prefixed payloads from arbitrary read chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Declared length of the frame being assembled, once its header is read.
    pending: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete payload, or `None` until enough bytes have arrived.
    pub fn next_frame(&mut self) -> WireResult<Option<Vec<u8>>> {
        let len = match self.pending {
            Some(len) => len,
            None => {
                if self.buf.len() < HEADER_LEN {
                    return Ok(None);
                }
                let len = decode_header(&self.buf[..HEADER_LEN])?;
                self.buf.advance(HEADER_LEN);
                self.pending = Some(len);
                len
            }
        };

        if self.buf.len() < len {
            self.buf.reserve(len - self.buf.len());
            return Ok(None);
        }

        self.pending = None;
        Ok(Some(self.buf.split_to(len).to_vec()))
    }
}

/// Encode a message into the exact bytes written to the socket.
pub fn encode_for_wire(codec: &dyn WireCodec, msg: &Message) -> WireResult<Vec<u8>> {
    let payload = codec.encode(msg)?;
    if codec.needs_framing() {
        encode_frame(&payload)
    } else {
        Ok(payload)
    }
}

/// Turns a byte stream into messages using the configured codec.
pub struct MessageDecoder {
    codec: Arc<dyn WireCodec>,
    frames: FrameDecoder,
}

impl MessageDecoder {
    pub fn new(codec: Arc<dyn WireCodec>) -> Self {
        Self {
            codec,
            frames: FrameDecoder::new(),
        }
    }

    /// Append bytes read from the stream.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.frames.push(chunk);
    }

    /// Next complete message, or `None` until enough bytes have arrived.
    pub fn next_message(&mut self) -> WireResult<Option<Message>> {
        if self.codec.needs_framing() {
            return match self.frames.next_frame()? {
                Some(payload) => self.codec.decode(&payload).map(Some),
                None => Ok(None),
            };
        }

        match self.codec.decode_prefix(&self.frames.buf)? {
            Some((msg, used)) => {
                self.frames.buf.advance(used);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::codec_for;
    use peerlink_types::config::CodecKind;
    use peerlink_types::message::{actions, Process};

    #[test]
    fn test_header_is_zero_padded() {
        let payload = vec![b'x'; 42];
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(&frame[..8], b"00000042");
        assert_eq!(frame.len(), 50);
    }

    #[test]
    fn test_partial_writes_reassemble() {
        let payload: Vec<u8> = (0..42u8).map(|b| b'a' + (b % 26)).collect();
        let frame = encode_frame(&payload).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&frame[..12]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&frame[12..]);
        assert_eq!(decoder.next_frame().unwrap(), Some(payload));
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_header_split_across_reads() {
        let frame = encode_frame(b"hello").unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&frame[3..]);
        assert_eq!(decoder.next_frame().unwrap().as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = encode_frame(b"one").unwrap();
        bytes.extend(encode_frame(b"").unwrap());
        bytes.extend(encode_frame(b"three").unwrap());
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.next_frame().unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(decoder.next_frame().unwrap().as_deref(), Some(&b""[..]));
        assert_eq!(decoder.next_frame().unwrap().as_deref(), Some(&b"three"[..]));
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_malformed_header() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"00x00042payload");
        assert!(matches!(
            decoder.next_frame(),
            Err(WireError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_message_too_long() {
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        let err = encode_frame(&payload).unwrap_err();
        assert!(matches!(err, WireError::MessageTooLong { len } if len == MAX_FRAME_LEN + 1));
    }

    #[test]
    fn test_message_decoder_textual_partial() {
        let codec = codec_for(CodecKind::StructuredText);
        let msg = Message::with_process(Process::Management).with("agentA", actions::ADD);
        let bytes = encode_for_wire(codec.as_ref(), &msg).unwrap();
        let declared = decode_header(&bytes[..8]).unwrap();
        assert_eq!(declared, bytes.len() - 8);

        let mut decoder = MessageDecoder::new(codec);
        let split = bytes.len() - 5;
        decoder.feed(&bytes[..split]);
        assert!(decoder.next_message().unwrap().is_none());
        decoder.feed(&bytes[split..]);
        assert_eq!(decoder.next_message().unwrap(), Some(msg));
    }

    #[test]
    fn test_message_decoder_binary_stream() {
        for kind in [CodecKind::Binary, CodecKind::BinaryCompat, CodecKind::Document] {
            let codec = codec_for(kind);
            let first = Message::with_process(Process::Deliver).with("recipient", "echo");
            let second = Message::with_process(Process::Broadcast).with("n", 2i64);
            let mut bytes = encode_for_wire(codec.as_ref(), &first).unwrap();
            bytes.extend(encode_for_wire(codec.as_ref(), &second).unwrap());

            let mut decoder = MessageDecoder::new(codec);
            for chunk in bytes.chunks(7) {
                decoder.feed(chunk);
            }
            assert_eq!(decoder.next_message().unwrap(), Some(first));
            assert_eq!(decoder.next_message().unwrap(), Some(second));
            assert!(decoder.next_message().unwrap().is_none());
        }
    }
}
