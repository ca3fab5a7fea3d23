//! Message-mode transport codec for physical channels.
//!
//! TCP is a byte stream, so a message-mode [`Channel`](crate::channel::Channel)
//! restores message boundaries with a length prefix:
//!
//! ```text
//! [u32 LE length] [payload: length bytes]
//! ```
//!
//! Zero-length messages are legal and delivered as empty reads.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum message payload size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the length header in bytes.
const HEADER_LEN: usize = 4;

/// Encode one message into its wire form.
///
/// # Errors
///
/// Returns an error if the payload exceeds [`MAX_MESSAGE_SIZE`].
pub fn encode_message(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_MESSAGE_SIZE as usize {
        bail!(
            "Message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
            payload.len()
        );
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Incremental message decoder that handles partial reads.
///
/// Feed bytes via [`MessageDecoder::feed`] and extract complete messages.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: BytesMut,
}

impl MessageDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder and extract all complete messages.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a length header exceeds the size limit. The
    /// stream cannot be resynchronised after that, so callers should drop
    /// the connection.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        while self.buf.len() >= HEADER_LEN {
            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if length > MAX_MESSAGE_SIZE {
                bail!("Message too large: {length} bytes (max {MAX_MESSAGE_SIZE})");
            }

            let total = HEADER_LEN + length as usize;
            if self.buf.len() < total {
                self.buf.reserve(total - self.buf.len());
                break;
            }

            self.buf.advance(HEADER_LEN);
            messages.push(self.buf.split_to(length as usize).freeze());
        }

        Ok(messages)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_messages_in_single_feed() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_message(b"one").unwrap());
        wire.extend_from_slice(&encode_message(b"").unwrap());
        wire.extend_from_slice(&encode_message(b"three").unwrap());

        let mut decoder = MessageDecoder::new();
        let messages = decoder.feed(&wire).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(&messages[0][..], b"one");
        assert!(messages[1].is_empty());
        assert_eq!(&messages[2][..], b"three");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_partial_message_reassembly() {
        let encoded = encode_message(b"\x03abcHELLO").unwrap();
        let mut decoder = MessageDecoder::new();

        let mid = encoded.len() / 2;
        assert!(decoder.feed(&encoded[..mid]).unwrap().is_empty());
        assert!(decoder.has_partial());

        let messages = decoder.feed(&encoded[mid..]).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0][..], b"\x03abcHELLO");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_byte_at_a_time() {
        let encoded = encode_message(b"xy").unwrap();
        let mut decoder = MessageDecoder::new();
        for (i, byte) in encoded.iter().enumerate() {
            let messages = decoder.feed(&[*byte]).unwrap();
            if i < encoded.len() - 1 {
                assert!(messages.is_empty());
            } else {
                assert_eq!(messages, vec![Bytes::from_static(b"xy")]);
            }
        }
    }

    #[test]
    fn test_oversized_header_rejected() {
        let buf = (MAX_MESSAGE_SIZE + 1).to_le_bytes();
        let mut decoder = MessageDecoder::new();
        assert!(decoder.feed(&buf).is_err());
    }

    #[test]
    fn test_oversized_payload_not_encoded() {
        let payload = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        assert!(encode_message(&payload).is_err());
    }
}
