//! Sub-channel frame codec.
//!
//! Each message on a multiplexed physical channel is one frame:
//!
//! ```text
//! [u8 L] [id: L bytes] [body: remaining bytes]
//! ```
//!
//! - `L` is the id length, so ids are at most 255 bytes.
//! - An empty body is the close signal for the addressed sub-channel.
//! - An empty message (no `L` byte at all) carries nothing and is ignored.

use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Longest sub-channel id the one-byte length field can express.
pub const MAX_ID_LEN: usize = u8::MAX as usize;

/// A decoded sub-channel frame. `id` and `body` share the message buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    /// Sub-channel id.
    pub id: Bytes,
    /// Message body; empty for a close signal.
    pub body: Bytes,
}

impl MuxFrame {
    /// Returns true if this frame closes its sub-channel.
    pub fn is_close(&self) -> bool {
        self.body.is_empty()
    }

    /// Decode one message.
    ///
    /// Returns `Ok(None)` for an empty message.
    ///
    /// # Errors
    ///
    /// Returns an error if `L` claims more id bytes than the message holds.
    pub fn decode(message: &Bytes) -> Result<Option<Self>> {
        let Some(&id_len) = message.first() else {
            return Ok(None);
        };
        let id_end = 1 + usize::from(id_len);
        if message.len() < id_end {
            bail!(
                "Truncated frame: id length {id_len}, only {} byte(s) follow",
                message.len() - 1
            );
        }

        Ok(Some(Self {
            id: message.slice(1..id_end),
            body: message.slice(id_end..),
        }))
    }
}

/// Encode a frame for sub-channel `id`.
///
/// # Errors
///
/// Returns an error if `id` is longer than [`MAX_ID_LEN`].
pub fn encode_frame(id: &[u8], body: &[u8]) -> Result<Bytes> {
    let Ok(id_len) = u8::try_from(id.len()) else {
        bail!("Sub-channel id too long: {} bytes (max {MAX_ID_LEN})", id.len());
    };
    let mut buf = BytesMut::with_capacity(1 + id.len() + body.len());
    buf.put_u8(id_len);
    buf.put_slice(id);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Encode the close signal for sub-channel `id`.
///
/// # Errors
///
/// Returns an error if `id` is longer than [`MAX_ID_LEN`].
pub fn encode_close(id: &[u8]) -> Result<Bytes> {
    encode_frame(id, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_id_lengths() {
        for len in 0..=MAX_ID_LEN {
            let id: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let body = format!("body for {len}");

            let encoded = encode_frame(&id, body.as_bytes()).unwrap();
            let frame = MuxFrame::decode(&encoded).unwrap().unwrap();

            assert_eq!(&frame.id[..], &id[..]);
            assert_eq!(&frame.body[..], body.as_bytes());
        }
    }

    #[test]
    fn test_decode_known_wire_bytes() {
        let frame = MuxFrame::decode(&Bytes::from_static(b"\x03abcHELLO"))
            .unwrap()
            .unwrap();
        assert_eq!(&frame.id[..], b"abc");
        assert_eq!(&frame.body[..], b"HELLO");
        assert!(!frame.is_close());
    }

    #[test]
    fn test_empty_body_is_close_signal() {
        let frame = MuxFrame::decode(&Bytes::from_static(b"\x03abc"))
            .unwrap()
            .unwrap();
        assert_eq!(&frame.id[..], b"abc");
        assert!(frame.is_close());
        assert_eq!(encode_close(b"abc").unwrap(), Bytes::from_static(b"\x03abc"));
    }

    #[test]
    fn test_empty_message_ignored() {
        assert_eq!(MuxFrame::decode(&Bytes::new()).unwrap(), None);
    }

    #[test]
    fn test_empty_id_allowed() {
        let frame = MuxFrame::decode(&Bytes::from_static(b"\x00data"))
            .unwrap()
            .unwrap();
        assert!(frame.id.is_empty());
        assert_eq!(&frame.body[..], b"data");
    }

    #[test]
    fn test_truncated_id_rejected() {
        let err = MuxFrame::decode(&Bytes::from_static(b"\x09ab")).unwrap_err();
        assert!(err.to_string().contains("Truncated"), "unexpected error: {err}");
    }

    #[test]
    fn test_oversized_id_not_encoded() {
        let id = vec![b'x'; MAX_ID_LEN + 1];
        assert!(encode_frame(&id, b"body").is_err());
    }
}
