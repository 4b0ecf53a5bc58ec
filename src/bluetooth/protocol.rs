//! Wire Codec
//!
//! Text frames exchanged over the message characteristic. A frame is a
//! channel prefix followed by UTF-8 text:
//!
//! - `BRD:<content>` for the public broadcast channel
//! - `PRV:<sender name>|<content>` for a private conversation
//!
//! Carrying the sender's display name inside every private frame lets the
//! receiver key the conversation by name with no handshake.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FrameError;

/// GATT service exposed by every node.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000b81d_0000_1000_8000_00805f9b34fb);

/// Writable characteristic carrying frames.
pub const MESSAGE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000b81d_0001_1000_8000_00805f9b34fb);

/// MTU requested before writing so longer frames are not truncated.
pub const REQUESTED_MTU: u16 = 512;

/// Reserved channel identifier of the public channel.
pub const BROADCAST_CHANNEL: &str = "BROADCAST";

pub const BROADCAST_PREFIX: &str = "BRD:";
pub const PRIVATE_PREFIX: &str = "PRV:";
pub const NAME_SEPARATOR: char = '|';

/// Result of decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedFrame {
    pub channel_id: String,
    pub sender_name: String,
    pub content: String,
    pub is_broadcast: bool,
}

impl DecodedFrame {
    fn broadcast(sender_name: &str, content: &str) -> Self {
        Self {
            channel_id: BROADCAST_CHANNEL.to_string(),
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            is_broadcast: true,
        }
    }

    /// Private frames are keyed by the sender's display name, never its address.
    /// The reserved broadcast id cannot name a private channel.
    fn private(sender_name: &str, content: &str) -> Result<Self, FrameError> {
        if sender_name == BROADCAST_CHANNEL {
            return Err(FrameError::UnrecognizedFrame);
        }
        Ok(Self {
            channel_id: sender_name.to_string(),
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            is_broadcast: false,
        })
    }
}

/// Stateless frame encoder/decoder.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode message text into a frame.
    pub fn encode(content: &str, is_broadcast: bool, self_display_name: &str) -> Vec<u8> {
        let frame = if is_broadcast {
            format!("{BROADCAST_PREFIX}{content}")
        } else {
            format!("{PRIVATE_PREFIX}{self_display_name}{NAME_SEPARATOR}{content}")
        };
        frame.into_bytes()
    }

    /// Decode a frame. `fallback_sender_name` is the transport-reported
    /// identity, used for broadcast frames and legacy private frames that
    /// carry no sender name.
    pub fn decode(bytes: &[u8], fallback_sender_name: &str) -> Result<DecodedFrame, FrameError> {
        let text = std::str::from_utf8(bytes).map_err(|_| FrameError::UnrecognizedFrame)?;

        if let Some(content) = text.strip_prefix(BROADCAST_PREFIX) {
            return Ok(DecodedFrame::broadcast(fallback_sender_name, content));
        }

        if let Some(rest) = text.strip_prefix(PRIVATE_PREFIX) {
            // Only the first separator delimits the name; content may contain more.
            return match rest.split_once(NAME_SEPARATOR) {
                Some((name, content)) if !name.is_empty() => DecodedFrame::private(name, content),
                Some((_, content)) => DecodedFrame::private(fallback_sender_name, content),
                None => DecodedFrame::private(fallback_sender_name, rest),
            };
        }

        Err(FrameError::UnrecognizedFrame)
    }

    /// Decode a write received in the responder role. Unprefixed text from
    /// older peers is kept as private content from the transport-reported
    /// sender rather than dropped.
    pub fn decode_inbound(bytes: &[u8], fallback_sender_name: &str) -> Result<DecodedFrame, FrameError> {
        let text = std::str::from_utf8(bytes).map_err(|_| FrameError::UnrecognizedFrame)?;

        if text.starts_with(BROADCAST_PREFIX) || text.starts_with(PRIVATE_PREFIX) {
            Self::decode(bytes, fallback_sender_name)
        } else if text.is_empty() {
            Err(FrameError::UnrecognizedFrame)
        } else {
            DecodedFrame::private(fallback_sender_name, text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_broadcast_frame() {
        let frame = FrameCodec::decode(b"BRD:Hello", "AA:BB").unwrap();
        assert!(frame.is_broadcast);
        assert_eq!(frame.channel_id, "BROADCAST");
        assert_eq!(frame.content, "Hello");
        assert_eq!(frame.sender_name, "AA:BB");
    }

    #[test]
    fn decode_private_frame_keys_channel_by_name() {
        let frame = FrameCodec::decode(b"PRV:Alice|Hi there", "AA:BB").unwrap();
        assert!(!frame.is_broadcast);
        assert_eq!(frame.channel_id, "Alice");
        assert_eq!(frame.sender_name, "Alice");
        assert_eq!(frame.content, "Hi there");
    }

    #[test]
    fn legacy_private_frame_falls_back_to_transport_identity() {
        let frame = FrameCodec::decode(b"PRV:legacyload", "Pixel 7").unwrap();
        assert_eq!(frame.content, "legacyload");
        assert_eq!(frame.sender_name, "Pixel 7");
        assert_eq!(frame.channel_id, "Pixel 7");
    }

    #[test]
    fn empty_name_falls_back_to_transport_identity() {
        let frame = FrameCodec::decode(b"PRV:|hey", "Pixel 7").unwrap();
        assert_eq!(frame.sender_name, "Pixel 7");
        assert_eq!(frame.content, "hey");
    }

    #[test]
    fn private_content_splits_on_first_separator_only() {
        let frame = FrameCodec::decode(b"PRV:Bob|a|b|c", "x").unwrap();
        assert_eq!(frame.sender_name, "Bob");
        assert_eq!(frame.content, "a|b|c");
    }

    #[test]
    fn unprefixed_input_is_rejected() {
        assert_eq!(
            FrameCodec::decode(b"hello", "x"),
            Err(FrameError::UnrecognizedFrame)
        );
        assert_eq!(
            FrameCodec::decode(&[0xff, 0xfe], "x"),
            Err(FrameError::UnrecognizedFrame)
        );
    }

    #[test]
    fn inbound_accepts_unprefixed_text_as_legacy() {
        let frame = FrameCodec::decode_inbound(b"plain text", "Old Phone").unwrap();
        assert!(!frame.is_broadcast);
        assert_eq!(frame.channel_id, "Old Phone");
        assert_eq!(frame.content, "plain text");
    }

    #[test]
    fn inbound_still_rejects_binary_and_empty_payloads() {
        assert!(FrameCodec::decode_inbound(&[0xc3, 0x28], "x").is_err());
        assert!(FrameCodec::decode_inbound(b"", "x").is_err());
    }

    #[test]
    fn reserved_broadcast_id_cannot_name_a_private_sender() {
        assert_eq!(
            FrameCodec::decode(b"PRV:BROADCAST|sneaky", "AA:BB"),
            Err(FrameError::UnrecognizedFrame)
        );
        assert_eq!(
            FrameCodec::decode_inbound(b"PRV:BROADCAST|sneaky", "AA:BB"),
            Err(FrameError::UnrecognizedFrame)
        );
        assert_eq!(
            FrameCodec::decode_inbound(b"plain text", "BROADCAST"),
            Err(FrameError::UnrecognizedFrame)
        );
    }

    #[test]
    fn decode_inverts_encode() {
        let cases = [("hello world", true), ("see you at camp 2", false), ("", false)];
        for (content, is_broadcast) in cases {
            let bytes = FrameCodec::encode(content, is_broadcast, "Dina");
            let frame = FrameCodec::decode(&bytes, "radio").unwrap();
            assert_eq!(frame.is_broadcast, is_broadcast);
            assert_eq!(frame.content, content);
            if !is_broadcast {
                assert_eq!(frame.channel_id, "Dina");
            }
        }
    }

    #[test]
    fn encode_layout() {
        assert_eq!(FrameCodec::encode("x", true, "Me"), b"BRD:x".to_vec());
        assert_eq!(FrameCodec::encode("x", false, "Me"), b"PRV:Me|x".to_vec());
    }
}
