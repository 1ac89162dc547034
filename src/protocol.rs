//! The coordination wire protocol.
//!
//! Every frame on the wire is:
//!
//! ```text
//! +-----------+-----------+------------------+----------------+
//! | len: u32  | kind: u8  | generation: u64  | payload: bytes |
//! +-----------+-----------+------------------+----------------+
//! ```
//!
//! All integers are big-endian. `len` counts the kind, generation, and
//! payload bytes (everything after the prefix). The generation is the
//! fencing token the message was issued against; receivers drop frames
//! whose generation is older than the ownership table's current one for
//! the referenced region.
//!
//! [`Message`] is a closed tagged variant, so routing is an exhaustive
//! match and adding a kind is a compile-time-checked change.

use bytes::{BufMut, Bytes, BytesMut};
use nombytes::NomBytes;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::constants::{FRAME_HEADER_SIZE, LEN_PREFIX_SIZE};
use crate::encode::{ToByte, encode_nullable_string, encode_optional};
use crate::error::{Error, FramingError, Result};
use crate::parser;
use crate::types::{Generation, LoadReport, RegionPos, ServerId};

/// Wire tag of each message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    Heartbeat = 0,
    Join = 1,
    Leave = 2,
    OwnershipGrant = 3,
    OwnershipRevoke = 4,
    HandoffRequest = 5,
    HandoffAck = 6,
    ApplicationPayload = 7,
}

impl MessageKind {
    /// Stable lowercase name, used in logs and error labels.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::OwnershipGrant => "ownership_grant",
            MessageKind::OwnershipRevoke => "ownership_revoke",
            MessageKind::HandoffRequest => "handoff_request",
            MessageKind::HandoffAck => "handoff_ack",
            MessageKind::ApplicationPayload => "application_payload",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind-specific payload of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Liveness beacon, carrying the sender's load sample.
    Heartbeat { load: LoadReport },
    /// Handshake: the peer declares its identity and advertised address.
    Join { identity: ServerId, address: String },
    /// Graceful departure; the sender's regions are reassigned in order.
    Leave,
    /// Master -> server: the region is now yours.
    OwnershipGrant { region: RegionPos, owner: ServerId },
    /// Master -> server: stop simulating the region.
    OwnershipRevoke { region: RegionPos },
    /// Transfer request for a region crossing, relayed to the current owner.
    HandoffRequest {
        region: RegionPos,
        from: ServerId,
        to: ServerId,
    },
    /// The previous owner has flushed the region and releases it.
    HandoffAck { region: RegionPos },
    /// Opaque server-to-server traffic, forwarded without interpretation.
    ApplicationPayload {
        source: ServerId,
        /// Target identity, or `None` to broadcast to every other member.
        dest: Option<ServerId>,
        /// Region the payload concerns, when it is fenced by generation.
        region: Option<RegionPos>,
        data: Bytes,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Heartbeat { .. } => MessageKind::Heartbeat,
            Message::Join { .. } => MessageKind::Join,
            Message::Leave => MessageKind::Leave,
            Message::OwnershipGrant { .. } => MessageKind::OwnershipGrant,
            Message::OwnershipRevoke { .. } => MessageKind::OwnershipRevoke,
            Message::HandoffRequest { .. } => MessageKind::HandoffRequest,
            Message::HandoffAck { .. } => MessageKind::HandoffAck,
            Message::ApplicationPayload { .. } => MessageKind::ApplicationPayload,
        }
    }

    /// The region this message is fenced against, if any.
    pub fn region(&self) -> Option<RegionPos> {
        match self {
            Message::OwnershipGrant { region, .. }
            | Message::OwnershipRevoke { region }
            | Message::HandoffRequest { region, .. }
            | Message::HandoffAck { region } => Some(*region),
            Message::ApplicationPayload { region, .. } => *region,
            _ => None,
        }
    }
}

/// One decoded logical message plus the generation it was issued against.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub generation: Generation,
    pub message: Message,
}

impl Frame {
    pub fn new(generation: Generation, message: Message) -> Self {
        Frame {
            generation,
            message,
        }
    }

    /// A heartbeat frame; heartbeats are not fenced, so generation zero.
    pub fn heartbeat(load: LoadReport) -> Self {
        Frame::new(Generation::INITIAL, Message::Heartbeat { load })
    }

    /// Render the frame, length prefix included, into `buffer`.
    ///
    /// Encoding is total for all valid messages.
    pub fn encode_framed<B: BufMut>(&self, buffer: &mut B) -> Result<()> {
        let mut body = Vec::with_capacity(64);
        (self.message.kind() as u8).encode(&mut body)?;
        self.generation.encode(&mut body)?;

        match &self.message {
            Message::Heartbeat { load } => load.encode(&mut body)?,
            Message::Join { identity, address } => {
                identity.encode(&mut body)?;
                address.encode(&mut body)?;
            }
            Message::Leave => {}
            Message::OwnershipGrant { region, owner } => {
                region.encode(&mut body)?;
                owner.encode(&mut body)?;
            }
            Message::OwnershipRevoke { region } => region.encode(&mut body)?,
            Message::HandoffRequest { region, from, to } => {
                region.encode(&mut body)?;
                from.encode(&mut body)?;
                to.encode(&mut body)?;
            }
            Message::HandoffAck { region } => region.encode(&mut body)?,
            Message::ApplicationPayload {
                source,
                dest,
                region,
                data,
            } => {
                source.encode(&mut body)?;
                encode_nullable_string(&mut body, dest.as_ref().map(|d| d.as_str()))?;
                encode_optional(&mut body, region.as_ref())?;
                data.encode(&mut body)?;
            }
        }

        buffer.put_u32(body.len() as u32);
        buffer.put(body.as_slice());
        Ok(())
    }

    /// Convenience: encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        self.encode_framed(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` until a complete frame has been buffered; the
/// caller keeps appending reads and retrying, so a stream delivering
/// partial frames reassembles into exactly one message per frame. On
/// success the consumed bytes are removed from `buf`.
///
/// Fails with [`FramingError::FrameTooLarge`] when the length prefix
/// exceeds `max_frame` and [`FramingError::UnknownKind`] for an
/// unrecognized tag; both are connection-fatal.
pub fn decode_frame(buf: &mut BytesMut, max_frame: usize) -> Result<Option<Frame>> {
    if buf.len() < LEN_PREFIX_SIZE {
        return Ok(None);
    }

    let mut len_bytes = [0u8; LEN_PREFIX_SIZE];
    len_bytes.copy_from_slice(&buf[..LEN_PREFIX_SIZE]);
    let len = u32::from_be_bytes(len_bytes) as usize;

    if LEN_PREFIX_SIZE + len > max_frame {
        return Err(Error::Framing(FramingError::FrameTooLarge {
            size: LEN_PREFIX_SIZE + len,
            max: max_frame,
        }));
    }
    if len < FRAME_HEADER_SIZE {
        return Err(Error::Framing(FramingError::Malformed("frame header")));
    }
    if buf.len() < LEN_PREFIX_SIZE + len {
        // Partial frame, wait for more bytes.
        return Ok(None);
    }

    let _prefix = buf.split_to(LEN_PREFIX_SIZE);
    let body = buf.split_to(len).freeze();
    decode_body(body).map(Some)
}

fn decode_body(body: Bytes) -> Result<Frame> {
    let input = NomBytes::new(body);

    let (input, kind_byte) =
        parser::parse_kind(input).map_err(|_| FramingError::Malformed("frame header"))?;
    let kind =
        MessageKind::from_u8(kind_byte).ok_or(Error::Framing(FramingError::UnknownKind(kind_byte)))?;
    let (input, generation) =
        parser::parse_generation(input).map_err(|_| FramingError::Malformed("frame header"))?;

    let malformed = |_| FramingError::Malformed(kind.name());

    let message = match kind {
        MessageKind::Heartbeat => {
            let (_, load) = parser::parse_load_report(input).map_err(malformed)?;
            Message::Heartbeat { load }
        }
        MessageKind::Join => {
            let (input, identity) = parser::parse_server_id(input).map_err(malformed)?;
            let (_, address) = parser::parse_string(input).map_err(malformed)?;
            let address = parser::bytes_to_string(&address).map_err(malformed)?;
            Message::Join { identity, address }
        }
        MessageKind::Leave => Message::Leave,
        MessageKind::OwnershipGrant => {
            let (input, region) = parser::parse_region(input).map_err(malformed)?;
            let (_, owner) = parser::parse_server_id(input).map_err(malformed)?;
            Message::OwnershipGrant { region, owner }
        }
        MessageKind::OwnershipRevoke => {
            let (_, region) = parser::parse_region(input).map_err(malformed)?;
            Message::OwnershipRevoke { region }
        }
        MessageKind::HandoffRequest => {
            let (input, region) = parser::parse_region(input).map_err(malformed)?;
            let (input, from) = parser::parse_server_id(input).map_err(malformed)?;
            let (_, to) = parser::parse_server_id(input).map_err(malformed)?;
            Message::HandoffRequest { region, from, to }
        }
        MessageKind::HandoffAck => {
            let (_, region) = parser::parse_region(input).map_err(malformed)?;
            Message::HandoffAck { region }
        }
        MessageKind::ApplicationPayload => {
            let (input, source) = parser::parse_server_id(input).map_err(malformed)?;
            let (input, dest) = parser::parse_nullable_server_id(input).map_err(malformed)?;
            let (input, region) = parser::parse_optional_region(input).map_err(malformed)?;
            let (_, data) = parser::parse_bytes(input).map_err(malformed)?;
            Message::ApplicationPayload {
                source,
                dest,
                region,
                data,
            }
        }
    };

    Ok(Frame {
        generation,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_MAX_FRAME_SIZE;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode_framed(&mut buf).unwrap();
        decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .expect("complete frame")
    }

    #[test]
    fn test_join_roundtrip() {
        let frame = Frame::new(
            Generation::INITIAL,
            Message::Join {
                identity: ServerId::from("alpha"),
                address: "10.0.0.5:25565".to_string(),
            },
        );
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_handoff_request_roundtrip() {
        let frame = Frame::new(
            Generation::new(3),
            Message::HandoffRequest {
                region: RegionPos::new(-4, 12),
                from: ServerId::from("alpha"),
                to: ServerId::from("beta"),
            },
        );
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_broadcast_payload_roundtrip() {
        let frame = Frame::new(
            Generation::new(9),
            Message::ApplicationPayload {
                source: ServerId::from("alpha"),
                dest: None,
                region: Some(RegionPos::new(1, 1)),
                data: Bytes::from_static(b"entity blob"),
            },
        );
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(FRAME_HEADER_SIZE as u32);
        buf.put_u8(0xAB);
        buf.put_u64(0);

        let err = decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert_eq!(
            err,
            Error::Framing(FramingError::UnknownKind(0xAB)),
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(64);
        buf.put_u8(MessageKind::Leave as u8);
        buf.put_u64(0);

        let err = decode_frame(&mut buf, 32).unwrap_err();
        assert!(matches!(
            err,
            Error::Framing(FramingError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let frame = Frame::heartbeat(LoadReport::new(48.2, 19.9, 31));
        let encoded = frame.to_bytes().unwrap();

        // Feed the stream one byte at a time; only the final byte yields.
        let mut buf = BytesMut::new();
        for (i, byte) in encoded.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
            if i + 1 < encoded.len() {
                assert!(decoded.is_none(), "yielded before byte {}", i);
            } else {
                assert_eq!(decoded.expect("final byte completes frame"), frame);
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_runt_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u32(0);

        let err = decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert_eq!(
            err,
            Error::Framing(FramingError::Malformed("frame header")),
        );
    }
}
