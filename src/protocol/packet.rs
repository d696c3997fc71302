use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::network::{ByteOrder, LengthField};
use crate::protocol::Message;
use crate::{AppError, AppResult};

/// Tag and length are both u32 in the built-in layouts.
pub const HEADER_SIZE: usize = 8;

/// A packet codec: serializes outbound messages and splits decoded frames
/// into (tag, value). The header layout it implements is also published as a
/// [`LengthField`] so the framer can find frame boundaries without knowing
/// the codec.
pub trait Packet: Send + Sync {
    fn head_len(&self) -> usize {
        HEADER_SIZE
    }

    /// Frame-boundary description consumed by the framer.
    fn length_field(&self) -> LengthField;

    /// Serializes a message into wire bytes.
    fn pack(&self, msg: &Message) -> AppResult<BytesMut>;

    /// Splits a complete frame (header included) into a decoded [`Message`].
    fn unpack(&self, frame: Bytes) -> AppResult<Message>;
}

/// Big-endian `tag(u32) | length(u32) | value`.
#[derive(Debug, Clone)]
pub struct TlvPacket {
    max_packet_size: u32,
}

impl TlvPacket {
    pub fn new(max_packet_size: u32) -> Self {
        TlvPacket { max_packet_size }
    }
}

impl Packet for TlvPacket {
    fn length_field(&self) -> LengthField {
        LengthField {
            max_frame_length: self.max_packet_size as usize + HEADER_SIZE,
            length_field_offset: 4,
            length_field_length: 4,
            length_adjustment: 0,
            initial_bytes_to_strip: 0,
            byte_order: ByteOrder::Big,
        }
    }

    fn pack(&self, msg: &Message) -> AppResult<BytesMut> {
        if msg.data_len() > self.max_packet_size {
            return Err(AppError::FrameTooLarge {
                got: msg.data_len() as usize,
                limit: self.max_packet_size as usize,
            });
        }
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + msg.data().len());
        buf.put_u32(msg.id());
        buf.put_u32(msg.data_len());
        buf.extend_from_slice(msg.data());
        Ok(buf)
    }

    fn unpack(&self, mut frame: Bytes) -> AppResult<Message> {
        if frame.len() < HEADER_SIZE {
            return Err(AppError::FrameMalformed(format!(
                "frame of {} bytes is shorter than the {} byte header",
                frame.len(),
                HEADER_SIZE
            )));
        }
        let tag = frame.get_u32();
        let declared = frame.get_u32();
        check_value(declared, frame.len(), self.max_packet_size)?;
        Ok(Message::new(tag, frame))
    }
}

/// Little-endian `length(u32) | tag(u32) | value`. The length field declares
/// the value portion only, so the framer adjustment accounts for the trailing
/// tag word.
#[derive(Debug, Clone)]
pub struct LtvPacket {
    max_packet_size: u32,
}

impl LtvPacket {
    pub fn new(max_packet_size: u32) -> Self {
        LtvPacket { max_packet_size }
    }
}

impl Packet for LtvPacket {
    fn length_field(&self) -> LengthField {
        LengthField {
            max_frame_length: self.max_packet_size as usize + HEADER_SIZE,
            length_field_offset: 0,
            length_field_length: 4,
            // length counts value bytes only; the tag word follows the field
            length_adjustment: 4,
            initial_bytes_to_strip: 0,
            byte_order: ByteOrder::Little,
        }
    }

    fn pack(&self, msg: &Message) -> AppResult<BytesMut> {
        if msg.data_len() > self.max_packet_size {
            return Err(AppError::FrameTooLarge {
                got: msg.data_len() as usize,
                limit: self.max_packet_size as usize,
            });
        }
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + msg.data().len());
        buf.put_u32_le(msg.data_len());
        buf.put_u32_le(msg.id());
        buf.extend_from_slice(msg.data());
        Ok(buf)
    }

    fn unpack(&self, mut frame: Bytes) -> AppResult<Message> {
        if frame.len() < HEADER_SIZE {
            return Err(AppError::FrameMalformed(format!(
                "frame of {} bytes is shorter than the {} byte header",
                frame.len(),
                HEADER_SIZE
            )));
        }
        let declared = frame.get_u32_le();
        let tag = frame.get_u32_le();
        check_value(declared, frame.len(), self.max_packet_size)?;
        Ok(Message::new(tag, frame))
    }
}

fn check_value(declared: u32, actual: usize, max: u32) -> AppResult<()> {
    if declared > max {
        return Err(AppError::FrameTooLarge {
            got: declared as usize,
            limit: max as usize,
        });
    }
    if declared as usize != actual {
        return Err(AppError::FrameMalformed(format!(
            "header declares {} value bytes but frame carries {}",
            declared, actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tlv_round_trip() {
        let codec = TlvPacket::new(4096);
        let msg = Message::new(1, Bytes::from_static(b"HELLO"));
        let wire = codec.pack(&msg).unwrap();
        assert_eq!(
            wire.as_ref(),
            &[0, 0, 0, 1, 0, 0, 0, 5, b'H', b'E', b'L', b'L', b'O']
        );
        let decoded = codec.unpack(wire.freeze()).unwrap();
        assert_eq!(decoded.id(), 1);
        assert_eq!(decoded.data().as_ref(), b"HELLO");
        assert_eq!(decoded.data_len(), 5);
    }

    #[test]
    fn test_ltv_wire_layout() {
        // the reference exchange: len=5 LE, tag=1 LE, "HELLO"
        let codec = LtvPacket::new(4096);
        let msg = Message::new(1, Bytes::from_static(b"HELLO"));
        let wire = codec.pack(&msg).unwrap();
        assert_eq!(
            wire.as_ref(),
            &[5, 0, 0, 0, 1, 0, 0, 0, b'H', b'E', b'L', b'L', b'O']
        );
        let decoded = codec.unpack(wire.freeze()).unwrap();
        assert_eq!(decoded.id(), 1);
        assert_eq!(decoded.data().as_ref(), b"HELLO");
    }

    #[test]
    fn test_pack_rejects_oversize_payload() {
        let codec = LtvPacket::new(4);
        let msg = Message::new(1, Bytes::from_static(b"HELLO"));
        assert!(matches!(
            codec.pack(&msg),
            Err(AppError::FrameTooLarge { got: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_value_exactly_at_limit_is_accepted() {
        let codec = TlvPacket::new(5);
        let msg = Message::new(9, Bytes::from_static(b"HELLO"));
        let wire = codec.pack(&msg).unwrap();
        let decoded = codec.unpack(wire.freeze()).unwrap();
        assert_eq!(decoded.data_len(), 5);
    }

    #[test]
    fn test_unpack_rejects_length_mismatch() {
        let codec = TlvPacket::new(4096);
        // header declares 9 value bytes, frame carries 5
        let mut wire = BytesMut::new();
        wire.put_u32(1);
        wire.put_u32(9);
        wire.extend_from_slice(b"HELLO");
        assert!(matches!(
            codec.unpack(wire.freeze()),
            Err(AppError::FrameMalformed(_))
        ));
    }
}
