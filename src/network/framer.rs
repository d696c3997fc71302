use bytes::{Buf, Bytes, BytesMut};

use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// Describes where the length field sits inside a frame header and how the
/// value it carries relates to the full frame size.
///
/// For a buffered stream, one complete frame spans
/// `length_field_offset + length_field_length + L + length_adjustment` bytes,
/// where `L` is the decoded length value. The first `initial_bytes_to_strip`
/// bytes are removed from the emitted frame.
#[derive(Debug, Clone)]
pub struct LengthField {
    pub max_frame_length: usize,
    pub length_field_offset: usize,
    pub length_field_length: usize,
    pub length_adjustment: isize,
    pub initial_bytes_to_strip: usize,
    pub byte_order: ByteOrder,
}

impl LengthField {
    /// Big-endian `tag(4) | length(4) | value` layout.
    pub fn tlv_big(max_packet_size: u32) -> Self {
        LengthField {
            max_frame_length: max_packet_size as usize + 8,
            length_field_offset: 4,
            length_field_length: 4,
            length_adjustment: 0,
            initial_bytes_to_strip: 0,
            byte_order: ByteOrder::Big,
        }
    }

    /// Little-endian `length(4) | tag(4) | value` layout. The length field
    /// counts value bytes only, so four tag bytes follow it.
    pub fn ltv_little(max_packet_size: u32) -> Self {
        LengthField {
            max_frame_length: max_packet_size as usize + 8,
            length_field_offset: 0,
            length_field_length: 4,
            length_adjustment: 4,
            initial_bytes_to_strip: 0,
            byte_order: ByteOrder::Little,
        }
    }
}

/// Splits a byte stream into length-prefixed frames.
///
/// The framer holds no buffer of its own; the caller owns the accumulation
/// buffer and calls [`Framer::parse`] until it returns `None`, which decodes
/// as many complete frames as one read made available.
#[derive(Debug)]
pub struct Framer {
    field: LengthField,
}

impl Framer {
    pub fn new(field: LengthField) -> Self {
        Framer { field }
    }

    /// Tries to slice one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A malformed or oversize
    /// header is unrecoverable for the stream and the connection should be
    /// closed.
    pub fn parse(&self, buf: &mut BytesMut) -> AppResult<Option<Bytes>> {
        match self.check(buf) {
            Ok(total) => {
                let mut frame = buf.split_to(total);
                frame.advance(self.field.initial_bytes_to_strip);
                Ok(Some(frame.freeze()))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Validates the header and returns the total frame size in bytes.
    fn check(&self, buf: &mut BytesMut) -> AppResult<usize> {
        let header_end = self.field.length_field_offset + self.field.length_field_length;
        if buf.len() < header_end {
            return Err(Incomplete);
        }
        let length = self.read_length(&buf[self.field.length_field_offset..header_end]);
        let total = header_end as i128 + length as i128 + self.field.length_adjustment as i128;
        if total > self.field.max_frame_length as i128 {
            return Err(AppError::FrameTooLarge {
                got: total as usize,
                limit: self.field.max_frame_length,
            });
        }
        if total < 0 || total < self.field.initial_bytes_to_strip as i128 {
            return Err(AppError::FrameMalformed(format!(
                "header declares a frame of {} bytes",
                total
            )));
        }
        let total = total as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Err(Incomplete);
        }
        Ok(total)
    }

    fn read_length(&self, bytes: &[u8]) -> u64 {
        let mut value: u64 = 0;
        match self.field.byte_order {
            ByteOrder::Big => {
                for b in bytes {
                    value = (value << 8) | *b as u64;
                }
            }
            ByteOrder::Little => {
                for b in bytes.iter().rev() {
                    value = (value << 8) | *b as u64;
                }
            }
        }
        value
    }
}
