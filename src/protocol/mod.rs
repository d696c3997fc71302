//! Wire protocol layer: the [`Message`] carrier and the packet codecs that
//! serialize it.
//!
//! A message on the wire is a header (tag + length, layout depending on the
//! codec) followed by the payload bytes. Two codecs ship out of the box:
//!
//! - `TlvPacket`: big-endian `tag | length | value`
//! - `LtvPacket`: little-endian `length | tag | value`
//!
//! Both describe their header to the framer through a [`LengthField`]
//! descriptor, so the byte-stream framing stays generic over the layout.

pub use message::Message;
pub use packet::{LtvPacket, Packet, TlvPacket, HEADER_SIZE};

mod message;
mod packet;
