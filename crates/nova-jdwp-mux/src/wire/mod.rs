//! Wire-level JDWP framing.
//!
//! Packets are an 11 byte big-endian header followed by an opaque payload.
//! Payloads received from a socket are *not* read eagerly: a [`Payload`] keeps
//! a handle on the input stream and materializes bytes on demand, so several
//! consumers can inspect a packet before the next one is read.

mod channel;
mod handshake;
mod header;
mod packet;
mod payload;

pub(crate) use channel::InputChannel;
pub(crate) use handshake::{scan_handshake, HandshakeScan};

pub use handshake::{HANDSHAKE, MAX_PRE_HANDSHAKE_PACKET_LEN};
pub use header::{PacketHeader, PacketKind, FLAG_REPLY, HEADER_LEN};
pub use packet::Packet;
pub use payload::{Payload, PayloadReader};
