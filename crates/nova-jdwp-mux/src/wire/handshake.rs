use super::header::{PacketHeader, HEADER_LEN};
use crate::{JdwpError, Result};

pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";

/// Upper bound for a packet that shows up before the peer's handshake. Anything
/// larger means the peer is not speaking JDWP.
pub const MAX_PRE_HANDSHAKE_PACKET_LEN: usize = 64 * 1024;

/// Outcome of inspecting the bytes accumulated while waiting for a handshake.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HandshakeScan {
    /// The buffer holds exactly the handshake.
    Complete,
    /// At least this many more bytes are needed to decide.
    NeedMore(usize),
    /// The buffer starts with a complete packet of this many bytes; drop it.
    Discard(usize),
}

/// Inspect `buf`, which callers only ever grow by the amount requested through
/// [`HandshakeScan::NeedMore`], so it never holds bytes past the handshake.
pub(crate) fn scan_handshake(buf: &[u8]) -> Result<HandshakeScan> {
    if buf == HANDSHAKE {
        return Ok(HandshakeScan::Complete);
    }
    if buf.len() < HANDSHAKE.len() && HANDSHAKE.starts_with(buf) {
        return Ok(HandshakeScan::NeedMore(HANDSHAKE.len() - buf.len()));
    }
    if buf.len() < HEADER_LEN {
        return Ok(HandshakeScan::NeedMore(HEADER_LEN - buf.len()));
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&buf[..HEADER_LEN]);
    let length = PacketHeader::parse(&header)
        .map_err(|err| JdwpError::Protocol(format!("invalid JDWP handshake: {err}")))?
        .length() as usize;
    if length > MAX_PRE_HANDSHAKE_PACKET_LEN {
        return Err(JdwpError::Protocol(format!(
            "invalid JDWP handshake: unexpected {length} byte packet before handshake"
        )));
    }
    if buf.len() >= length {
        Ok(HandshakeScan::Discard(length))
    } else {
        Ok(HandshakeScan::NeedMore(length - buf.len()))
    }
}
