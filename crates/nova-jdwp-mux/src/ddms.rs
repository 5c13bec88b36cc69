//! DDMS (Dalvik Debug Monitor Server) packets tunnelled through JDWP.
//!
//! A DDMS command is a JDWP command with command set `0xC7` and command `0x01`
//! whose payload starts with a 4 byte chunk type and a 4 byte chunk length.

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::{Packet, PacketHeader};
use crate::{JdwpError, Result};

pub const DDMS_CMD_SET: u8 = 0xC7;
pub const DDMS_CMD: u8 = 0x01;

/// Size of the chunk type plus chunk length prefix.
pub const CHUNK_HEADER_LEN: usize = 8;

pub fn is_ddms_command(header: &PacketHeader) -> bool {
    header.is_command_of(DDMS_CMD_SET, DDMS_CMD)
}

/// Build a DDMS command carrying one chunk.
pub fn command_packet(id: u32, chunk_type: [u8; 4], data: &[u8]) -> Result<Packet> {
    let chunk_len = u32::try_from(data.len()).map_err(|_| {
        JdwpError::MalformedPacket(format!("DDMS chunk of {} bytes is too large", data.len()))
    })?;
    let mut payload = BytesMut::with_capacity(CHUNK_HEADER_LEN + data.len());
    payload.put_slice(&chunk_type);
    payload.put_u32(chunk_len);
    payload.put_slice(data);
    Packet::command(id, DDMS_CMD_SET, DDMS_CMD, payload.freeze())
}

/// Chunk type of a DDMS command, or of a reply payload that carries a chunk.
///
/// Returns `None` for packets too short to hold a chunk header.
pub async fn chunk_type(packet: &Packet) -> Result<Option<[u8; 4]>> {
    if packet.payload().len() < CHUNK_HEADER_LEN {
        return Ok(None);
    }
    let mut reader = packet.payload().acquire().await?;
    let mut chunk_type = [0u8; 4];
    reader.read_exact(&mut chunk_type).await?;
    Ok(Some(chunk_type))
}

/// Chunk data following the chunk header, bounded by the declared chunk length.
pub async fn chunk_data(packet: &Packet) -> Result<Bytes> {
    let payload = packet.payload_bytes().await?;
    if payload.len() < CHUNK_HEADER_LEN {
        return Err(JdwpError::Protocol(format!(
            "{packet} is too short to carry a DDMS chunk"
        )));
    }
    let declared = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
    let available = payload.len() - CHUNK_HEADER_LEN;
    if declared > available {
        return Err(JdwpError::Protocol(format!(
            "DDMS chunk declares {declared} bytes but only {available} are present"
        )));
    }
    Ok(payload.slice(CHUNK_HEADER_LEN..CHUNK_HEADER_LEN + declared))
}

/// Printable form of a chunk type, e.g. `HELO`.
pub fn chunk_type_name(chunk_type: [u8; 4]) -> String {
    chunk_type
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
        .collect()
}
