use std::fmt;

use crate::{JdwpError, Result};

pub const HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;

/// Command/reply discriminant carried in bytes 9 and 10 of the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Command { cmd_set: u8, cmd: u8 },
    Reply { error_code: u16 },
}

/// Fixed 11 byte JDWP packet header.
///
/// `length` always includes the header itself, so it is never smaller than
/// [`HEADER_LEN`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketHeader {
    length: u32,
    id: u32,
    flags: u8,
    kind: PacketKind,
}

impl PacketHeader {
    /// Build a command header from untrusted field values.
    pub fn new_command(length: u32, id: u32, flags: u32, cmd_set: u32, cmd: u32) -> Result<Self> {
        check_length(length)?;
        let flags = narrow_u8("flags", flags)?;
        if flags & FLAG_REPLY != 0 {
            return Err(JdwpError::MalformedPacket(format!(
                "command packet {id} carries the reply flag (flags=0x{flags:02x})"
            )));
        }
        Ok(Self {
            length,
            id,
            flags,
            kind: PacketKind::Command {
                cmd_set: narrow_u8("command set", cmd_set)?,
                cmd: narrow_u8("command", cmd)?,
            },
        })
    }

    /// Build a reply header from untrusted field values.
    pub fn new_reply(length: u32, id: u32, flags: u32, error_code: u32) -> Result<Self> {
        check_length(length)?;
        let flags = narrow_u8("flags", flags)?;
        if flags & FLAG_REPLY == 0 {
            return Err(JdwpError::MalformedPacket(format!(
                "reply packet {id} is missing the reply flag (flags=0x{flags:02x})"
            )));
        }
        let error_code = u16::try_from(error_code).map_err(|_| {
            JdwpError::MalformedPacket(format!("error code {error_code} does not fit in 16 bits"))
        })?;
        Ok(Self {
            length,
            id,
            flags,
            kind: PacketKind::Reply { error_code },
        })
    }

    pub fn command(id: u32, cmd_set: u8, cmd: u8, payload_len: usize) -> Result<Self> {
        Ok(Self {
            length: total_length(payload_len)?,
            id,
            flags: 0,
            kind: PacketKind::Command { cmd_set, cmd },
        })
    }

    pub fn reply(id: u32, error_code: u16, payload_len: usize) -> Result<Self> {
        Ok(Self {
            length: total_length(payload_len)?,
            id,
            flags: FLAG_REPLY,
            kind: PacketKind::Reply { error_code },
        })
    }

    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let id = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let flags = bytes[8];
        check_length(length)?;
        let kind = if flags & FLAG_REPLY != 0 {
            PacketKind::Reply {
                error_code: u16::from_be_bytes([bytes[9], bytes[10]]),
            }
        } else {
            PacketKind::Command {
                cmd_set: bytes[9],
                cmd: bytes[10],
            }
        };
        Ok(Self {
            length,
            id,
            flags,
            kind,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..8].copy_from_slice(&self.id.to_be_bytes());
        out[8] = self.flags;
        match self.kind {
            PacketKind::Command { cmd_set, cmd } => {
                out[9] = cmd_set;
                out[10] = cmd;
            }
            PacketKind::Reply { error_code } => {
                out[9..11].copy_from_slice(&error_code.to_be_bytes());
            }
        }
        out
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, PacketKind::Reply { .. })
    }

    pub fn is_command(&self) -> bool {
        matches!(self.kind, PacketKind::Command { .. })
    }

    pub fn is_command_of(&self, cmd_set: u8, cmd: u8) -> bool {
        self.kind == PacketKind::Command { cmd_set, cmd }
    }

    pub fn cmd_set(&self) -> Result<u8> {
        match self.kind {
            PacketKind::Command { cmd_set, .. } => Ok(cmd_set),
            PacketKind::Reply { .. } => Err(JdwpError::InvalidPacketKind(
                "command set requested on a reply packet",
            )),
        }
    }

    pub fn cmd(&self) -> Result<u8> {
        match self.kind {
            PacketKind::Command { cmd, .. } => Ok(cmd),
            PacketKind::Reply { .. } => Err(JdwpError::InvalidPacketKind(
                "command requested on a reply packet",
            )),
        }
    }

    pub fn error_code(&self) -> Result<u16> {
        match self.kind {
            PacketKind::Reply { error_code } => Ok(error_code),
            PacketKind::Command { .. } => Err(JdwpError::InvalidPacketKind(
                "error code requested on a command packet",
            )),
        }
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }
}

impl fmt::Display for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PacketKind::Command { cmd_set, cmd } => write!(
                f,
                "command(id={}, length={}, cmdSet={cmd_set}, cmd={cmd})",
                self.id, self.length
            ),
            PacketKind::Reply { error_code } => write!(
                f,
                "reply(id={}, length={}, errorCode={error_code})",
                self.id, self.length
            ),
        }
    }
}

fn check_length(length: u32) -> Result<()> {
    if (length as usize) < HEADER_LEN {
        return Err(JdwpError::MalformedPacket(format!(
            "packet length {length} is smaller than the {HEADER_LEN} byte header"
        )));
    }
    Ok(())
}

fn narrow_u8(field: &str, value: u32) -> Result<u8> {
    u8::try_from(value).map_err(|_| {
        JdwpError::MalformedPacket(format!("{field} {value} does not fit in 8 bits"))
    })
}

fn total_length(payload_len: usize) -> Result<u32> {
    payload_len
        .checked_add(HEADER_LEN)
        .and_then(|len| u32::try_from(len).ok())
        .ok_or_else(|| {
            JdwpError::MalformedPacket(format!("payload of {payload_len} bytes is too large"))
        })
}
