use std::fmt;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::header::PacketHeader;
use super::payload::Payload;
use crate::{JdwpError, Result};

/// A JDWP packet: header plus (possibly stream-backed) payload.
///
/// Cloning is cheap; clones share the same payload.
#[derive(Clone, Debug)]
pub struct Packet {
    header: PacketHeader,
    payload: Payload,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Payload) -> Result<Self> {
        if header.payload_len() != payload.len() {
            return Err(JdwpError::MalformedPacket(format!(
                "{header} declares {} payload bytes but {} were provided",
                header.payload_len(),
                payload.len()
            )));
        }
        Ok(Self { header, payload })
    }

    pub fn command(id: u32, cmd_set: u8, cmd: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        Ok(Self {
            header: PacketHeader::command(id, cmd_set, cmd, payload.len())?,
            payload: Payload::from_bytes(payload),
        })
    }

    pub fn reply(id: u32, error_code: u16, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        Ok(Self {
            header: PacketHeader::reply(id, error_code, payload.len())?,
            payload: Payload::from_bytes(payload),
        })
    }

    pub(crate) fn from_wire(header: PacketHeader, payload: Payload) -> Self {
        Self { header, payload }
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn id(&self) -> u32 {
        self.header.id()
    }

    pub fn length(&self) -> u32 {
        self.header.length()
    }

    pub fn is_command(&self) -> bool {
        self.header.is_command()
    }

    pub fn is_reply(&self) -> bool {
        self.header.is_reply()
    }

    pub fn is_command_of(&self, cmd_set: u8, cmd: u8) -> bool {
        self.header.is_command_of(cmd_set, cmd)
    }

    /// Whether `self` is the reply to `command`.
    pub fn is_reply_to(&self, command: &Packet) -> bool {
        self.is_reply() && command.is_command() && self.id() == command.id()
    }

    pub fn is_offline(&self) -> bool {
        self.payload.is_offline()
    }

    /// Same packet with a different id, sharing the payload.
    pub fn with_id(&self, id: u32) -> Packet {
        Packet {
            header: self.header.with_id(id),
            payload: self.payload.clone(),
        }
    }

    /// Copy that owns its payload bytes and outlives the session read cycle.
    pub async fn to_offline(&self) -> Result<Packet> {
        if self.is_offline() {
            return Ok(self.clone());
        }
        Ok(Packet {
            header: self.header,
            payload: self.payload.to_offline().await?,
        })
    }

    pub async fn into_offline(self) -> Result<Packet> {
        if self.is_offline() {
            return Ok(self);
        }
        self.to_offline().await
    }

    pub async fn payload_bytes(&self) -> Result<Bytes> {
        self.payload.to_bytes().await
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        self.payload.shutdown().await
    }

    /// Serialize header and payload to `out`. Does not flush.
    pub async fn write_to<W>(&self, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        out.write_all(&self.header.to_bytes()).await?;
        let mut reader = self.payload.acquire().await?;
        let mut chunk = vec![0u8; reader.len().clamp(1, 8 * 1024)];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            out.write_all(&chunk[..n]).await?;
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.header, f)
    }
}
