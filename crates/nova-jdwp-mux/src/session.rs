//! One JDWP connection, one packet stream.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::refcount::AutoShutdown;
use crate::wire::{
    scan_handshake, HandshakeScan, InputChannel, Packet, PacketHeader, Payload, HANDSHAKE,
    HEADER_LEN,
};
use crate::{JdwpError, Result, LOG_TARGET};

/// Packet ids minted by sessions that own their id space start here. Debuggers
/// count up from 1, so the high range keeps internally generated commands
/// from colliding with ids forwarded by a proxy.
pub const DEFAULT_PACKET_ID_BASE: u32 = 0x4000_0000;

/// Any bidirectional byte stream a JDWP session can run over.
pub trait JdwpSocket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> JdwpSocket for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Used in log records only.
    pub name: String,
    /// First id returned by [`JdwpSession::next_packet_id`]; `None` disables id
    /// minting (sessions that only forward packets).
    pub packet_id_base: Option<u32>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            name: "jdwp".to_string(),
            packet_id_base: Some(DEFAULT_PACKET_ID_BASE),
        }
    }
}

impl SessionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Options for a session that relays packets numbered by its peer.
    pub fn pass_through(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            packet_id_base: None,
        }
    }
}

/// A 1:1 JDWP packet stream over a socket.
///
/// Sends are serialized by one lock and receives by another, so one task may
/// read while another writes. The `JDWP-Handshake` is exchanged lazily: the
/// first send or receive writes ours, the first receive waits for the peer's.
pub struct JdwpSession {
    name: String,
    input: Arc<InputChannel>,
    reader: Mutex<ReadState>,
    writer: Arc<Mutex<WriteState>>,
    /// Set once our handshake is on the wire; lets receives skip the writer lock.
    handshake_sent: AtomicBool,
    next_id: Option<AtomicU32>,
    closed: CancellationToken,
}

struct ReadState {
    handshake_received: bool,
    handshake_buf: Vec<u8>,
    header_buf: [u8; HEADER_LEN],
    header_filled: usize,
    /// Payload of the previously returned packet; drained before the next header.
    last_payload: Option<Payload>,
    /// Sticky terminal failure.
    failed: Option<JdwpError>,
}

struct WriteState {
    output: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl JdwpSession {
    pub fn open<S: JdwpSocket>(socket: S, options: SessionOptions) -> Self {
        let (read_half, write_half) = tokio::io::split(socket);
        let closed = CancellationToken::new();
        tracing::debug!(target: LOG_TARGET, session = %options.name, "opened JDWP session");
        Self {
            name: options.name,
            input: Arc::new(InputChannel::new(Box::new(read_half), closed.clone())),
            reader: Mutex::new(ReadState {
                handshake_received: false,
                handshake_buf: Vec::with_capacity(HANDSHAKE.len()),
                header_buf: [0; HEADER_LEN],
                header_filled: 0,
                last_payload: None,
                failed: None,
            }),
            writer: Arc::new(Mutex::new(WriteState {
                output: Some(Box::new(write_half)),
            })),
            handshake_sent: AtomicBool::new(false),
            next_id: options.packet_id_base.map(AtomicU32::new),
            closed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Mint a fresh packet id, strictly increasing per session.
    pub fn next_packet_id(&self) -> Result<u32> {
        let counter = self.next_id.as_ref().ok_or(JdwpError::UnsupportedOperation(
            "this session does not mint packet ids",
        ))?;
        Ok(counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Write our `JDWP-Handshake` unless it was already sent.
    pub async fn send_handshake(&self) -> Result<()> {
        let mut writer = self.lock_writer().await?;
        self.send_handshake_locked(&mut writer).await
    }

    /// Wait for the peer's `JDWP-Handshake`, discarding well-formed packets that
    /// precede it.
    pub async fn receive_handshake(&self) -> Result<()> {
        let mut reader = self.lock_reader().await?;
        self.receive_handshake_locked(&mut reader).await
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let mut writer = self.lock_writer().await?;
        self.send_handshake_locked(&mut writer).await?;
        let output = writer
            .output
            .as_mut()
            .ok_or(JdwpError::Closed("JDWP session"))?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(JdwpError::Closed("JDWP session")),
            res = async {
                packet.write_to(output).await?;
                output.flush().await?;
                Ok::<_, JdwpError>(())
            } => res?,
        }
        tracing::trace!(target: LOG_TARGET, session = %self.name, %packet, "sent packet");
        Ok(())
    }

    /// Receive the next packet.
    ///
    /// The returned payload stays readable until the next call, which drains
    /// whatever the caller left unread. End of stream and I/O failures are
    /// terminal and returned again by every later call.
    pub async fn receive_packet(&self) -> Result<Packet> {
        if !self.handshake_sent.load(Ordering::Acquire) {
            self.send_handshake().await?;
        }
        let mut reader = self.lock_reader().await?;
        if let Some(err) = &reader.failed {
            return Err(err.clone());
        }
        match self.receive_packet_locked(&mut reader).await {
            Ok(packet) => {
                tracing::trace!(target: LOG_TARGET, session = %self.name, %packet, "received packet");
                Ok(packet)
            }
            Err(err) => {
                if err.is_terminal() {
                    tracing::debug!(target: LOG_TARGET, session = %self.name, error = %err, "JDWP stream ended");
                    reader.failed = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Half-close the output so the peer sees end of stream.
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.lock_writer().await?;
        if let Some(output) = writer.output.as_mut() {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(JdwpError::Closed("JDWP session")),
                res = output.shutdown() => res?,
            }
        }
        Ok(())
    }

    /// Release the socket. Pending and future operations fail with
    /// [`JdwpError::Closed`]. Idempotent.
    ///
    /// Both halves are dropped even while a send or receive holds its lock:
    /// the holder bails out on the cancelled token and a background task
    /// takes the half as soon as the lock is free.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        match self.writer.try_lock() {
            Ok(mut writer) => drop(writer.output.take()),
            Err(_) => {
                let writer = self.writer.clone();
                spawn_or_warn(&self.name, async move {
                    writer.lock().await.output.take();
                });
            }
        }
        if let Some(release) = self.input.release() {
            spawn_or_warn(&self.name, release);
        }
        tracing::debug!(target: LOG_TARGET, session = %self.name, "closed JDWP session");
    }

    async fn lock_writer(&self) -> Result<tokio::sync::MutexGuard<'_, WriteState>> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(JdwpError::Closed("JDWP session")),
            guard = self.writer.lock() => Ok(guard),
        }
    }

    async fn lock_reader(&self) -> Result<tokio::sync::MutexGuard<'_, ReadState>> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(JdwpError::Closed("JDWP session")),
            guard = self.reader.lock() => Ok(guard),
        }
    }

    async fn send_handshake_locked(&self, writer: &mut WriteState) -> Result<()> {
        if self.handshake_sent.load(Ordering::Acquire) {
            return Ok(());
        }
        let output = writer
            .output
            .as_mut()
            .ok_or(JdwpError::Closed("JDWP session"))?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(JdwpError::Closed("JDWP session")),
            res = async {
                output.write_all(HANDSHAKE).await?;
                output.flush().await
            } => res?,
        }
        self.handshake_sent.store(true, Ordering::Release);
        tracing::debug!(target: LOG_TARGET, session = %self.name, "sent JDWP handshake");
        Ok(())
    }

    async fn receive_handshake_locked(&self, state: &mut ReadState) -> Result<()> {
        while !state.handshake_received {
            match scan_handshake(&state.handshake_buf)? {
                HandshakeScan::Complete => {
                    state.handshake_received = true;
                    state.handshake_buf = Vec::new();
                    tracing::debug!(target: LOG_TARGET, session = %self.name, "received JDWP handshake");
                }
                HandshakeScan::Discard(len) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        session = %self.name,
                        len,
                        "discarding packet received before JDWP handshake"
                    );
                    state.handshake_buf.drain(..len);
                }
                HandshakeScan::NeedMore(want) => {
                    let mut chunk = vec![0u8; want];
                    let n = self.input.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(if state.handshake_buf.is_empty() {
                            JdwpError::EndOfStream
                        } else {
                            truncated("handshake")
                        });
                    }
                    state.handshake_buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
        Ok(())
    }

    async fn receive_packet_locked(&self, state: &mut ReadState) -> Result<Packet> {
        self.receive_handshake_locked(state).await?;

        if let Some(previous) = state.last_payload.take() {
            if let Err(err) = previous.shutdown().await {
                // Keep the payload so a retry after cancellation drains it.
                state.last_payload = Some(previous);
                return Err(err);
            }
        }

        while state.header_filled < HEADER_LEN {
            let filled = state.header_filled;
            let n = self.input.read(&mut state.header_buf[filled..]).await?;
            if n == 0 {
                return Err(if filled == 0 {
                    JdwpError::EndOfStream
                } else {
                    truncated("packet header")
                });
            }
            state.header_filled += n;
        }
        state.header_filled = 0;

        let header = PacketHeader::parse(&state.header_buf)?;
        let payload = Payload::from_channel(self.input.clone(), header.payload_len());
        state.last_payload = Some(payload.clone());
        Ok(Packet::from_wire(header, payload))
    }
}

impl AutoShutdown for Arc<JdwpSession> {
    async fn shutdown(&self) -> Result<()> {
        JdwpSession::shutdown(self).await
    }

    fn close(&self) {
        JdwpSession::close(self)
    }
}

fn spawn_or_warn(session: &str, task: impl std::future::Future<Output = ()> + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => tracing::warn!(
            target: LOG_TARGET,
            session,
            "no tokio runtime to release a busy JDWP socket half"
        ),
    }
}

fn truncated(what: &str) -> JdwpError {
    JdwpError::from(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("stream ended in the middle of a {what}"),
    ))
}
