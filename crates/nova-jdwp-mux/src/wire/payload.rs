use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};

use super::channel::InputChannel;
use crate::{JdwpError, Result};

const READ_CHUNK: usize = 8 * 1024;

/// Packet payload.
///
/// Offline payloads own their bytes. Wire payloads are backed by the session
/// input stream: bytes are pulled the first time someone reads them and kept so
/// later readers can rewind. Only one [`PayloadReader`] exists at a time;
/// [`Payload::acquire`] waits for the previous one to be dropped.
#[derive(Clone)]
pub struct Payload {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    Offline(Bytes),
    Wire(Arc<WirePayload>),
}

struct WirePayload {
    len: usize,
    state: Mutex<WireState>,
}

struct WireState {
    /// `None` once every byte was pulled from the stream or the payload was shut down.
    source: Option<Arc<InputChannel>>,
    buffered: Vec<u8>,
    unread: usize,
    shut_down: bool,
}

impl Payload {
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            repr: Repr::Offline(bytes.into()),
        }
    }

    pub(crate) fn from_channel(source: Arc<InputChannel>, len: usize) -> Self {
        let state = WireState {
            source: (len > 0).then_some(source),
            buffered: Vec::new(),
            unread: len,
            shut_down: false,
        };
        Self {
            repr: Repr::Wire(Arc::new(WirePayload {
                len,
                state: Mutex::new(state),
            })),
        }
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Offline(bytes) => bytes.len(),
            Repr::Wire(wire) => wire.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.repr, Repr::Offline(_))
    }

    /// Acquire exclusive, rewound access to the payload bytes.
    pub async fn acquire(&self) -> Result<PayloadReader<'_>> {
        let inner = match &self.repr {
            Repr::Offline(bytes) => ReaderRepr::Offline(bytes),
            Repr::Wire(wire) => {
                let state = wire.state.lock().await;
                if state.shut_down {
                    return Err(JdwpError::PayloadUnavailable);
                }
                ReaderRepr::Wire(state)
            }
        };
        Ok(PayloadReader {
            inner,
            len: self.len(),
            pos: 0,
        })
    }

    /// Read the whole payload into memory.
    pub async fn to_bytes(&self) -> Result<Bytes> {
        if let Repr::Offline(bytes) = &self.repr {
            return Ok(bytes.clone());
        }
        let mut reader = self.acquire().await?;
        let mut out = Vec::with_capacity(reader.len());
        reader.read_to_end(&mut out).await?;
        Ok(Bytes::from(out))
    }

    /// Copy of this payload that no longer depends on the session stream.
    pub async fn to_offline(&self) -> Result<Payload> {
        Ok(Payload::from_bytes(self.to_bytes().await?))
    }

    /// Consume whatever is left of the payload on the stream and make the
    /// payload unavailable. Idempotent; a no-op for offline payloads.
    pub async fn shutdown(&self) -> Result<()> {
        let Repr::Wire(wire) = &self.repr else {
            return Ok(());
        };
        let mut state = wire.state.lock().await;
        if state.shut_down {
            return Ok(());
        }
        let mut scratch = vec![0u8; READ_CHUNK.min(state.unread)];
        while state.unread > 0 {
            let Some(source) = state.source.clone() else {
                break;
            };
            let want = state.unread.min(scratch.len());
            let n = source.read(&mut scratch[..want]).await?;
            if n == 0 {
                return Err(unexpected_eof(state.unread));
            }
            state.unread -= n;
        }
        state.source = None;
        state.buffered = Vec::new();
        state.shut_down = true;
        Ok(())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.len())
            .field("offline", &self.is_offline())
            .finish()
    }
}

/// Exclusive reader over a [`Payload`], starting at offset 0.
pub struct PayloadReader<'a> {
    inner: ReaderRepr<'a>,
    len: usize,
    pos: usize,
}

enum ReaderRepr<'a> {
    Offline(&'a Bytes),
    Wire(MutexGuard<'a, WireState>),
}

impl PayloadReader<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    /// Read up to `buf.len()` bytes; `Ok(0)` at the end of the payload.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.pos == self.len {
            return Ok(0);
        }
        let available = match &mut self.inner {
            ReaderRepr::Offline(bytes) => &bytes[..],
            ReaderRepr::Wire(state) => {
                if self.pos == state.buffered.len() {
                    fill(state, buf.len()).await?;
                }
                &state.buffered[..]
            }
        };
        let n = (available.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&available[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.len() > self.remaining() {
            return Err(JdwpError::Protocol(format!(
                "requested {} bytes but only {} remain in the payload",
                buf.len(),
                self.remaining()
            )));
        }
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read(&mut buf[filled..]).await?;
        }
        Ok(())
    }

    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let start = out.len();
        let mut chunk = vec![0u8; READ_CHUNK.min(self.remaining()).max(1)];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out.len() - start);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Pull at most `want` more bytes from the stream into the rewind buffer.
async fn fill(state: &mut WireState, want: usize) -> Result<()> {
    let Some(source) = state.source.clone() else {
        return Err(JdwpError::PayloadUnavailable);
    };
    // Read into a scratch buffer first so a cancelled read leaves `buffered` intact.
    let mut chunk = vec![0u8; want.min(state.unread).min(READ_CHUNK)];
    let n = source.read(&mut chunk).await?;
    if n == 0 {
        return Err(unexpected_eof(state.unread));
    }
    state.buffered.extend_from_slice(&chunk[..n]);
    state.unread -= n;
    if state.unread == 0 {
        state.source = None;
    }
    Ok(())
}

fn unexpected_eof(missing: usize) -> JdwpError {
    JdwpError::from(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("stream ended with {missing} payload bytes outstanding"),
    ))
}
