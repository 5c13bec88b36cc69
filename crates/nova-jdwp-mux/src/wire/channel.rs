use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{JdwpError, Result};

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Read half of a session socket, shared between the session (headers) and the
/// payloads it hands out.
///
/// Every read races the session's `closed` token, and reads are cancel safe:
/// a dropped read never consumes bytes.
pub(crate) struct InputChannel {
    input: Arc<Mutex<Option<BoxedRead>>>,
    closed: CancellationToken,
}

impl InputChannel {
    pub(crate) fn new(input: BoxedRead, closed: CancellationToken) -> Self {
        Self {
            input: Arc::new(Mutex::new(Some(input))),
            closed,
        }
    }

    /// Read at most `buf.len()` bytes. `Ok(0)` means end of stream.
    pub(crate) async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut input = tokio::select! {
            _ = self.closed.cancelled() => return Err(JdwpError::Closed("JDWP session")),
            guard = self.input.lock() => guard,
        };
        let Some(input) = input.as_mut() else {
            return Err(JdwpError::Closed("JDWP session"));
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(JdwpError::Closed("JDWP session")),
            res = input.read(buf) => Ok(res?),
        }
    }

    /// Drop the read half. If a reader holds it right now, returns a future
    /// that drops it once that reader has bailed out on the `closed` token.
    pub(crate) fn release(&self) -> Option<impl Future<Output = ()> + Send + 'static> {
        match self.input.try_lock() {
            Ok(mut input) => {
                input.take();
                None
            }
            Err(_) => {
                let input = self.input.clone();
                Some(async move {
                    input.lock().await.take();
                })
            }
        }
    }
}
