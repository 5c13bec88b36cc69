//! A debuggable process and the shared JDWP session that reaches it.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::refcount::ReferenceCounted;
use crate::session::{JdwpSession, JdwpSocket, SessionOptions, DEFAULT_PACKET_ID_BASE};
use crate::shared::{SharedJdwpSession, SharedSessionOptions};
use crate::{BoxFuture, JdwpError, Result, LOG_TARGET};

/// Identity of a debuggable process, used in logs and session names.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessId {
    pub device: String,
    pub pid: u32,
}

impl ProcessId {
    pub fn new(device: impl Into<String>, pid: u32) -> Self {
        Self {
            device: device.into(),
            pid,
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/pid={}", self.device, self.pid)
    }
}

pub type BoxedSocket = Box<dyn JdwpSocket>;

/// Opens a fresh byte stream to a process's JDWP endpoint.
pub trait JdwpConnector: Send + Sync + 'static {
    fn connect(&self, process: &ProcessId) -> BoxFuture<io::Result<BoxedSocket>>;
}

/// Connects over plain TCP, e.g. to a `-agentlib:jdwp=transport=dt_socket`
/// JVM or a forwarded device port.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl JdwpConnector for TcpConnector {
    fn connect(&self, process: &ProcessId) -> BoxFuture<io::Result<BoxedSocket>> {
        let addr = self.addr;
        let process = process.to_string();
        Box::pin(async move {
            tracing::debug!(target: LOG_TARGET, %process, %addr, "connecting to JDWP endpoint");
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok::<_, io::Error>(Box::new(stream) as BoxedSocket)
        })
    }
}

#[derive(Clone, Debug)]
pub struct ProcessOptions {
    /// First id minted by the shared session; `None` disables minting.
    pub packet_id_base: Option<u32>,
    pub shared: SharedSessionOptions,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            packet_id_base: Some(DEFAULT_PACKET_ID_BASE),
            shared: SharedSessionOptions::default(),
        }
    }
}

/// Handle to one debuggable process.
///
/// The JDWP connection is opened on the first [`with_jdwp_session`] call and
/// closed once no call is in progress. Cheap to clone.
///
/// [`with_jdwp_session`]: JdwpProcess::with_jdwp_session
#[derive(Clone)]
pub struct JdwpProcess {
    inner: Arc<ProcessInner>,
}

struct ProcessInner {
    id: ProcessId,
    sessions: ReferenceCounted<SharedJdwpSession>,
    scope: CancellationToken,
}

impl JdwpProcess {
    pub fn new(id: ProcessId, connector: Arc<dyn JdwpConnector>, options: ProcessOptions) -> Self {
        let factory_id = id.clone();
        let sessions = ReferenceCounted::new(format!("jdwp session for {id}"), move || {
            let connector = connector.clone();
            let id = factory_id.clone();
            let options = options.clone();
            async move {
                let socket = connector.connect(&id).await?;
                let session = JdwpSession::open(
                    socket,
                    SessionOptions {
                        name: id.to_string(),
                        packet_id_base: options.packet_id_base,
                    },
                );
                Ok::<_, JdwpError>(SharedJdwpSession::new(session, options.shared))
            }
        });
        Self {
            inner: Arc::new(ProcessInner {
                id,
                sessions,
                scope: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.inner.id
    }

    /// Token cancelled when the process handle is closed.
    pub fn scope(&self) -> CancellationToken {
        self.inner.scope.clone()
    }

    /// Run `f` against the shared session, opening it if needed.
    pub async fn with_jdwp_session<R, F, Fut>(&self, f: F) -> Result<R>
    where
        F: FnOnce(SharedJdwpSession) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        if self.inner.scope.is_cancelled() {
            return Err(JdwpError::Closed("JDWP process"));
        }
        tokio::select! {
            _ = self.inner.scope.cancelled() => Err(JdwpError::Cancelled),
            res = self.inner.sessions.with_resource(f) => res,
        }
    }

    pub fn is_session_active(&self) -> bool {
        self.inner.sessions.is_active()
    }

    /// Tear down the session regardless of outstanding users. Used when the
    /// process or its device goes away.
    pub async fn close(&self) {
        if self.inner.scope.is_cancelled() {
            return;
        }
        tracing::debug!(target: LOG_TARGET, process = %self.inner.id, "closing JDWP process");
        self.inner.scope.cancel();
        self.inner.sessions.close().await;
    }
}

impl fmt::Debug for JdwpProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JdwpProcess")
            .field("id", &self.inner.id)
            .field("session_active", &self.is_session_active())
            .finish()
    }
}
