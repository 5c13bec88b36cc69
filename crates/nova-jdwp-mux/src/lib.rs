//! Shared, multiplexed JDWP sessions.
//!
//! A JVM accepts exactly one JDWP connection at a time, yet several tools want
//! to talk to it at once: property collectors, allocation trackers and an
//! interactive debugger. This crate owns that single connection and fans it
//! out:
//!
//! - [`wire`] frames packets and performs the `JDWP-Handshake` exchange.
//! - [`session::JdwpSession`] is a 1:1 packet stream over one socket.
//! - [`refcount::ReferenceCounted`] opens a resource on first use and tears it
//!   down when the last user leaves.
//! - [`shared::SharedJdwpSession`] delivers every received packet to every
//!   active receiver and linearizes outgoing packets.
//! - [`proxy::JdwpProxy`] lets an external debugger attach through a local TCP
//!   port while internal receivers keep working.
//!
//! All logging goes through `tracing` under the `nova.jdwp` target.

mod sync;

pub mod ddms;
pub mod filter;
pub mod monitor;
pub mod process;
pub mod proxy;
pub mod refcount;
pub mod session;
pub mod shared;
pub mod wire;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

pub use filter::{FilterId, NoDdmsPacketFilter, PacketFilter};
pub use monitor::{PacketMonitor, TracingPacketMonitor};
pub use process::{JdwpConnector, JdwpProcess, ProcessId, ProcessOptions, TcpConnector};
pub use proxy::{JdwpProxy, ProxyConfig, ProxyState};
pub use refcount::{AutoShutdown, ReferenceCounted};
pub use session::{JdwpSession, JdwpSocket, SessionOptions};
pub use shared::{PacketFlow, PacketReceiver, SharedJdwpSession, SharedSessionOptions};
pub use wire::{Packet, PacketHeader, PacketKind, Payload, PayloadReader};

pub(crate) const LOG_TARGET: &str = "nova.jdwp";

/// Boxed future used at trait-object seams (connectors, factories, activations).
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub type Result<T, E = JdwpError> = std::result::Result<T, E>;

/// Errors produced by every layer of the crate.
///
/// The type is `Clone` so a single terminal failure of the shared read loop can
/// be handed to every receiver that observes it.
#[derive(Debug, Clone, Error)]
pub enum JdwpError {
    #[error("malformed JDWP packet: {0}")]
    MalformedPacket(String),
    #[error("JDWP stream reached end of input")]
    EndOfStream,
    #[error("JDWP I/O error: {0}")]
    Io(Arc<io::Error>),
    #[error("unsupported JDWP operation: {0}")]
    UnsupportedOperation(&'static str),
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("JDWP operation was cancelled")]
    Cancelled,
    #[error("{0} is closed")]
    Closed(&'static str),
    #[error("JDWP packet payload is no longer available")]
    PayloadUnavailable,
    #[error("invalid JDWP packet kind: {0}")]
    InvalidPacketKind(&'static str),
}

impl JdwpError {
    /// Whether the error ends the underlying connection for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JdwpError::EndOfStream | JdwpError::Io(_) | JdwpError::MalformedPacket(_)
        )
    }
}

impl From<io::Error> for JdwpError {
    fn from(err: io::Error) -> Self {
        JdwpError::Io(Arc::new(err))
    }
}
