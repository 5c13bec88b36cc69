use crate::wire::PacketHeader;
use crate::LOG_TARGET;

/// Observes every packet a shared session sends or receives.
///
/// Callbacks run inline on the send and read paths and must not block.
pub trait PacketMonitor: Send + Sync {
    fn on_send_packet(&self, header: &PacketHeader);

    fn on_receive_packet(&self, header: &PacketHeader);

    /// Called once when the owning session closes.
    fn close(&self) {}
}

/// Logs packet headers at `trace` level.
#[derive(Debug, Clone)]
pub struct TracingPacketMonitor {
    name: String,
}

impl TracingPacketMonitor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PacketMonitor for TracingPacketMonitor {
    fn on_send_packet(&self, header: &PacketHeader) {
        tracing::trace!(target: LOG_TARGET, monitor = %self.name, %header, "-> vm");
    }

    fn on_receive_packet(&self, header: &PacketHeader) {
        tracing::trace!(target: LOG_TARGET, monitor = %self.name, %header, "<- vm");
    }
}
