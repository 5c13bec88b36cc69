//! Fan-out of one JDWP connection to many receivers.
//!
//! A single reader task pulls packets from the [`JdwpSession`] and offers each
//! one to every registered receiver. A packet is only released (its payload
//! drained) once every receiver's callback has returned, so a slow receiver
//! delays the next packet but never loses one. The reader parks while no
//! receiver is registered.
//!
//! Packets sent through [`SharedJdwpSession::send_packet`] are written by a
//! detached task, so cancelling a caller never leaves a half-written packet on
//! the wire.

mod receiver;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::filter::{FilterSet, PacketFilter};
use crate::monitor::PacketMonitor;
use crate::refcount::AutoShutdown;
use crate::session::JdwpSession;
use crate::sync::MutexExt;
use crate::wire::Packet;
use crate::{JdwpError, Result, LOG_TARGET};

pub use receiver::{PacketFlow, PacketReceiver};

#[derive(Clone)]
pub struct SharedSessionOptions {
    /// Upper bound on [`SharedJdwpSession::add_replay_packet`]; extra packets
    /// are dropped.
    pub max_replay_packets: usize,
    /// Capacity of the channel behind [`PacketReceiver::flow`].
    pub flow_buffer: usize,
    pub monitors: Vec<Arc<dyn PacketMonitor>>,
    /// Filters in addition to the built-in [`crate::NoDdmsPacketFilter`].
    pub filters: Vec<Arc<dyn PacketFilter>>,
}

impl Default for SharedSessionOptions {
    fn default() -> Self {
        Self {
            max_replay_packets: 128,
            flow_buffer: 16,
            monitors: Vec::new(),
            filters: Vec::new(),
        }
    }
}

impl fmt::Debug for SharedSessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSessionOptions")
            .field("max_replay_packets", &self.max_replay_packets)
            .field("flow_buffer", &self.flow_buffer)
            .field("monitors", &self.monitors.len())
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Handle to a multiplexed JDWP session. Clones share the same session.
#[derive(Clone)]
pub struct SharedJdwpSession {
    inner: Arc<Shared>,
}

pub(crate) struct Shared {
    name: String,
    session: JdwpSession,
    max_replay_packets: usize,
    flow_buffer: usize,
    registry: Mutex<Registry>,
    receiver_count: watch::Sender<usize>,
    terminal: OnceLock<JdwpError>,
    filters: FilterSet,
    monitors: Vec<Arc<dyn PacketMonitor>>,
    reader_started: AtomicBool,
    closed: AtomicBool,
    scope: CancellationToken,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    receivers: BTreeMap<u64, mpsc::Sender<Delivery>>,
    replay: Vec<Packet>,
}

pub(crate) enum Delivery {
    /// `done` is dropped once the receiver has finished with the packet.
    Packet {
        packet: Packet,
        done: oneshot::Sender<()>,
    },
    End(JdwpError),
}

impl SharedJdwpSession {
    pub fn new(session: JdwpSession, options: SharedSessionOptions) -> Self {
        let (receiver_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Shared {
                name: session.name().to_string(),
                session,
                max_replay_packets: options.max_replay_packets,
                flow_buffer: options.flow_buffer.max(1),
                registry: Mutex::new(Registry::default()),
                receiver_count,
                terminal: OnceLock::new(),
                filters: FilterSet::new(options.filters),
                monitors: options.monitors,
                reader_started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                scope: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn new_receiver(&self) -> PacketReceiver {
        PacketReceiver::new(self.inner.clone())
    }

    pub fn receiver_count(&self) -> usize {
        *self.inner.receiver_count.borrow()
    }

    pub fn next_packet_id(&self) -> Result<u32> {
        self.inner.session.next_packet_id()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Write `packet` to the VM. Concurrent callers are serialized; each packet
    /// is written atomically even if this future is dropped midway.
    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        self.inner.check_open()?;
        let inner = self.inner.clone();
        let write = tokio::spawn(async move {
            for monitor in &inner.monitors {
                monitor.on_send_packet(packet.header());
            }
            inner.filters.before_send_packet(packet.header());
            tokio::select! {
                _ = inner.scope.cancelled() => Err(JdwpError::Cancelled),
                res = inner.session.send_packet(&packet) => res,
            }
        });
        match write.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(JdwpError::Cancelled),
        }
    }

    /// Remember `packet` so receivers registered from now on see it first.
    pub async fn add_replay_packet(&self, packet: &Packet) -> Result<()> {
        let offline = packet.to_offline().await?;
        let mut registry = self.inner.registry.lock_or_recover("SharedJdwpSession.registry");
        if registry.replay.len() >= self.inner.max_replay_packets {
            tracing::warn!(
                target: LOG_TARGET,
                session = %self.inner.name,
                packet = %offline,
                limit = self.inner.max_replay_packets,
                "replay packet list is full; dropping packet"
            );
            return Ok(());
        }
        registry.replay.push(offline);
        Ok(())
    }

    /// Send `command` and wait for the reply with the same id.
    pub async fn handle_command(&self, command: Packet) -> Result<Packet> {
        if !command.is_command() {
            return Err(JdwpError::InvalidPacketKind(
                "handle_command expects a command packet",
            ));
        }
        let id = command.id();
        let sender = self.clone();
        let reply = self
            .new_receiver()
            .with_name(format!("reply to {command}"))
            .with_activation(move || async move { sender.send_packet(command).await })
            .receive_first(move |packet| packet.is_reply() && packet.id() == id)
            .await?;
        reply.ok_or_else(|| {
            JdwpError::Protocol(format!(
                "JDWP session ended before the reply to packet {id} arrived"
            ))
        })
    }

    /// Half-close the connection to the VM.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::debug!(target: LOG_TARGET, session = %self.inner.name, "shutting down shared session");
        self.inner.session.shutdown().await
    }

    /// Close the connection; every pending receiver fails with
    /// [`JdwpError::Cancelled`].
    pub fn close(&self) {
        self.inner.close();
    }
}

impl AutoShutdown for SharedJdwpSession {
    async fn shutdown(&self) -> Result<()> {
        SharedJdwpSession::shutdown(self).await
    }

    fn close(&self) {
        SharedJdwpSession::close(self)
    }
}

impl fmt::Debug for SharedJdwpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedJdwpSession")
            .field("name", &self.inner.name)
            .field("receivers", &self.receiver_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Deregisters a receiver when dropped.
pub(crate) struct Registration {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut registry = self.shared.registry.lock_or_recover("SharedJdwpSession.registry");
        if registry.receivers.remove(&self.id).is_some() {
            self.shared.receiver_count.send_replace(registry.receivers.len());
        }
    }
}

impl Shared {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JdwpError::Closed("shared JDWP session"));
        }
        Ok(())
    }

    /// Add a receiver and take its replay snapshot atomically, so a packet is
    /// never both replayed to and broadcast to the same receiver.
    pub(crate) fn register(
        self: &Arc<Self>,
        sender: mpsc::Sender<Delivery>,
    ) -> Result<(Registration, Vec<Packet>)> {
        let (id, replay) = {
            let mut registry = self.registry.lock_or_recover("SharedJdwpSession.registry");
            self.check_open()?;
            let id = registry.next_id;
            registry.next_id += 1;
            registry.receivers.insert(id, sender);
            self.receiver_count.send_replace(registry.receivers.len());
            (id, registry.replay.clone())
        };
        if !self.reader_started.swap(true, Ordering::AcqRel) {
            tokio::spawn(self.clone().read_loop());
        }
        Ok((
            Registration {
                shared: self.clone(),
                id,
            },
            replay,
        ))
    }

    pub(crate) fn terminal(&self) -> Option<JdwpError> {
        self.terminal.get().cloned()
    }

    pub(crate) fn keep(&self, filter: Option<crate::FilterId>, packet: &Packet) -> bool {
        self.filters.keep(filter, packet.header())
    }

    pub(crate) fn flow_buffer(&self) -> usize {
        self.flow_buffer
    }

    pub(crate) fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    fn snapshot(&self) -> Vec<mpsc::Sender<Delivery>> {
        self.registry
            .lock_or_recover("SharedJdwpSession.registry")
            .receivers
            .values()
            .cloned()
            .collect()
    }

    async fn read_loop(self: Arc<Self>) {
        tracing::debug!(target: LOG_TARGET, session = %self.name, "shared session reader started");
        let mut receivers = self.receiver_count.subscribe();
        loop {
            let listening = tokio::select! {
                _ = self.scope.cancelled() => break,
                res = receivers.wait_for(|count| *count > 0) => res.is_ok(),
            };
            if !listening {
                break;
            }

            let received = tokio::select! {
                _ = self.scope.cancelled() => break,
                res = self.session.receive_packet() => res,
            };
            match received {
                Ok(packet) => {
                    tokio::select! {
                        _ = self.scope.cancelled() => break,
                        _ = self.broadcast(packet) => {}
                    }
                }
                Err(JdwpError::Cancelled | JdwpError::Closed(_)) => break,
                Err(err) => {
                    self.finish(err).await;
                    break;
                }
            }
        }
        tracing::debug!(target: LOG_TARGET, session = %self.name, "shared session reader stopped");
    }

    async fn broadcast(&self, packet: Packet) {
        for monitor in &self.monitors {
            monitor.on_receive_packet(packet.header());
        }
        let targets = self.snapshot();
        tracing::trace!(
            target: LOG_TARGET,
            session = %self.name,
            %packet,
            receivers = targets.len(),
            "dispatching packet"
        );

        let mut pending = Vec::with_capacity(targets.len());
        for target in targets {
            let (done, finished) = oneshot::channel();
            let delivery = Delivery::Packet {
                packet: packet.clone(),
                done,
            };
            if target.send(delivery).await.is_ok() {
                pending.push(finished);
            }
        }
        // A receiver that went away drops its `done` sender, which also resolves this.
        for finished in pending {
            let _ = finished.await;
        }

        self.filters.after_receive_packet(packet.header());
        if let Err(err) = packet.shutdown().await {
            tracing::debug!(target: LOG_TARGET, session = %self.name, error = %err, "failed to drain packet payload");
        }
    }

    async fn finish(&self, err: JdwpError) {
        let _ = self.terminal.set(err.clone());
        if matches!(err, JdwpError::EndOfStream) {
            tracing::debug!(target: LOG_TARGET, session = %self.name, "VM closed the JDWP connection");
        } else {
            tracing::warn!(target: LOG_TARGET, session = %self.name, error = %err, "shared JDWP session failed");
        }
        for target in self.snapshot() {
            let _ = target.send(Delivery::End(err.clone())).await;
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scope.cancel();
        self.session.close();
        let receivers = {
            let mut registry = self.registry.lock_or_recover("SharedJdwpSession.registry");
            registry.replay.clear();
            std::mem::take(&mut registry.receivers)
        };
        self.receiver_count.send_replace(0);
        drop(receivers);
        for monitor in &self.monitors {
            monitor.close();
        }
        tracing::debug!(target: LOG_TARGET, session = %self.name, "closed shared session");
    }
}

#[cfg(test)]
mod tests;
