use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Delivery, Shared};
use crate::filter::FilterId;
use crate::wire::Packet;
use crate::{BoxFuture, JdwpError, Result, LOG_TARGET};

type Activation = Box<dyn FnOnce() -> BoxFuture<Result<()>> + Send>;

/// A not-yet-registered subscription to a [`super::SharedJdwpSession`].
///
/// Nothing is received until one of the consuming methods runs; the receiver
/// is registered for exactly as long as that call is in progress.
pub struct PacketReceiver {
    shared: Arc<Shared>,
    name: String,
    filter: Option<FilterId>,
    activation: Option<Activation>,
}

impl PacketReceiver {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            name: "receiver".to_string(),
            filter: None,
            activation: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_filter(mut self, filter: FilterId) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Run `activation` once the receiver is registered, concurrently with
    /// packet delivery. Anything it sends is guaranteed to have its reply
    /// observed by this receiver. An activation error ends the receive call.
    pub fn with_activation<F, Fut>(mut self, activation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.activation = Some(Box::new(move || Box::pin(activation())));
        self
    }

    /// Feed packets to `on_packet` until it breaks or the session ends.
    ///
    /// Replay packets come first, then live packets in arrival order. Returns
    /// `Ok(Some(_))` on break and `Ok(None)` if the VM closed the connection.
    /// Packets passed to `on_packet` are only readable until it returns; keep
    /// them with [`Packet::to_offline`].
    pub async fn receive<R, F, Fut>(self, mut on_packet: F) -> Result<Option<R>>
    where
        F: FnMut(Packet) -> Fut,
        Fut: Future<Output = Result<ControlFlow<R>>>,
    {
        let Self {
            shared,
            name,
            filter,
            activation,
        } = self;

        let (sender, mut deliveries) = mpsc::channel(1);
        let (registration, replay) = shared.register(sender)?;
        let mut registration = Some(registration);
        tracing::debug!(
            target: LOG_TARGET,
            session = %shared.name,
            receiver = %name,
            replay = replay.len(),
            "receiver registered"
        );

        let deliver = async {
            for packet in replay {
                if !shared.keep(filter, &packet) {
                    continue;
                }
                if let ControlFlow::Break(value) = on_packet(packet).await? {
                    return Ok(Some(value));
                }
            }
            if let Some(err) = shared.terminal() {
                return end_of_session(err);
            }
            while let Some(delivery) = deliveries.recv().await {
                match delivery {
                    Delivery::Packet { packet, done } => {
                        let flow = if shared.keep(filter, &packet) {
                            on_packet(packet).await
                        } else {
                            Ok(ControlFlow::Continue(()))
                        };
                        if !matches!(flow, Ok(ControlFlow::Continue(()))) {
                            // Leave before releasing the packet so the reader can park.
                            registration.take();
                        }
                        drop(done);
                        if let ControlFlow::Break(value) = flow? {
                            return Ok(Some(value));
                        }
                    }
                    Delivery::End(err) => return end_of_session(err),
                }
            }
            // The registry dropped our sender: the session was closed.
            Err(JdwpError::Cancelled)
        };
        let activate = async move {
            match activation {
                Some(start) => start().await,
                None => Ok(()),
            }
        };
        tokio::pin!(deliver);
        tokio::pin!(activate);

        let scope = shared.scope().clone();
        let mut activated = false;
        let result = loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => break Err(JdwpError::Cancelled),
                res = &mut activate, if !activated => {
                    activated = true;
                    if let Err(err) = res {
                        break Err(err);
                    }
                }
                res = &mut deliver => break res,
            }
        };
        tracing::debug!(target: LOG_TARGET, session = %shared.name, receiver = %name, "receiver finished");
        result
    }

    /// Offline copy of the first packet matching `predicate`; `None` if the
    /// session ends first.
    pub async fn receive_first<P>(self, mut predicate: P) -> Result<Option<Packet>>
    where
        P: FnMut(&Packet) -> bool,
    {
        self.receive(|packet| {
            let matched = predicate(&packet);
            async move {
                if matched {
                    Ok::<_, JdwpError>(ControlFlow::Break(packet.into_offline().await?))
                } else {
                    Ok(ControlFlow::Continue(()))
                }
            }
        })
        .await
    }

    /// Consume packets while `predicate` holds.
    pub async fn receive_while<P>(self, mut predicate: P) -> Result<()>
    where
        P: FnMut(&Packet) -> bool,
    {
        self.receive(|packet| {
            let flow = if predicate(&packet) {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            };
            async move { Ok::<_, JdwpError>(flow) }
        })
        .await
        .map(|_| ())
    }

    /// Register in a background task and stream offline packets through a
    /// bounded channel. Dropping the flow unregisters the receiver.
    pub fn flow(self) -> PacketFlow {
        let (sender, packets) = mpsc::channel(self.shared.flow_buffer());
        let forward = sender.clone();
        let task = tokio::spawn(async move {
            let result = self
                .receive(move |packet| {
                    let forward = forward.clone();
                    async move {
                        let packet = packet.into_offline().await?;
                        Ok::<_, JdwpError>(match forward.send(Ok(packet)).await {
                            Ok(()) => ControlFlow::Continue(()),
                            Err(_) => ControlFlow::Break(()),
                        })
                    }
                })
                .await;
            if let Err(err) = result {
                let _ = sender.send(Err(err)).await;
            }
        });
        PacketFlow { packets, task }
    }
}

fn end_of_session<R>(err: JdwpError) -> Result<Option<R>> {
    match err {
        JdwpError::EndOfStream => Ok(None),
        err => Err(err),
    }
}

/// Stream of offline packets produced by [`PacketReceiver::flow`].
///
/// `next` returns `None` once the session ended normally; a session failure
/// is yielded once as `Some(Err(_))`.
pub struct PacketFlow {
    packets: mpsc::Receiver<Result<Packet>>,
    task: JoinHandle<()>,
}

impl PacketFlow {
    pub async fn next(&mut self) -> Option<Result<Packet>> {
        self.packets.recv().await
    }
}

impl Drop for PacketFlow {
    fn drop(&mut self) {
        self.task.abort();
    }
}
