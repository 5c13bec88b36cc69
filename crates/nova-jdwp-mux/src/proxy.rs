//! Lets an external debugger attach to a process whose JDWP connection is
//! already owned by a [`SharedJdwpSession`].
//!
//! The proxy listens on a local port. For each accepted debugger it retains
//! the process's shared session and forwards packets both ways until either
//! side disconnects, then waits for the next debugger:
//!
//! ```text
//! Idle -> AwaitingConnection -> Proxying -> AwaitingConnection -> ...
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::filter::FilterId;
use crate::process::JdwpProcess;
use crate::session::{JdwpSession, SessionOptions};
use crate::shared::SharedJdwpSession;
use crate::{JdwpError, Result, LOG_TARGET};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_host: IpAddr,
    /// `0` picks an ephemeral port.
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyState {
    Idle,
    AwaitingConnection { port: u16 },
    Proxying { port: u16, peer: SocketAddr },
}

pub struct JdwpProxy {
    process: JdwpProcess,
    listener: TcpListener,
    local_addr: SocketAddr,
    state: watch::Sender<ProxyState>,
}

impl JdwpProxy {
    pub async fn bind(process: JdwpProcess, config: ProxyConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.listen_host, config.port)).await?;
        let local_addr = listener.local_addr()?;
        let (state, _) = watch::channel(ProxyState::Idle);
        tracing::debug!(
            target: LOG_TARGET,
            process = %process.id(),
            %local_addr,
            "JDWP proxy bound"
        );
        Ok(Self {
            process,
            listener,
            local_addr,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn process(&self) -> &JdwpProcess {
        &self.process
    }

    pub fn state(&self) -> watch::Receiver<ProxyState> {
        self.state.subscribe()
    }

    /// Accept debuggers one at a time until `cancel` fires, the process is
    /// closed or the VM disconnects. Connection failures are logged and never
    /// end the loop.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let port = self.local_addr.port();
        let process_scope = self.process.scope();
        loop {
            self.set_state(ProxyState::AwaitingConnection { port });
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = process_scope.cancelled() => break,
                res = self.listener.accept() => res,
            };
            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(target: LOG_TARGET, port, error = %err, "failed to accept debugger connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            if let Err(err) = socket.set_nodelay(true) {
                tracing::debug!(target: LOG_TARGET, %peer, error = %err, "failed to set TCP_NODELAY");
            }

            self.set_state(ProxyState::Proxying { port, peer });
            tracing::info!(target: LOG_TARGET, process = %self.process.id(), %peer, "debugger attached");
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self
                    .process
                    .with_jdwp_session(|shared| forward(shared, socket, peer)) => res,
            };
            match result {
                Ok(Ended::Debugger) => {
                    tracing::info!(target: LOG_TARGET, process = %self.process.id(), %peer, "debugger detached")
                }
                Ok(Ended::Vm) => {
                    tracing::info!(target: LOG_TARGET, process = %self.process.id(), %peer, "VM closed its JDWP connection");
                    break;
                }
                Err(JdwpError::Cancelled) if process_scope.is_cancelled() => break,
                Err(err) => tracing::warn!(
                    target: LOG_TARGET,
                    process = %self.process.id(),
                    %peer,
                    error = %err,
                    "JDWP proxy connection ended with an error"
                ),
            }
        }
        self.set_state(ProxyState::Idle);
        tracing::debug!(target: LOG_TARGET, process = %self.process.id(), port, "JDWP proxy stopped");
        Ok(())
    }

    fn set_state(&self, state: ProxyState) {
        tracing::debug!(target: LOG_TARGET, process = %self.process.id(), ?state, "JDWP proxy state");
        self.state.send_replace(state);
    }
}

/// Which side ended a proxied connection.
enum Ended {
    Debugger,
    Vm,
}

/// Forward packets between one debugger socket and the shared session until
/// either side stops.
async fn forward(shared: SharedJdwpSession, socket: TcpStream, peer: SocketAddr) -> Result<Ended> {
    let external = Arc::new(JdwpSession::open(
        socket,
        SessionOptions::pass_through(format!("debugger {peer}")),
    ));
    let (registered, ready) = oneshot::channel();

    let to_debugger = {
        let external = external.clone();
        shared
            .new_receiver()
            .with_name(format!("debugger {peer}"))
            .with_filter(FilterId::NO_DDMS)
            .with_activation(move || async move {
                let _ = registered.send(());
                Ok(())
            })
            .receive(move |packet| {
                let external = external.clone();
                async move {
                    external.send_packet(&packet).await?;
                    Ok::<_, JdwpError>(ControlFlow::<()>::Continue(()))
                }
            })
    };

    let from_debugger = async {
        // Forward nothing until the receiver above can see the replies.
        ready.await.map_err(|_| JdwpError::Cancelled)?;
        loop {
            let packet = match external.receive_packet().await {
                Ok(packet) => packet,
                Err(JdwpError::EndOfStream) => return Ok(()),
                Err(err) => return Err(err),
            };
            // The write to the VM may outlive this loop; it must not depend on
            // the debugger socket.
            let packet = packet.into_offline().await?;
            shared.send_packet(packet).await?;
        }
    };

    let result = tokio::select! {
        res = to_debugger => res.map(|_| Ended::Vm),
        res = from_debugger => res.map(|()| Ended::Debugger),
    };
    if let Err(err) = external.shutdown().await {
        tracing::debug!(target: LOG_TARGET, %peer, error = %err, "failed to shut down debugger connection");
    }
    external.close();
    result
}
