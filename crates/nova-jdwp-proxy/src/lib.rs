//! Library half of the `nova-jdwp-proxy` binary: configuration, logging and
//! the loop that serves one [`JdwpProxy`] per configured process.

pub mod config;
pub mod logging;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use nova_jdwp_mux::{JdwpProcess, JdwpProxy, TcpConnector, TracingPacketMonitor};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use config::{Config, ConfigError};

const LOG_TARGET: &str = "nova.jdwp.proxy";

/// A proxy whose listener is bound but not yet serving.
pub struct BoundProxy {
    name: String,
    proxy: JdwpProxy,
}

impl BoundProxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.proxy.local_addr()
    }

    pub fn process(&self) -> &JdwpProcess {
        self.proxy.process()
    }
}

/// Bind a listener for every configured process.
pub async fn bind_all(config: &Config) -> anyhow::Result<Vec<BoundProxy>> {
    config.validate()?;
    let mut bound = Vec::with_capacity(config.processes.len());
    for process_config in &config.processes {
        let name = process_config.display_name();
        let target = process_config.target_addr()?;

        let mut options = config.process_options();
        if config.session.trace_packets {
            options
                .shared
                .monitors
                .push(Arc::new(TracingPacketMonitor::new(name.clone())));
        }
        let process = JdwpProcess::new(
            process_config.process_id(),
            Arc::new(TcpConnector::new(target)),
            options,
        );
        let proxy = JdwpProxy::bind(process, config.proxy_config(process_config))
            .await
            .with_context(|| format!("failed to bind proxy listener for {name}"))?;
        tracing::info!(
            target: LOG_TARGET,
            process = %name,
            %target,
            listen = %proxy.local_addr(),
            "JDWP proxy listening"
        );
        bound.push(BoundProxy { name, proxy });
    }
    Ok(bound)
}

/// Serve every proxy until `cancel` fires or all of them have stopped.
///
/// A proxy stops on its own when its VM disconnects; the others keep running.
pub async fn serve(proxies: Vec<BoundProxy>, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut tasks = JoinSet::new();
    for BoundProxy { name, proxy } in proxies {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let process = proxy.process().clone();
            let result = proxy.run(cancel).await;
            process.close().await;
            (name, result)
        });
    }

    let mut failures = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => {
                tracing::debug!(target: LOG_TARGET, process = %name, "proxy finished")
            }
            Ok((name, Err(err))) => {
                failures += 1;
                tracing::error!(target: LOG_TARGET, process = %name, error = %err, "proxy failed");
            }
            Err(err) => {
                failures += 1;
                tracing::error!(target: LOG_TARGET, error = %err, "proxy task panicked");
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} proxy task(s) failed");
    }
    Ok(())
}
