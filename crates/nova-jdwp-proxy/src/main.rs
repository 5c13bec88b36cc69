use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use nova_jdwp_proxy::config::{Config, ProcessConfig};
use tokio_util::sync::CancellationToken;

/// Share a JVM's single JDWP connection with external debuggers.
///
/// Each configured process gets a local listening port; a debugger attached
/// there talks to the VM through the shared connection.
#[derive(Debug, Parser)]
#[command(name = "nova-jdwp-proxy", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `NOVA_JDWP_PROXY_CONFIG` is used as a fallback. When neither
    /// is provided the proxy starts from defaults plus the flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JDWP socket of a JVM (`host:port`) to proxy, in addition to any
    /// `[[process]]` entries.
    #[arg(long, requires = "pid")]
    target: Option<String>,

    /// Process id of the JVM given with `--target`.
    #[arg(long, requires = "target")]
    pid: Option<u32>,

    /// Interface debugger-facing listeners bind to.
    #[arg(long)]
    listen: Option<IpAddr>,

    /// Fixed debugger-facing port for the `--target` process.
    #[arg(long, requires = "target")]
    port: Option<u16>,

    /// Overrides `[logging] level`.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<Config> {
        let path = self
            .config
            .or_else(|| std::env::var_os("NOVA_JDWP_PROXY_CONFIG").map(PathBuf::from));
        let mut config = match path {
            Some(path) => Config::load_from_path(&path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(host) = self.listen {
            config.proxy.host = host;
        }
        if let (Some(target), Some(pid)) = (self.target, self.pid) {
            let mut process = ProcessConfig::new(pid, target);
            process.port = self.port.unwrap_or(0);
            config.processes.push(process);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config()?;
    nova_jdwp_proxy::logging::init(&config.logging);

    let proxies = nova_jdwp_proxy::bind_all(&config).await?;
    for proxy in &proxies {
        println!("{}: listening on {}", proxy.name(), proxy.local_addr());
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(target: "nova.jdwp.proxy", "interrupted; shutting down");
            }
            cancel.cancel();
        }
    });

    nova_jdwp_proxy::serve(proxies, cancel).await
}
