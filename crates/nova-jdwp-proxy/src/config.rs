//! TOML configuration for `nova-jdwp-proxy`.
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [session]
//! max_replay_packets = 128
//!
//! [proxy]
//! host = "127.0.0.1"
//!
//! [[process]]
//! name = "app"
//! pid = 4242
//! target = "127.0.0.1:5005"
//! port = 8700
//! ```

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use nova_jdwp_mux::session::DEFAULT_PACKET_ID_BASE;
use nova_jdwp_mux::{ProcessId, ProcessOptions, ProxyConfig, SharedSessionOptions};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a source snippet; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub proxy: ListenConfig,
    #[serde(default, rename = "process")]
    pub processes: Vec<ProcessConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive
    /// string. `RUST_LOG` is merged on top.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to this file as well. If it cannot be opened, file logging
    /// is skipped and the other sinks stay active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// First packet id minted for commands the proxy itself sends.
    #[serde(default = "SessionConfig::default_packet_id_base")]
    pub packet_id_base: u32,

    #[serde(default = "SessionConfig::default_max_replay_packets")]
    pub max_replay_packets: usize,

    /// Log every packet header at `trace` level.
    #[serde(default)]
    pub trace_packets: bool,
}

impl SessionConfig {
    fn default_packet_id_base() -> u32 {
        DEFAULT_PACKET_ID_BASE
    }

    fn default_max_replay_packets() -> usize {
        SharedSessionOptions::default().max_replay_packets
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            packet_id_base: Self::default_packet_id_base(),
            max_replay_packets: Self::default_max_replay_packets(),
            trace_packets: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    /// Interface the debugger-facing listeners bind to.
    #[serde(default = "ListenConfig::default_host")]
    pub host: IpAddr,
}

impl ListenConfig {
    fn default_host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    /// Label used in logs; defaults to `pid=<pid>`.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "ProcessConfig::default_device")]
    pub device: String,

    pub pid: u32,

    /// `host:port` of the JVM's JDWP socket.
    pub target: String,

    /// Fixed debugger-facing port; `0` or unset picks an ephemeral one.
    #[serde(default)]
    pub port: u16,
}

impl ProcessConfig {
    fn default_device() -> String {
        "local".to_owned()
    }

    pub fn new(pid: u32, target: impl Into<String>) -> Self {
        Self {
            name: None,
            device: Self::default_device(),
            pid,
            target: target.into(),
            port: 0,
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("pid={}", self.pid))
    }

    pub fn process_id(&self) -> ProcessId {
        ProcessId::new(self.device.clone(), self.pid)
    }

    pub fn target_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.target.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "process {}: target `{}` is not a socket address",
                self.display_name(),
                self.target
            ))
        })
    }
}

impl Config {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Check the semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processes.is_empty() {
            return Err(ConfigError::Invalid(
                "no process configured; add a [[process]] entry or pass --target and --pid".into(),
            ));
        }
        if self.session.max_replay_packets == 0 {
            return Err(ConfigError::Invalid(
                "session.max_replay_packets must be at least 1".into(),
            ));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for process in &self.processes {
            process.target_addr()?;
            let name = process.display_name();
            if !names.insert(name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate process name `{name}`"
                )));
            }
            if process.port != 0 && !ports.insert(process.port) {
                return Err(ConfigError::Invalid(format!(
                    "process {name}: port {} is already used by another process",
                    process.port
                )));
            }
        }
        Ok(())
    }

    pub fn process_options(&self) -> ProcessOptions {
        ProcessOptions {
            packet_id_base: Some(self.session.packet_id_base),
            shared: SharedSessionOptions {
                max_replay_packets: self.session.max_replay_packets,
                ..SharedSessionOptions::default()
            },
        }
    }

    pub fn proxy_config(&self, process: &ProcessConfig) -> ProxyConfig {
        ProxyConfig {
            listen_host: self.proxy.host,
            port: process.port,
        }
    }
}
