//! `tracing` subscriber setup for the proxy binary.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Map forgiving level spellings to `EnvFilter` directives. Anything that is
/// not a plain level is passed through as a directive string.
pub fn normalize_level_directives(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return "info".to_owned();
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "trace" => "trace".to_owned(),
        "debug" => "debug".to_owned(),
        "info" => "info".to_owned(),
        "warn" | "warning" => "warn".to_owned(),
        "error" => "error".to_owned(),
        _ => trimmed.to_owned(),
    }
}

/// The effective filter: `[logging] level` with `RUST_LOG` merged on top.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    let env_directives = std::env::var("RUST_LOG")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty());
    filter_from(&config.level, env_directives.as_deref())
}

fn filter_from(level: &str, env_directives: Option<&str>) -> EnvFilter {
    let config_directives = normalize_level_directives(level);
    let config_filter = || {
        EnvFilter::try_new(&config_directives).unwrap_or_else(|_| {
            EnvFilter::default().add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    };
    match env_directives {
        Some(env_directives) => EnvFilter::try_new(format!("{config_directives},{env_directives}"))
            .or_else(|_| EnvFilter::try_new(env_directives))
            .unwrap_or_else(|_| config_filter()),
        None => config_filter(),
    }
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init(config: &LoggingConfig) -> bool {
    let mut make_writer = BoxMakeWriter::new(std::io::sink);
    if config.stderr {
        make_writer = BoxMakeWriter::new(make_writer.and(std::io::stderr));
    }

    let mut file_error = None;
    if let Some(path) = &config.file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                make_writer = BoxMakeWriter::new(make_writer.and(Arc::new(file)));
            }
            Err(err) => file_error = Some(err),
        }
    }

    let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(make_writer)
            .with_ansi(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(make_writer)
            .with_ansi(false)
            .boxed()
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return false;
    }

    if let (Some(path), Some(err)) = (&config.file, file_error) {
        tracing::warn!(
            target: "nova.jdwp.proxy",
            path = %path.display(),
            error = %err,
            "failed to open log file; file logging disabled"
        );
    }
    true
}
