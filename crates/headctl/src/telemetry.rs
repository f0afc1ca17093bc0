//! Logging initialization.
//!
//! Installs a `tracing` fmt subscriber driven by [`LoggingConfig`]: level
//! filter (`RUST_LOG` wins), optional timestamps and thread ids, stderr output
//! plus an optional log file that is appended to or truncated.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use headconf::LoggingConfig;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize logging. Does nothing when logging is disabled.
pub fn init(config: &LoggingConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level {:?}", config.level))?;

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(std::io::stderr, config, true)];
    if let Some(path) = &config.path {
        let file = open_log(path, config.append)?;
        layers.push(fmt_layer(Mutex::new(file), config, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(path) = &config.path {
        tracing::debug!("logging to {}", path.display());
    }
    Ok(())
}

fn fmt_layer<W>(writer: W, config: &LoggingConfig, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_thread_ids(config.thread_ids);

    if config.timestamps {
        layer.boxed()
    } else {
        layer.without_time().boxed()
    }
}

fn open_log(path: &Path, append: bool) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }

    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}
