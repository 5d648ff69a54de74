//! preprocd - Metric Value Preprocessing Service
//!
//! Reads item values as JSON lines from stdin, runs them through the
//! preprocessing pipeline and writes the processed values as JSON lines to
//! stdout, in arrival order. Logs go to stderr and, when configured, to a
//! daily rolling file.
//!
//! Input line:
//!
//! ```json
//! {"itemid": 10, "value_type": "float", "value": "21", "ts": {"sec": 100, "ns": 0}}
//! ```

use anyhow::Context;
use clap::Parser;
use preproc_rs::{
    backend::BuiltinStepExecutor,
    config::{default_config_path, AppConfig, LogConfig, StaticConfigSource},
    pipeline::{ChannelSink, Preprocessing, SinkKind, SinkRecord, ValueBatcher},
    types::{ItemFlags, ItemState, ItemValue, Timespec, ValueType},
    variant::Variant,
};
use serde::Deserialize;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "preprocd", version, about = "Metric value preprocessing service")]
struct Cli {
    /// Service configuration file
    #[arg(short, long, env = "PREPROCD_CONFIG")]
    config: Option<PathBuf>,

    /// Item configuration store, overrides `items_file` from the config
    #[arg(short, long, env = "PREPROCD_ITEMS")]
    items: Option<PathBuf>,

    /// Number of preprocessing workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Seconds to wait for the queue to drain at end of input
    #[arg(long, default_value_t = 60)]
    drain_timeout: u64,
}

/// One input line
#[derive(Debug, Deserialize)]
struct InputValue {
    itemid: u64,
    #[serde(default)]
    value_type: ValueType,
    #[serde(default)]
    value: Option<String>,
    /// Collection error, makes the value not supported
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<Timespec>,
    #[serde(default)]
    discovery: bool,
}

impl From<InputValue> for ItemValue {
    fn from(input: InputValue) -> Self {
        let mut value = match input.error {
            Some(error) => ItemValue::not_supported(input.itemid, input.value_type, error),
            None => ItemValue::new(
                input.itemid,
                input.value_type,
                input.value.map(Variant::Str).unwrap_or_default(),
            ),
        };
        value.ts = input.ts;
        if input.discovery {
            value.flags = ItemFlags::DISCOVERY_RULE;
        }
        value
    }
}

/// Keeps the non-blocking file writer alive until exit
type LogGuard = Option<tracing_appender::non_blocking::WorkerGuard>;

fn init_logging(log: &LogConfig) -> LogGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));

    let (file_layer, guard) = match &log.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "preprocd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading configuration from {:?}", path))?,
        None => default_config_path()
            .filter(|p| p.exists())
            .map(AppConfig::load_or_default)
            .unwrap_or_default(),
    };

    if let Some(items) = &cli.items {
        config.items_file = Some(items.clone());
    }
    if let Some(workers) = cli.workers {
        config.preprocessing.workers = workers;
    }
    config.preprocessing.validate()?;
    Ok(config)
}

fn output_line(record: &SinkRecord) -> serde_json::Value {
    let value = &record.value;
    let kind = match record.kind {
        SinkKind::Value => "value",
        SinkKind::Discovery => "discovery",
    };
    let state = match value.state {
        ItemState::Normal => "normal",
        ItemState::NotSupported => "not_supported",
    };
    serde_json::json!({
        "itemid": value.itemid,
        "kind": kind,
        "state": state,
        "value": value.value.to_str(),
        "error": value.error,
        "ts": value.ts,
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let _guard = init_logging(&config.log);

    tracing::info!("Starting preprocessing service");

    let source = match &config.items_file {
        Some(path) => StaticConfigSource::load(path)
            .with_context(|| format!("loading items from {:?}", path))?,
        None => {
            tracing::warn!("No item configuration, values pass through unchanged");
            StaticConfigSource::new()
        }
    };

    let (out_tx, out_rx) = crossbeam_channel::unbounded::<SinkRecord>();
    let writer = std::thread::Builder::new()
        .name("preprocd-output".to_string())
        .spawn(move || -> std::io::Result<()> {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for record in out_rx {
                serde_json::to_writer(&mut out, &output_line(&record))?;
                out.write_all(b"\n")?;
                out.flush()?;
            }
            Ok(())
        })
        .context("spawning output thread")?;

    let batch_size = config.preprocessing.batch_size;
    let pipeline = Preprocessing::start(
        config.preprocessing,
        Box::new(source),
        Box::new(ChannelSink::new(out_tx)),
        Arc::new(BuiltinStepExecutor::new()),
    )?;
    let client = pipeline.client();
    let mut batcher = ValueBatcher::new(client.clone(), batch_size);

    let stdin = std::io::stdin();
    for (lineno, line) in stdin.lock().lines().enumerate() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<InputValue>(&line) {
            Ok(input) => {
                let value: ItemValue = input.into();
                batcher.push(&value)?;
            }
            Err(e) => tracing::warn!("Skipping line {}: {}", lineno + 1, e),
        }
    }
    batcher.flush()?;

    tracing::info!("End of input, draining queue");
    if let Err(e) = client.wait_idle(
        Duration::from_millis(10),
        Duration::from_secs(cli.drain_timeout),
    ) {
        tracing::warn!("Queue not drained: {}", e);
    }

    pipeline.shutdown()?;
    match writer.join() {
        Ok(result) => result.context("writing output")?,
        Err(_) => anyhow::bail!("output thread panicked"),
    }

    tracing::info!("Preprocessing service stopped");
    Ok(())
}
