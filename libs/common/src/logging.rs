//! Logging bootstrap shared by the meter services and tools
//!
//! Console output uses the bracketed level format
//! (`2025-12-02T00:50:44.809Z [INFO] Poll cycle done`). An optional log
//! directory adds a daily-rolling file written through a non-blocking worker;
//! the returned guard must live as long as the process logs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{
        self,
        format::Writer,
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub type LogResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// `timestamp [LEVEL] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Logger configuration, usually the `logging` section of a service config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level or full filter directive ("info", "info,meter_protocols=debug")
    #[serde(default = "default_level")]
    pub level: String,
    /// Directory for daily-rolling log files; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// JSON lines instead of the bracketed format
    #[serde(default)]
    pub json: bool,
    /// Colored console output
    #[serde(default = "default_ansi")]
    pub ansi: bool,
    /// Console output on stderr, keeping stdout for command output
    #[serde(default)]
    pub stderr: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: None,
            json: false,
            ansi: default_ansi(),
            stderr: false,
        }
    }
}

/// Effective filter directive: a non-empty `RUST_LOG` wins over the configured level
pub fn filter_directive(configured: &str, rust_log: Option<&str>) -> String {
    match rust_log.map(str::trim) {
        Some(env) if !env.is_empty() => env.to_string(),
        _ if configured.trim().is_empty() => default_level(),
        _ => configured.trim().to_string(),
    }
}

/// Install the global subscriber
///
/// `service_name` names the log file (`<service>.log.YYYY-MM-DD`).
pub fn init_logging(service_name: &str, config: &LogConfig) -> LogResult<Option<WorkerGuard>> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(&config.level, rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| format!("Invalid log filter '{}': {}", directive, e))?;

    let console_layer = match (config.json, config.stderr) {
        (true, false) => fmt::layer().json().with_target(true).boxed(),
        (true, true) => fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        (false, false) => fmt::layer()
            .with_ansi(config.ansi)
            .event_format(BracketedLevelFormat)
            .boxed(),
        (false, true) => fmt::layer()
            .with_ansi(config.ansi)
            .event_format(BracketedLevelFormat)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = if config.json {
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!("Logging: {} @ {}", service_name, directive);
    if let Some(dir) = &config.dir {
        tracing::info!("Log files: {}", dir.display());
    }
    Ok(guard)
}
