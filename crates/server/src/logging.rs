use std::path::PathBuf;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const FILTER_ENV: &str = "MIRRORLINE_LOG_FILTER";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Write `server.log` here; stderr when unset.
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
}

pub struct LoggingHandle {
    pub guard: WorkerGuard,
}

fn active_filter() -> (EnvFilter, String) {
    if let Ok(value) = std::env::var(FILTER_ENV) {
        if let Ok(filter) = EnvFilter::try_new(&value) {
            return (filter, value);
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        let source = std::env::var("RUST_LOG").unwrap_or_default();
        return (filter, source);
    }
    (EnvFilter::new(DEFAULT_FILTER), DEFAULT_FILTER.to_string())
}

pub fn init_logging(config: &LogConfig) -> anyhow::Result<LoggingHandle> {
    let (filter, filter_source) = active_filter();

    let (writer, guard, destination) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, "server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, guard, dir.join("server.log").display().to_string())
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, guard, "stderr".to_string())
        }
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(config.dir.is_none())
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        destination = %destination,
        format = ?config.format,
        filter = %filter_source,
    );

    Ok(LoggingHandle { guard })
}
