use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn,reqwest=warn";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var("ROSERAM_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Keeps the non-blocking file writer alive; drop it last.
pub struct LoggingHandle {
    pub guard: Option<WorkerGuard>,
}

fn build_filter(verbose: bool) -> EnvFilter {
    std::env::var("ROSERAM_LOG")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| {
            if verbose {
                EnvFilter::new("debug,tower_http=info,hyper=warn,reqwest=warn")
            } else {
                EnvFilter::new(DEFAULT_FILTER)
            }
        })
}

/// Install the global subscriber. Logs go to stderr, or to
/// `<log_dir>/roseram.log` when a directory is given.
pub fn init_logging(verbose: bool, log_dir: Option<&Path>) -> anyhow::Result<LoggingHandle> {
    let filter = build_filter(verbose);
    let format = LogFormat::from_env();
    let registry = tracing_subscriber::registry().with(filter);

    let Some(log_dir) = log_dir else {
        match format {
            LogFormat::Json => registry
                .with(fmt::layer().json().flatten_event(true).with_writer(std::io::stderr))
                .try_init()?,
            LogFormat::Pretty => registry
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .try_init()?,
        }
        return Ok(LoggingHandle { guard: None });
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "roseram.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true),
            )
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        log_dir = %log_dir.display(),
        format = ?format,
        "logging initialized"
    );

    Ok(LoggingHandle { guard: Some(guard) })
}

/// Default log directory: `~/.roseram/logs`.
pub fn default_log_dir() -> Option<std::path::PathBuf> {
    dirs::home_dir().map(|home| home.join(".roseram").join("logs"))
}
