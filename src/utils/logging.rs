//! Logging initialization

use crate::config::LoggingConfig;
use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file name prefix; the appender adds the date
pub const LOG_FILE_PREFIX: &str = "heatlink.log";

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level. The returned guard flushes the
/// log file when dropped and must live as long as the program.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log filter '{}'", config.level))?;

    let plain = (!config.json).then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));
    let json = config.json.then(|| fmt::layer().json().with_writer(std::io::stderr));

    let (file, guard) = if config.file {
        let dir = config
            .directory
            .clone()
            .or_else(crate::config::log_dir)
            .context("could not determine log directory")?;
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX));
        (Some(fmt::layer().json().with_ansi(false).with_writer(writer)), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .with(file)
        .try_init()
        .context("logging already initialized")?;

    Ok(guard)
}
