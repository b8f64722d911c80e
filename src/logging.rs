//! Tracing setup: a stdout layer and a daily-rolling file layer sharing one
//! filter.

use anyhow::{Context, Result};
use home::home_dir;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, expand_path};

const LOG_FILE_PREFIX: &str = "chatwire.log";

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process or buffered file lines are lost.
pub fn init_logging(config: &Config) -> Result<WorkerGuard> {
    let log_dir = resolve_log_dir(config.log_dir.as_deref())?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory: {}", log_dir.display()))?;

    let env = std::env::var("RUST_LOG").ok();
    let directives = filter_directives(env.as_deref(), &config.log_level);
    // A bad level is a startup error.
    EnvFilter::try_new(directives).with_context(|| format!("invalid log filter: {directives}"))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(EnvFilter::new(directives));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_filter(EnvFilter::new(directives));

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    tracing::debug!(log_dir = %log_dir.display(), filter = directives, "Logging initialised");
    Ok(guard)
}

/// `RUST_LOG` wins over the configured level when it is set and non-empty.
fn filter_directives<'a>(env: Option<&'a str>, configured: &'a str) -> &'a str {
    env.map(str::trim)
        .filter(|directives| !directives.is_empty())
        .unwrap_or(configured)
}

fn resolve_log_dir(configured: Option<&str>) -> Result<PathBuf> {
    match configured.filter(|dir| !dir.is_empty()) {
        Some(dir) => Ok(expand_path(dir)),
        None => get_log_dir(),
    }
}

pub fn get_log_dir() -> Result<PathBuf> {
    let home = home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".local").join("state").join("chatwire").join("logs"))
}
