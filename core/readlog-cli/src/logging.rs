//! Logging setup: stderr plus a daily rolling file under the logs directory.
//!
//! `READLOG_DEBUG_LOG=1` forces debug level; otherwise `RUST_LOG` applies,
//! defaulting to info.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "readlog.log";

fn debug_enabled() -> bool {
    env::var("READLOG_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn filter() -> EnvFilter {
    if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. The returned guard keeps the background
/// file writer alive and flushes it on drop; `None` means stderr only.
pub fn init(logs_dir: &Path) -> Option<WorkerGuard> {
    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

    if let Err(err) = fs_err::create_dir_all(logs_dir) {
        let _ = tracing_subscriber::registry()
            .with(filter())
            .with(stderr)
            .try_init();
        tracing::warn!(error = %err, "Log directory unavailable; logging to stderr only");
        return None;
    }

    let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = fmt::layer().with_writer(writer).with_ansi(false);
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(stderr)
        .with(file)
        .try_init();
    Some(guard)
}
