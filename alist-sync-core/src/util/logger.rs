//! Logging configuration using tracing. Grounded on
//! `backup-agent/src/utils/logger.rs`; extended with optional
//! rolling-file output per [`crate::config::LogConfig`].

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Returned so the caller can keep the non-blocking writer's guard alive
/// for the process lifetime; dropping it stops flushing to the log file.
pub struct LoggerGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

/// Initializes the global tracing subscriber. `level` is the fallback
/// filter used when neither `RUST_LOG` nor `logs.filter` is set.
pub fn init(level: &str, logs: Option<&LogConfig>) -> anyhow::Result<LoggerGuard> {
    let directive = logs.and_then(|l| l.filter.clone()).unwrap_or_else(|| level.to_string());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match logs.and_then(|l| l.file.as_ref()) {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "alist-sync.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            Ok(LoggerGuard(Some(guard)))
        }
        None => {
            registry.init();
            Ok(LoggerGuard(None))
        }
    }
}
