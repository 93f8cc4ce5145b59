//! Helpers related to tracing, used by main entrypoints

use camino::Utf8Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

/// Initialize tracing with the default configuration: a compact format on
/// stderr, honoring `RUST_LOG`.
///
/// When `log_dir` is provided, additionally write a daily-rolling log file
/// there; the host agent collects these files. The returned guard must be
/// held for the lifetime of the process; dropping it loses buffered output.
pub fn initialize_tracing(log_dir: Option<&Utf8Path>) -> Option<WorkerGuard> {
    // Don't include timestamps and such on stderr because they're not really
    // useful and too verbose; the log file keeps them since it is read
    // long after the fact.
    let stderr_format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .event_format(stderr_format)
        .with_writer(std::io::stderr);
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "guestpatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}
