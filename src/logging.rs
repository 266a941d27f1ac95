//! Tracing setup: stderr always, plus a daily rolling file when a log
//! directory is configured.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_FILE_PREFIX: &str = "proposal-pilot.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; hold it for the life
/// of the process.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let mut guard = None;
    let file_layer = match log_dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                let (writer, file_guard) = tracing_appender::non_blocking(appender);
                guard = Some(file_guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(env_filter()),
                )
            }
            Err(err) => {
                eprintln!("Warning: failed to create log directory {}: {}", dir.display(), err);
                None
            }
        },
        None => None,
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter());

    if let Err(err) = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
    {
        eprintln!("Warning: tracing already initialised: {}", err);
    }

    guard
}
