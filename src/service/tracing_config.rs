use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::service::ServerConfig;
use crate::{AppError, AppResult};

// RUST_LOG wins; without it the server is chatty enough at info
fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Wires tracing up from the logging section of the configuration: an empty
/// `log_dir` means stdout only, otherwise hourly-rolled files plus stdout.
/// The guard, when present, must stay alive for the file writer to flush.
pub fn init_tracing(config: &ServerConfig) -> AppResult<Option<WorkerGuard>> {
    if config.log_dir.is_empty() {
        setup_local_tracing()?;
        return Ok(None);
    }
    let log_file = if config.log_file.is_empty() {
        "tidenet.log"
    } else {
        config.log_file.as_str()
    };
    setup_file_tracing(&config.log_dir, log_file).map(Some)
}

/// Stdout-only subscriber, for tests and local runs.
pub fn setup_local_tracing() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_timer(ChronoLocal::new("%H:%M:%S%.3f".to_string()))
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| AppError::IllegalState(e.to_string()))?;
    Ok(())
}

/// Subscriber writing to rolled files and stdout through a non-blocking
/// appender.
pub fn setup_file_tracing(log_dir: &str, log_file: &str) -> AppResult<WorkerGuard> {
    let (file_writer, worker_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::hourly(log_dir, log_file));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(ChronoLocal::new("%Y-%m-%dT%H:%M:%S%.3f".to_string()))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(file_writer.and(std::io::stdout));

    tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt_layer)
        .try_init()
        .map_err(|e| AppError::IllegalState(e.to_string()))?;

    Ok(worker_guard)
}
