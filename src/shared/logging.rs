use std::path::Path;

use tracing::{info, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the non-blocking writers flushing until the controller exits.
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Install file + console logging for the controller. Falls back to console
/// output only when `log_dir` is not writable.
pub fn init_service_logging(log_dir: &str, service_name: &str) -> anyhow::Result<LoggingGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    if !log_dir_writable(log_dir) {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer(stdout_writer))
            .try_init()?;

        info!("Logging initialized - console output only (cannot write to {log_dir})");
        return Ok(LoggingGuard {
            _guards: vec![stdout_guard],
        });
    }

    let _ = rotate_logs_on_startup(log_dir, service_name);

    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{service_name}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer(stdout_writer))
        .try_init()?;

    info!("Logging initialized - logs will be written to {log_dir}/{service_name}.log");
    Ok(LoggingGuard {
        _guards: vec![file_guard, stdout_guard],
    })
}

/// The layer type depends on the subscriber stack below it, so each stack
/// gets its own instance.
fn console_layer<S>(writer: NonBlocking) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false)
}

fn log_dir_writable(log_dir: &str) -> bool {
    let marker = format!("{log_dir}/.write_test");
    std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(&marker))
        .map(|_| std::fs::remove_file(&marker))
        .is_ok()
}

pub fn rotate_logs_on_startup(log_dir: &str, service_name: &str) -> anyhow::Result<()> {
    let log_file = format!("{log_dir}/{service_name}.log");
    if Path::new(&log_file).exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_file = format!("{log_dir}/{service_name}.{timestamp}.log");
        std::fs::rename(&log_file, &backup_file)?;
        info!("Previous log file backed up to: {backup_file}");
    }
    Ok(())
}
