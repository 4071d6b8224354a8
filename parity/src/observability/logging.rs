use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter(level: &str) -> EnvFilter {
    // RUST_LOG overrides level
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn stderr_style<W>(level: &str, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::registry().with(env_filter(level)).with(
        fmt::layer()
            .with_writer(writer)
            .with_target(false)
            .with_line_number(false),
    )
}

/// Stderr subscriber for scoped use with `tracing::subscriber::with_default`
/// while the configuration that picks the real logging setup is loaded
pub fn bootstrap_subscriber(level: &str) -> impl Subscriber + Send + Sync + 'static {
    stderr_style(level, std::io::stderr)
}

/// Initialize logging with file rotation
///
/// - Daily rotating log files `parity.log.<date>` in `log_dir`
/// - Stderr with compact formatting; stdout stays free for results
pub fn init_file_logging(level: &str, log_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "parity.log");

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false) // No colors in log files
                .with_target(true)
                .with_line_number(true),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_line_number(false),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %level,
        "File logging initialized"
    );

    Ok(())
}

/// Initialize stderr-only logging for the CLI
pub fn init_simple_logging(level: &str) -> anyhow::Result<()> {
    stderr_style(level, std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
