//! Logging setup.
//!
//! Warnings and above always go to stderr so a CLI run shows its problems.
//! The full log goes to systemd-journald on Linux when it is reachable,
//! otherwise to a daily-rolling file.
//!
//! Log level is controlled via the `PHOTOMETA_LOG` environment variable
//! (`debug`, `info` (default), `warn`, `error`, or any `EnvFilter` directive).

use anyhow::Result;
use std::path::PathBuf;
use tracing::Subscriber;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::try_from_env("PHOTOMETA_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(journald_layer.with_filter(env_filter))
                .with(stderr_layer())
                .init();

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photometa")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "photometa.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The worker flushes until the guard drops; keep it for the process lifetime.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter),
        )
        .with(stderr_layer())
        .init();

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}

/// Compact WARN-and-above output for the terminal, built per subscriber stack.
fn stderr_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(LevelFilter::WARN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_stderr_layer_stacks_on_either_backend() {
        let dir = tempdir().unwrap();
        let (writer, _guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir.path(), "test.log"));

        let file_stack = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(EnvFilter::new("info")),
            )
            .with(stderr_layer());
        tracing::subscriber::with_default(file_stack, || tracing::info!("file stack"));

        let filtered_stack = tracing_subscriber::registry()
            .with(EnvFilter::new("debug"))
            .with(stderr_layer());
        tracing::subscriber::with_default(filtered_stack, || tracing::debug!("filtered stack"));
    }
}
