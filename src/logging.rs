//! Tracing subscriber setup.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber: console output, plus a daily rolling
/// file under `log_dir` when given. Keep the returned guard alive until
/// exit or buffered file lines are lost.
pub fn init(
    verbose: bool,
    log_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let level = if verbose { "streamstress=debug" } else { "streamstress=info" };
    let filter = EnvFilter::from_default_env().add_directive(level.parse()?);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "streamstress.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .try_init()?;

    Ok(guard)
}
