//! Tracing subscriber setup: human-readable stderr plus optional JSON files.

use crate::config::LoggingConfig;
use crate::error::Result;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber described by `config`.
///
/// Returns the file appender guard when JSON logging is enabled; keep it alive
/// for the duration of the run or buffered lines are lost. If a subscriber is
/// already installed it stays in place and no guard is returned.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(&config.level));

    let (json_layer, guard) = match &config.json_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "trellis.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
    {
        warn!(error = %e, "Subscriber already installed; JSON file logging not enabled");
        return Ok(None);
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_with_json_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            level: "warn".into(),
            json_dir: Some(dir.path().join("logs")),
        };
        let guard = init_logging(&config).unwrap();
        assert!(guard.is_some());
        assert!(dir.path().join("logs").is_dir());

        // The first subscriber stays; a later JSON dir gets no guard.
        let second = LoggingConfig {
            level: "warn".into(),
            json_dir: Some(dir.path().join("other")),
        };
        assert!(init_logging(&second).unwrap().is_none());
        assert!(init_logging(&LoggingConfig::default()).unwrap().is_none());
    }
}
