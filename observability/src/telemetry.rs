use crate::conf::{ExecutionEnvironment, TelemetryConfig, ENVIRONMENT};
use crate::metrics::METRICS;
use anyhow::Context;
use tracing::info;
use tracing_appender::non_blocking;
use tracing_appender::rolling::never;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

/// Builds the filter used by the subscriber.
///
/// `RUST_LOG` always wins. Otherwise the configured level is used, and
/// for local and integration runs the noisy HTTP stack is capped.
pub fn env_filter(settings: &TelemetryConfig) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let filter = EnvFilter::try_new(settings.log_level())
        .with_context(|| format!("invalid log level directive {}", settings.log_level()))?;
    let filter = match *ENVIRONMENT {
        ExecutionEnvironment::Integration | ExecutionEnvironment::Local => filter
            .add_directive("hyper=warn".parse()?)
            .add_directive("reqwest=info".parse()?)
            .add_directive("h2=info".parse()?),
        _ => filter,
    };
    Ok(filter)
}

/// Initializes the global tracing subscriber.
///
/// Fails if a global subscriber was already installed.
pub fn init_tracing(settings: &TelemetryConfig) -> anyhow::Result<()> {
    let filter = env_filter(settings)?;

    let console_layer = if settings.json_logs() {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .boxed()
    } else {
        fmt_layer().boxed()
    };

    let file_layer = match settings.log_file() {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create log directory {}", parent.display())
                    })?;
                }
            }
            let file_appender = never("", path);
            let (non_blocking, guard) = non_blocking(file_appender);
            // The guard flushes on drop, so it lives as long as the metrics
            METRICS.set_trace_guard(Box::new(guard));
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(false)
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing")?;

    info!(
        "Tracing initialized for service {} in {} environment",
        settings.tracing_service_name().unwrap_or("unknown-service"),
        *ENVIRONMENT
    );
    Ok(())
}

fn fmt_layer<S>() -> tracing_subscriber::fmt::Layer<S> {
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn bad_log_level_is_reported() {
        std::env::remove_var("RUST_LOG");
        let conf = TelemetryConfig::builder().log_level("fhevm_session=loud").build();
        assert!(env_filter(&conf).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn init_twice_fails_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let conf = TelemetryConfig::builder()
            .tracing_service_name("telemetry_test")
            .log_file(dir.path().join("logs").join("session.log"))
            .build();
        let first = init_tracing(&conf);
        let second = init_tracing(&conf);
        // another test binary may already own the global subscriber
        assert!(first.is_err() || second.is_err());
        assert!(dir.path().join("logs").exists());
    }
}
