use std::env::var;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_forest::ForestLayer;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Compose the file, console and filter layers into the global `tracing`
/// subscriber.
///
/// It should only be called once! Keep the returned guard alive for as long
/// as logs must reach the file.
pub fn init_subscriber(
    name: &str,
    env_filter: &str,
) -> anyhow::Result<WorkerGuard> {
    // Env variable LOG_CONFIG_PATH points at the path where
    // LOG_CONFIG_FILENAME is located
    let log_config_path =
        var("LOG_CONFIG_PATH").unwrap_or_else(|_| "./".to_string());
    // Env variable LOG_CONFIG_FILENAME names the log file
    let log_config_filename = var("LOG_CONFIG_FILENAME")
        .unwrap_or_else(|_| format!("{}.log", name));

    let file_appender =
        tracing_appender::rolling::never(log_config_path, log_config_filename);
    let (non_blocking_file, guard) =
        tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(env_filter));

    LogTracer::init()?;
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::Layer::default().with_writer(non_blocking_file))
        .with(ForestLayer::default())
        .try_init()?;

    Ok(guard)
}
