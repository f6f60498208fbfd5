//! Configures a tracing subscriber for the node agent.

use serde::{Deserialize, Serialize};
use tracing_log::LogTracer;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// Errors from initializing the trace subscriber.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tracing error: {0}")]
    SetGlobalTracingSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("logging error: {0}")]
    SetGlobalLogger(#[from] tracing_log::log_tracer::SetLoggerError),
}

/// Configuration for the tracing subscriber.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfiguration {
    /// If true, uses a [`tracing_subscriber::fmt::TestWriter`] to capture
    /// trace events when running tests.
    #[serde(default)]
    pub use_test_writer: bool,
    /// If true, trace events are output as JSON, one event per line; the
    /// node's log forwarder ships them off-box.
    #[serde(default)]
    pub force_json_output: bool,
}

/// Installs the process-wide tracing subscriber. Returns an error if a
/// subscriber was already set.
pub fn install_trace_subscriber(config: &TraceConfiguration) -> Result<(), Error> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_level(true)
        .with_target(true);
    let layer: Box<dyn Layer<_> + Send + Sync> = if config.force_json_output {
        layer.json().with_current_span(false).boxed()
    } else if config.use_test_writer {
        layer.with_test_writer().boxed()
    } else {
        layer.boxed()
    };

    let subscriber = Registry::default().with(filter).with(layer);
    tracing::subscriber::set_global_default(subscriber)?;

    // Un-bridged `log` events from dependencies flow into tracing.
    LogTracer::init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::TraceConfiguration;

    #[test]
    fn roundtrip_trace_configuration() {
        let config = TraceConfiguration {
            use_test_writer: false,
            force_json_output: true,
        };
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: TraceConfiguration = serde_json::from_str(&encoded).unwrap();
        assert_eq!(config, decoded);
    }
}
