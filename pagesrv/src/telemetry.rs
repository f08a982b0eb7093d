use metrics_exporter_statsd::StatsdBuilder;
use pages::config::{MetricsConfig, OutputConfig, OutputFormat};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the tracing subscriber. `RUST_LOG` wins over the configured
/// default; `output.debug` bumps the default filter to debug, and
/// `output.format` switches between compact and full event formatting.
pub fn init_tracing(output: &OutputConfig) {
    let default_filter = if output.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    match output.format {
        OutputFormat::Short => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().compact())
            .with(filter)
            .init(),
        OutputFormat::Long => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .init(),
    }
}

/// Installs the statsd metrics recorder when an endpoint is configured;
/// without one, metrics are recorded into the void.
pub fn init_statsd_recorder(prefix: &str, metrics_config: Option<&MetricsConfig>) {
    if let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        let recorder = StatsdBuilder::from(statsd_host.clone(), *statsd_port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder")
    }
}
