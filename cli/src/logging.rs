use tracing_forest::{ForestLayer, printer::PrettyPrinter};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Diagnostics go to stderr, stdout only carries the success message.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::default());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(ForestLayer::from(
            PrettyPrinter::new().writer(std::io::stderr),
        ))
        .init();
}
