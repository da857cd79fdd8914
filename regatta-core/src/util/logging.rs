use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Initialize global tracing with an env-filter and a fmt layer.
/// Safe to call once per process; embedders with their own subscriber
/// simply skip this.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
