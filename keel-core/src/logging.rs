//! Deferred logger construction.
//!
//! The subscriber is installed by `App::build` only after flags, config
//! files, and environment variables have been merged, so `--log-level` and
//! `log.format` take effect. `try_init` keeps embedding safe: in tests, or
//! when the host application already installed a subscriber, init is a no-op.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ProviderValues;

pub(crate) fn init(values: &ProviderValues) {
    let level = values.get_or("log.level", "info".to_string());
    let format = values.get_or("log.format", "pretty".to_string());

    // RUST_LOG, when present, wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
            .is_ok(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::debug!(format = %format, "logger initialized");
    }
}
