//! Tracing subscriber setup for processes embedding the bootstrapper.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a formatted subscriber. `RUST_LOG` takes precedence over
/// `default_directive` (e.g. `"bootstrapper=info"`).
///
/// Returns an error if a global subscriber is already set.
pub fn init(default_directive: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
}
