//! Tracing subscriber setup for processes embedding Strata.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default directives used when `RUST_LOG` is not set.
pub const DEFAULT_DIRECTIVES: &str = "info,strata=debug";

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directives`.
///
/// Returns `false` if a global subscriber was already installed, in which
/// case nothing changes.
pub fn init_logging(default_directives: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
