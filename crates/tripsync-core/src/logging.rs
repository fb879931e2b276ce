//! Tracing subscriber setup for applications embedding the core

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_DIRECTIVE: &str = "tripsync=info";

/// Install a formatting subscriber filtered by `RUST_LOG`, or `default_directive`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
