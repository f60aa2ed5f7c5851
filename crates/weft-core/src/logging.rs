use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over `config.filter`. Returns `false` when a subscriber was
/// already installed.
pub fn init_tracing(config: &LogConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter)),
        )
        .with_target(config.with_target)
        .try_init()
        .is_ok()
}
