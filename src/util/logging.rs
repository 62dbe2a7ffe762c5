use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes tracing. `RUST_LOG` wins over the configured level; `json`
/// switches to one structured record per line.
pub fn init_tracing(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let builder = fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false);

    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
