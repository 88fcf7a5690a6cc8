// Subscriber setup for the vigil binary

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init(level: &str, json: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
