//! Logging setup

use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use types::{Error, Result};

/// Install a tracing subscriber for the process.
///
/// The `RUST_LOG` environment variable takes precedence over
/// `default_directives`.
pub fn init_logging(default_directives: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives))
        .map_err(|e| Error::Config(format!("invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install subscriber: {}", e)))?;

    Ok(())
}
