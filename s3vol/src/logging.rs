//! Tracing subscriber setup.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber writing to stderr.
///
/// The filter comes from `RUST_LOG` (default `info`); `debug` forces the
/// debug level.
pub fn init(debug: bool, json: bool) -> Result<()> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.with_target(debug).try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
