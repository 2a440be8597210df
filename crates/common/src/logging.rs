//! Logging setup and configuration

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Setup the tracing subscriber for the process
///
/// Honors `RUST_LOG` when set, falling back to `default_level`. Safe to
/// call more than once; later calls keep the first subscriber.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();

    Ok(())
}
