//! Logging setup.
//!
//! The code logs through the `log` macros; this module bridges them into
//! `tracing` and installs a console subscriber. `RUST_LOG` overrides the
//! default level.

use std::io;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `verbose` raises the default level from
/// info to debug.
pub fn init(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        fmt::layer()
            .with_writer(io::stdout)
            .with_target(true)
            .with_level(true),
    );

    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;

    Ok(())
}
