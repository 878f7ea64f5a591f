//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with the default configuration; the log level is
/// taken from the `ROOTSHIFT_LOG` environment variable and defaults to
/// printing warnings and errors to stderr.
pub fn initialize_tracing() {
    let format = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(format)
        .with(
            EnvFilter::try_from_env("ROOTSHIFT_LOG")
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
}
