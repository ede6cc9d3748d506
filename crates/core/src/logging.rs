//! Logging initialization.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info,lumen=debug,lumen_renderer=debug,lumen_rhi=debug";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the built-in filter. Thread ids are
/// printed because the draw compiler logs from its own worker thread.
///
/// # Example
/// ```no_run
/// lumen_core::init_logging();
/// tracing::info!("renderer starting");
/// ```
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // try_init so tests and embedders that already installed a subscriber keep theirs
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}
