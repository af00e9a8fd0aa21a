use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialize stdout logging for embedding processes.
///
/// Filtering is configured via `RUST_LOG` (default: `info`). Safe to call
/// more than once; later calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(false).with_level(true);

    let _ = Registry::default().with(filter).with(fmt_layer).try_init();
}
