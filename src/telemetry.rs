use tracing_subscriber::{fmt, EnvFilter};

/// key: telemetry-init -> JSON structured logs filtered by `RUST_LOG`
///
/// Falls back to `info` when `RUST_LOG` is unset. Safe to call more than once; later
/// calls keep the subscriber installed first.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if fmt().with_env_filter(filter).json().try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
