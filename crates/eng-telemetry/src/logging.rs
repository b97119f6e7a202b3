use tracing_subscriber::{fmt, EnvFilter};

/// Initialize human-readable logging. Safe to call more than once; only the
/// first call takes effect.
pub fn init_logging(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Initialize JSON-structured logging, for machine-consumed log pipelines.
pub fn init_logging_json(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = fmt().json().with_env_filter(filter).try_init();
}
