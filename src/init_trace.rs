use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const MODULE_LOG_FILTERS: &str = concat!(
    "ERROR,",
    "interdoc=INFO,",
    "handlebars=ERROR,",
    "pulldown_cmark=ERROR,",
    "ureq=ERROR,",
    "ureq_proto=ERROR",
);

/// Install the global tracing subscriber for the binary. `RUST_LOG`
/// overrides the default per-module filters.
pub fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_level(true)
        .with_ansi(true)
        .compact();

    let env_filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        Err(_) => EnvFilter::new(MODULE_LOG_FILTERS),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}
