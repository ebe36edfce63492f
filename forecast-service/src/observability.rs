use tracing_subscriber::{
    filter::{Directive, LevelFilter},
    EnvFilter,
};

const DEFAULT_DIRECTIVE: &str = "forecast_service=info";

/// Installs the global fmt subscriber. `RUST_LOG` directives are added on top
/// of the crate default.
pub fn init_tracing() {
    let directive: Directive = DEFAULT_DIRECTIVE
        .parse()
        .unwrap_or_else(|_| LevelFilter::INFO.into());

    let filter = EnvFilter::from_default_env().add_directive(directive);

    // A second init (tests, multiple binaries in one process) is not an error.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
