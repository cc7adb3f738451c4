use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "flowrelay=info";

/// Installs the global fmt subscriber on stderr, leaving stdout to command
/// output and the terminal chat. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
