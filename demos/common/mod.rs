mod add_types;

pub use add_types::{AddRequest, AddResponse, ADD_METHOD};

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`).
pub fn init_tracing() {
    // ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
