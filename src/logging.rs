// src/logging.rs
use anyhow::Result;
use tracing_subscriber::EnvFilter;

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Logs compactos a stderr; `RUST_LOG` cambia el nivel.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_env_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!("no se pudo iniciar el logger: {err}"))
}
