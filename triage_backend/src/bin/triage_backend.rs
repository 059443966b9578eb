use anyhow::{Context, Result};
use triage_backend::config::TriageConfig;
use triage_backend::runtime::BackendRuntime;
use triage_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,triage_backend=debug")),
        )
        .init();

    let config = TriageConfig::load();
    let runtime = BackendRuntime::bootstrap(config).context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting triage backend (set TRIAGE_BACKEND_TOKEN + optional TRIAGE_BACKEND_BIND; auth mode via TRIAGE_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime))
}
