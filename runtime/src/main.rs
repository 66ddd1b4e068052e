//! Entry point for the agent fabric runtime.

use fabric_runtime::{AgentRuntime, RuntimeConfig};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("FABRIC_CONFIG").ok().map(PathBuf::from);
    let config = match RuntimeConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    let emergency_bind = config.emergency_bind.clone();

    let runtime = match AgentRuntime::new(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to construct runtime: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.boot().await {
        error!("Boot failed: {:#}", e);
        std::process::exit(1);
    }

    // The emergency surface runs for the whole life of the process; the
    // signature is the only authentication it needs.
    let router = runtime.emergency_router();
    match tokio::net::TcpListener::bind(&emergency_bind).await {
        Ok(listener) => {
            info!("Emergency endpoint listening on {}", emergency_bind);
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router).await {
                    error!("Emergency endpoint failed: {}", e);
                }
            });
        }
        Err(e) => error!("Could not bind emergency endpoint on {}: {}", emergency_bind, e),
    }

    let exit_code = runtime.run().await;
    info!("Runtime exited with code {}", exit_code);
    std::process::exit(exit_code);
}
