use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rangeguard_core::RangeGuardConfig;
use rangeguard_sandbox::{ContainerRuntime, DockerRuntime, FakeRuntime};
use rangeguard_server::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rangeguard=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match std::env::var("RANGEGUARD_CONFIG") {
        Ok(path) => {
            let path = PathBuf::from(path);
            info!(path = %path.display(), "loading configuration");
            RangeGuardConfig::load(&path).context("failed to load configuration")?
        }
        Err(_) => RangeGuardConfig::default(),
    };
    if let Ok(host) = std::env::var("RANGEGUARD_HOST") {
        config.server.host = host;
    }
    if let Ok(port) = std::env::var("RANGEGUARD_PORT") {
        config.server.port = port.parse().context("invalid RANGEGUARD_PORT")?;
    }

    let runtime: Arc<dyn ContainerRuntime> = match std::env::var("RANGEGUARD_RUNTIME").as_deref() {
        Ok("fake") => {
            warn!("in-memory runtime selected; commands will not reach real containers");
            FakeRuntime::new()
        }
        _ => Arc::new(
            DockerRuntime::new()
                .await
                .context("failed to connect to the container runtime")?,
        ),
    };

    let gateway = Gateway::new(config, runtime).context("failed to assemble gateway")?;
    gateway.start().await?;
    Ok(())
}
