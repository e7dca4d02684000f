use anyhow::Result;
use kube::Client;
use romanaip_core::{ActivationRegistry, HttpAgentBridge};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::fmt::init as tracing_init;

mod service_watcher;

use service_watcher::{KubeTopology, ServiceEventWatcher};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting romanaip-listener...");

    let client = Client::try_default().await?;
    let registry = Arc::new(Mutex::new(ActivationRegistry::new()));
    let topology = Arc::new(KubeTopology::new(client.clone()));
    let bridge = Arc::new(HttpAgentBridge::new());

    let watcher = ServiceEventWatcher::new(registry, topology, bridge);

    tokio::select! {
        result = watcher.run(client) => {
            if let Err(err) = result {
                error!("Service event watcher error: {}", err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting...");
        }
    }

    Ok(())
}
