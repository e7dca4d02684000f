use anyhow::Result;
use romanaip_core::AGENT_PORT;
use romanaip_net::{
    DefaultLinkResolver, LinkAddressReconciler, NetlinkAddressMutator, PolicyRouteTableManager,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::init as tracing_init;

mod http;
mod store;
mod watcher;

use store::EtcdStore;

const ROUTE_TABLE_ID: u32 = 10;
const ROUTE_TABLE_NAME: &str = "romana";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting romanaip-agent...");

    let (connection, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(connection);

    // Discovery failures are fatal: the watcher never starts without a
    // resolved default link and its address snapshot.
    let resolver = DefaultLinkResolver::new(handle.clone());
    let link = resolver.resolve_default_link().await?;
    let local_addresses = resolver.list_interface_addresses(&link).await?;
    info!(
        "Default link {} holds {} IPv4 address(es)",
        link.name,
        local_addresses.len()
    );

    let tables = PolicyRouteTableManager::new(handle.clone());
    tables.ensure_route_table_registered(ROUTE_TABLE_ID, ROUTE_TABLE_NAME)?;
    tables.ensure_selection_rule(ROUTE_TABLE_ID).await?;
    // Stale routes from a previous run are not trusted; start clean.
    tables.flush_table(ROUTE_TABLE_NAME).await?;

    let node_address = local_addresses[0];
    let mutator = Arc::new(NetlinkAddressMutator::new(handle));
    let reconciler = Arc::new(LinkAddressReconciler::new(mutator, link, local_addresses));

    let store = EtcdStore::from_env();
    // A failed initial subscription is fatal too; only the steady-state
    // long-poll retries.
    let events = store.watch_tree().await?;

    tokio::select! {
        _ = watcher::run(events, reconciler) => {
            warn!("romanaIP change stream ended");
        }
        result = http::serve(store.clone(), node_address, AGENT_PORT) => {
            if let Err(err) = result {
                error!("Agent HTTP surface error: {}", err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting...");
        }
    }

    Ok(())
}
