//! Reconciliation of store change events into /32 host addresses

use crate::error::{NetError, Result};
use crate::link::DefaultLink;
use async_trait::async_trait;
use futures::TryStreamExt;
use romanaip_api::{ChangeEvent, ExposedIpSpec};
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::Handle;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::debug;

const EEXIST: i32 = 17;
const EADDRNOTAVAIL: i32 = 99;

/// The kernel-facing primitive: add or remove a /32 host address on a link.
///
/// Both implementations and callers must tolerate repeat invocations; the
/// store-watch path and any push-based path converge on this primitive
/// without coordinating with each other.
#[async_trait]
pub trait AddressMutator: Send + Sync {
    async fn add_address(&self, link: &DefaultLink, address: Ipv4Addr) -> Result<()>;
    async fn remove_address(&self, link: &DefaultLink, address: Ipv4Addr) -> Result<()>;
}

/// Netlink-backed mutator. Adding an address that is already present and
/// removing one that is already absent both succeed.
pub struct NetlinkAddressMutator {
    handle: Handle,
}

impl NetlinkAddressMutator {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl AddressMutator for NetlinkAddressMutator {
    async fn add_address(&self, link: &DefaultLink, address: Ipv4Addr) -> Result<()> {
        match self
            .handle
            .address()
            .add(link.index, IpAddr::V4(address), 32)
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(err)) if err.raw_code() == -EEXIST => {
                debug!("Address {}/32 already bound to {}", address, link.name);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_address(&self, link: &DefaultLink, address: Ipv4Addr) -> Result<()> {
        let mut messages = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link.index)
            .execute();

        let mut target = None;
        while let Some(message) = messages.try_next().await? {
            if message.header.prefix_len != 32 {
                continue;
            }
            let matched = message.attributes.iter().any(
                |attr| matches!(attr, AddressAttribute::Address(IpAddr::V4(a)) if *a == address),
            );
            if matched {
                target = Some(message);
                break;
            }
        }
        drop(messages);

        let Some(message) = target else {
            debug!("Address {}/32 not bound to {}, nothing to remove", address, link.name);
            return Ok(());
        };

        match self.handle.address().del(message).execute().await {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(err))
                if err.raw_code() == -EADDRNOTAVAIL =>
            {
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Applies a floating-IP change event to the node's default link,
/// idempotently and only when this node owns the record.
///
/// The local address set is a point-in-time snapshot taken at startup; an
/// address change on the default link requires an agent restart to pick up.
pub struct LinkAddressReconciler {
    mutator: Arc<dyn AddressMutator>,
    link: DefaultLink,
    local_addresses: Vec<Ipv4Addr>,
}

impl LinkAddressReconciler {
    pub fn new(
        mutator: Arc<dyn AddressMutator>,
        link: DefaultLink,
        local_addresses: Vec<Ipv4Addr>,
    ) -> Self {
        Self {
            mutator,
            link,
            local_addresses,
        }
    }

    /// Decodes the event's effective record and converges the link: add the
    /// /32 when `want_present`, remove it otherwise. A record owned by
    /// another node is skipped with success; both event paths may call this
    /// without coordination because each node consumes its stream serially.
    pub async fn apply_record(&self, event: &ChangeEvent, want_present: bool) -> Result<()> {
        let payload = event.effective_value().ok_or_else(|| {
            NetError::MalformedRecord(
                "event carries neither a value nor a previous value".to_string(),
            )
        })?;

        let spec: ExposedIpSpec = serde_json::from_str(payload)
            .map_err(|err| NetError::MalformedRecord(err.to_string()))?;

        if spec.node_ip_address.is_empty() {
            return Err(NetError::IncompleteRecord("nodeIPAddress"));
        }
        if spec.romana_ip.ip.is_empty() {
            return Err(NetError::IncompleteRecord("romanaIP.ip"));
        }

        let owned = self
            .local_addresses
            .iter()
            .any(|addr| addr.to_string() == spec.node_ip_address);
        if !owned {
            debug!(
                "romanaIP {} belongs to node {}, not this node, skipping",
                spec.romana_ip.ip, spec.node_ip_address
            );
            return Ok(());
        }

        let address: Ipv4Addr = spec
            .romana_ip
            .ip
            .parse()
            .map_err(|_| NetError::AddressParse(spec.romana_ip.ip.clone()))?;

        if want_present {
            self.mutator.add_address(&self.link, address).await
        } else {
            self.mutator.remove_address(&self.link, address).await
        }
    }
}
