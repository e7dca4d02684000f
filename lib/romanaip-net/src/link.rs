//! Default-link discovery via the kernel route table

use crate::error::{NetError, Result};
use futures::TryStreamExt;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::RouteAttribute;
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::{Handle, RouteMessageBuilder};
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// The interface behind the route with neither a source nor a destination
/// constraint.
#[derive(Clone, Debug)]
pub struct DefaultLink {
    pub index: u32,
    pub name: String,
}

/// Inspects the node's route table to find the default link and enumerate
/// its bound addresses.
pub struct DefaultLinkResolver {
    handle: Handle,
}

impl DefaultLinkResolver {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Walks the IPv4 routes looking for one with neither a source nor a
    /// destination constraint: such a route handles all traffic not matched
    /// by a more specific one, so its interface is the default link.
    pub async fn resolve_default_link(&self) -> Result<DefaultLink> {
        let filter = RouteMessageBuilder::<Ipv4Addr>::new().build();
        let mut routes = self.handle.route().get(filter).execute();

        while let Some(route) = routes.try_next().await? {
            if route.header.destination_prefix_length != 0
                || route.header.source_prefix_length != 0
            {
                continue;
            }

            let mut interface = None;
            let mut constrained = false;
            for attr in &route.attributes {
                match attr {
                    RouteAttribute::Destination(_) | RouteAttribute::PrefSource(_) => {
                        constrained = true;
                    }
                    RouteAttribute::Oif(index) => interface = Some(*index),
                    _ => {}
                }
            }

            if constrained {
                continue;
            }
            if let Some(index) = interface {
                let link = self.link_by_index(index).await?;
                debug!("Resolved default link {} (index {})", link.name, link.index);
                return Ok(link);
            }
        }

        Err(NetError::NoDefaultRoute)
    }

    /// Returns all IPv4 addresses bound to `link`. An interface with zero
    /// addresses cannot be a default link for ownership matching, so an
    /// empty list is an error.
    pub async fn list_interface_addresses(&self, link: &DefaultLink) -> Result<Vec<Ipv4Addr>> {
        let mut request = self.handle.address().get();
        request = request.set_link_index_filter(link.index);
        let mut messages = request.execute();

        let mut addresses = Vec::new();
        while let Some(message) = messages.try_next().await? {
            if message.header.family != AddressFamily::Inet {
                continue;
            }
            for attr in &message.attributes {
                if let AddressAttribute::Address(IpAddr::V4(addr)) = attr {
                    addresses.push(*addr);
                }
            }
        }

        if addresses.is_empty() {
            return Err(NetError::NoAddressesBound(link.name.clone()));
        }
        Ok(addresses)
    }

    async fn link_by_index(&self, index: u32) -> Result<DefaultLink> {
        let mut links = self.handle.link().get().match_index(index).execute();
        let message = links
            .try_next()
            .await
            .map_err(|_| NetError::LinkNotFound(index))?
            .ok_or(NetError::LinkNotFound(index))?;

        let name = message
            .attributes
            .iter()
            .find_map(|attr| match attr {
                LinkAttribute::IfName(name) => Some(name.clone()),
                _ => None,
            })
            .unwrap_or_default();

        Ok(DefaultLink { index, name })
    }
}
