//! Floating-IP records and their store wire form

use serde::{Deserialize, Serialize};

/// An externally routable floating IP and whether it was auto-assigned
/// from a pool rather than supplied explicitly.
///
/// A record is immutable once read from an event; a new event produces a
/// new record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RomanaIp {
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub ip: String,
}

/// The store's wire form: binds a floating IP to the IP address of its
/// owning node.
///
/// `node_ip_address` is a literal address, not a node identifier. Agents
/// decide whether a record applies to them by testing it for membership in
/// their own default link's address set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedIpSpec {
    #[serde(rename = "romanaIP", default)]
    pub romana_ip: RomanaIp,
    #[serde(rename = "nodeIPAddress", default)]
    pub node_ip_address: String,
}
