//! Node-local kernel network state for romanaIP binding
//!
//! This library provides:
//! - Default-link discovery and the node's address snapshot
//! - Idempotent reconciliation of change events into /32 host addresses
//! - The policy routing table and its selection rule

pub mod error;
pub mod link;
pub mod reconciler;
pub mod route_table;

pub use error::{NetError, Result};
pub use link::{DefaultLink, DefaultLinkResolver};
pub use reconciler::{AddressMutator, LinkAddressReconciler, NetlinkAddressMutator};
pub use route_table::PolicyRouteTableManager;
