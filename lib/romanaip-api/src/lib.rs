//! Wire types shared by the romanaIP listener and the per-node agents
//!
//! This library provides:
//! - The floating-IP record and its store wire form
//! - Change events delivered by the key-value store watch

pub mod event;
pub mod spec;

pub use event::{ChangeAction, ChangeEvent};
pub use spec::{ExposedIpSpec, RomanaIp};
