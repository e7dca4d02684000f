//! Central-side romanaIP domain logic
//!
//! This library provides:
//! - The activation registry tracking which service owns which floating IP
//! - The push bridge to per-node agents
//! - The listener-side error taxonomy

pub mod bridge;
pub mod error;
pub mod registry;

pub use bridge::{AgentPush, HttpAgentBridge, AGENT_PORT};
pub use error::{CoreError, Result};
pub use registry::{ActivationRecord, ActivationRegistry};
