//! Activation registry: which service owns which floating IP, and where

use romanaip_api::RomanaIp;
use std::collections::HashMap;

/// A floating IP resolved to its owning node and pushed for binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationRecord {
    pub romana_ip: RomanaIp,
    pub node_ip_address: String,
    pub activated: bool,
}

/// Map from service identity to activation record; the single source of
/// truth for "is this floating IP currently bound, and where."
///
/// At most one record exists per identity; an identity with no record is
/// unbound. The registry itself holds no lock: the owner wraps it in a
/// single mutex and holds the guard for each full read-modify-write,
/// including the outbound agent push.
#[derive(Debug, Default)]
pub struct ActivationRegistry {
    records: HashMap<String, ActivationRecord>,
}

impl ActivationRegistry {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Whether `service` already has an activation. Repeated add events for
    /// an activated service are ignored rather than refreshed.
    pub fn contains(&self, service: &str) -> bool {
        self.records.contains_key(service)
    }

    pub fn get(&self, service: &str) -> Option<&ActivationRecord> {
        self.records.get(service)
    }

    pub fn insert(&mut self, service: String, record: ActivationRecord) {
        self.records.insert(service, record);
    }

    /// Removes and returns the activation for `service`, if any.
    pub fn remove(&mut self, service: &str) -> Option<ActivationRecord> {
        self.records.remove(service)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
