//! Change events delivered by the key-value store watch

use serde::{Deserialize, Serialize};

/// Actions the store reports on a watched subtree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeAction {
    Create,
    Set,
    Update,
    CompareAndSwap,
    Delete,
    /// Any action this system does not dispatch on.
    #[serde(other)]
    Other,
}

impl Default for ChangeAction {
    fn default() -> Self {
        ChangeAction::Other
    }
}

impl From<&str> for ChangeAction {
    fn from(action: &str) -> Self {
        match action {
            "create" => ChangeAction::Create,
            "set" => ChangeAction::Set,
            "update" => ChangeAction::Update,
            "compareAndSwap" => ChangeAction::CompareAndSwap,
            "delete" => ChangeAction::Delete,
            _ => ChangeAction::Other,
        }
    }
}

/// One change observed on the watched subtree.
///
/// `value` carries the record for create/update style actions. Delete
/// events carry the record being removed in `previous_value` instead.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    #[serde(rename = "isDirectory", default)]
    pub is_directory: bool,
    #[serde(default)]
    pub value: String,
    #[serde(rename = "previousValue", default)]
    pub previous_value: String,
}

impl ChangeEvent {
    /// The effective record payload: `value` when present, otherwise the
    /// previous value. `None` when both are empty, which marks the event
    /// malformed.
    pub fn effective_value(&self) -> Option<&str> {
        if !self.value.is_empty() {
            Some(&self.value)
        } else if !self.previous_value.is_empty() {
            Some(&self.previous_value)
        } else {
            None
        }
    }
}
