use serde::{Deserialize, Serialize};

use super::node::NodeExtern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Get,
    Set,
    Delete,
    Expire,
    CompareAndSwap,
}

impl Action {
    /// Name used on the v1 wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Get => "get",
            Action::Set => "set",
            Action::Delete => "delete",
            Action::Expire => "expire",
            Action::CompareAndSwap => "testAndSet",
        }
    }
}

/// Immutable record of one applied mutation (or of one read).
///
/// For `Delete`/`Expire` the node is the removed subtree as it was just
/// before removal. `index` is the store index the mutation was applied at;
/// for reads it is the store index at the time of the read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub action: Action,
    pub node: NodeExtern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<NodeExtern>,
    pub index: u64,
}

impl Event {
    pub fn key(&self) -> &str {
        &self.node.key
    }

    /// True when a `Set` created the key rather than overwriting it.
    pub fn is_new_key(&self) -> bool {
        self.action == Action::Set && self.prev_node.is_none()
    }
}
