//! Namespace tree nodes and the read-only snapshots handed out to callers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Normalizes a user supplied key into an absolute path and its segments.
///
/// `foo//bar/` becomes `/foo/bar`. Relative segments (`.`, `..`) are
/// rejected instead of resolved so that two spellings never alias one key.
pub fn clean_path(raw: &str) -> Result<(String, Vec<String>)> {
    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" => continue,
            "." | ".." => return Err(Error::InvalidPath(raw.to_string())),
            other => segments.push(other.to_string()),
        }
    }
    let path = format!("/{}", segments.join("/"));
    Ok((path, segments))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Leaf(String),
    Dir(HashMap<String, Node>),
}

/// A namespace entry: either a leaf holding a value or a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub(crate) key: String,
    pub(crate) kind: NodeKind,
    pub(crate) created_index: u64,
    pub(crate) modified_index: u64,
    pub(crate) expiration: Option<DateTime<Utc>>,
}

impl Node {
    pub(crate) fn new_leaf(
        key: String,
        value: String,
        index: u64,
        expiration: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            key,
            kind: NodeKind::Leaf(value),
            created_index: index,
            modified_index: index,
            expiration,
        }
    }

    pub(crate) fn new_dir(key: String, index: u64) -> Self {
        Self {
            key,
            kind: NodeKind::Dir(HashMap::new()),
            created_index: index,
            modified_index: index,
            expiration: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir(_))
    }

    pub fn value(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Leaf(value) => Some(value),
            NodeKind::Dir(_) => None,
        }
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    pub(crate) fn has_children(&self) -> bool {
        matches!(&self.kind, NodeKind::Dir(children) if !children.is_empty())
    }

    pub(crate) fn child(&self, name: &str) -> Option<&Node> {
        match &self.kind {
            NodeKind::Dir(children) => children.get(name),
            NodeKind::Leaf(_) => None,
        }
    }

    pub(crate) fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        match &mut self.kind {
            NodeKind::Dir(children) => children.get_mut(name),
            NodeKind::Leaf(_) => None,
        }
    }

    pub(crate) fn lookup(&self, segments: &[String]) -> Option<&Node> {
        let mut current = self;
        for segment in segments {
            current = current.child(segment)?;
        }
        Some(current)
    }

    pub(crate) fn lookup_mut(&mut self, segments: &[String]) -> Option<&mut Node> {
        let mut current = self;
        for segment in segments {
            current = current.child_mut(segment)?;
        }
        Some(current)
    }

    /// Copies this node (and, for directories, its children) into a snapshot.
    ///
    /// Direct children of a directory are always listed; grandchildren only
    /// when `recursive` is set. Unsorted listings follow map order.
    pub fn to_extern(&self, recursive: bool, sorted: bool) -> NodeExtern {
        self.extern_at_depth(recursive, sorted, true)
    }

    fn extern_at_depth(&self, recursive: bool, sorted: bool, expand: bool) -> NodeExtern {
        let (value, dir, nodes) = match &self.kind {
            NodeKind::Leaf(value) => (Some(value.clone()), false, Vec::new()),
            NodeKind::Dir(children) if expand => {
                let mut nodes: Vec<NodeExtern> = children
                    .values()
                    .map(|child| child.extern_at_depth(recursive, sorted, recursive))
                    .collect();
                if sorted {
                    nodes.sort_by(|a, b| a.key.cmp(&b.key));
                }
                (None, true, nodes)
            }
            NodeKind::Dir(_) => (None, true, Vec::new()),
        };
        NodeExtern {
            key: self.key.clone(),
            value,
            dir,
            expiration: self.expiration,
            nodes,
            created_index: self.created_index,
            modified_index: self.modified_index,
        }
    }
}

/// Immutable copy of a node handed out by reads and carried by events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExtern {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeExtern>,
    pub created_index: u64,
    pub modified_index: u64,
}

impl NodeExtern {
    /// Whole seconds left before expiration, rounded up, as seen at `now`.
    pub fn ttl(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expiration.map(|expiration| {
            let remaining_ms = (expiration - now).num_milliseconds().max(0);
            (remaining_ms + 999) / 1000
        })
    }
}
