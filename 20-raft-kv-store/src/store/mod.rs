//! In-memory namespace store: the state machine Raft replicates.
//!
//! Every mutation enters through [`Store::apply`], which bumps the global
//! index exactly once per command, whether the command succeeds or is
//! rejected. A rejected command leaves the tree untouched. Reads never bump
//! the index and return snapshots, so callers never see later mutations
//! through a value they already hold.

mod event;
mod history;
mod node;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

pub use event::{Action, Event};
pub use history::EventHistory;
pub use node::{Node, NodeExtern, clean_path};

use crate::command::Command;
use crate::error::{Error, Result};
use node::NodeKind;

/// The store shared between the apply loop (sole writer) and readers.
pub type SharedStore = Arc<RwLock<Store>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    root: Node,
    index: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            root: Node::new_dir("/".to_string(), 0),
            index: 0,
        }
    }

    pub fn shared() -> SharedStore {
        Arc::new(RwLock::new(Self::new()))
    }

    /// The global index: number of commands applied so far.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Reads a node. The returned event is stamped with the current index.
    pub fn get(&self, path: &str, recursive: bool, sorted: bool) -> Result<Event> {
        let (key, segments) = clean_path(path)?;
        let node = self
            .root
            .lookup(&segments)
            .ok_or(Error::KeyNotFound(key))?;
        Ok(Event {
            action: Action::Get,
            node: node.to_extern(recursive, sorted),
            prev_node: None,
            index: self.index,
        })
    }

    /// Applies one committed command.
    ///
    /// The index is consumed even when the command is rejected; only
    /// `Internal` errors leave it in an undefined state, and those stop the
    /// apply loop.
    pub fn apply(&mut self, command: &Command) -> Result<Event> {
        self.index += 1;
        let index = self.index;
        match command {
            Command::Set {
                key,
                value,
                expiration,
            } => self.set(key, value, *expiration, index),
            Command::Delete { key, recursive } => self.delete(key, *recursive, index),
            Command::CompareAndSwap {
                key,
                value,
                prev_value,
                expiration,
            } => self.compare_and_swap(key, value, prev_value, *expiration, index),
            Command::Expire { key, expiration } => self.expire(key, *expiration, index),
        }
    }

    /// Consumes an index slot for a log entry that could not be decoded.
    pub fn reject(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn set(
        &mut self,
        path: &str,
        value: &str,
        expiration: Option<DateTime<Utc>>,
        index: u64,
    ) -> Result<Event> {
        let (key, segments) = clean_path(path)?;
        let Some((name, parents)) = segments.split_last() else {
            return Err(Error::NotAFile(key));
        };
        self.check_writable(parents)?;

        let parent = self.ensure_dir(parents, index)?;
        let NodeKind::Dir(children) = &mut parent.kind else {
            return Err(Error::Internal(format!("parent of {key} is not a directory")));
        };

        if let Some(existing) = children.get_mut(name) {
            if existing.is_dir() {
                return Err(Error::NotAFile(key));
            }
            let prev_node = existing.to_extern(false, true);
            existing.kind = NodeKind::Leaf(value.to_string());
            existing.modified_index = index;
            existing.expiration = expiration;
            return Ok(Event {
                action: Action::Set,
                node: existing.to_extern(false, true),
                prev_node: Some(prev_node),
                index,
            });
        }

        let node = Node::new_leaf(key, value.to_string(), index, expiration);
        let snapshot = node.to_extern(false, true);
        children.insert(name.clone(), node);
        Ok(Event {
            action: Action::Set,
            node: snapshot,
            prev_node: None,
            index,
        })
    }

    fn compare_and_swap(
        &mut self,
        path: &str,
        value: &str,
        prev_value: &str,
        expiration: Option<DateTime<Utc>>,
        index: u64,
    ) -> Result<Event> {
        let (key, segments) = clean_path(path)?;
        let node = self
            .root
            .lookup_mut(&segments)
            .ok_or_else(|| Error::KeyNotFound(key.clone()))?;
        let prev_node = node.to_extern(false, true);
        let NodeKind::Leaf(current) = &mut node.kind else {
            return Err(Error::NotAFile(key));
        };
        if current != prev_value {
            return Err(Error::CompareFailed {
                key,
                expected: prev_value.to_string(),
                actual: current.clone(),
            });
        }

        *current = value.to_string();
        node.modified_index = index;
        node.expiration = expiration;
        Ok(Event {
            action: Action::CompareAndSwap,
            node: node.to_extern(false, true),
            prev_node: Some(prev_node),
            index,
        })
    }

    fn delete(&mut self, path: &str, recursive: bool, index: u64) -> Result<Event> {
        let (key, segments) = clean_path(path)?;
        if segments.is_empty() {
            return Err(Error::InvalidPath(format!("{key} is read-only")));
        }
        let node = self
            .root
            .lookup(&segments)
            .ok_or_else(|| Error::KeyNotFound(key.clone()))?;
        if node.has_children() && !recursive {
            return Err(Error::DirectoryNotEmpty(key));
        }

        let removed = self.remove(&segments)?;
        Ok(Event {
            action: Action::Delete,
            node: removed.to_extern(true, true),
            prev_node: None,
            index,
        })
    }

    /// Removes a key whose TTL has elapsed.
    ///
    /// A no-op (`ExpirationSuperseded`) unless the key still carries exactly
    /// the expiration the scheduler saw when it proposed the removal.
    fn expire(&mut self, path: &str, expiration: DateTime<Utc>, index: u64) -> Result<Event> {
        let (key, segments) = clean_path(path)?;
        let current = self
            .root
            .lookup(&segments)
            .and_then(|node| node.expiration);
        if segments.is_empty() || current != Some(expiration) {
            return Err(Error::ExpirationSuperseded(key));
        }

        let removed = self.remove(&segments)?;
        Ok(Event {
            action: Action::Expire,
            node: removed.to_extern(true, true),
            prev_node: None,
            index,
        })
    }

    /// Fails with `NotAFile` if any existing ancestor is a leaf.
    fn check_writable(&self, parents: &[String]) -> Result<()> {
        let mut current = &self.root;
        let mut walked = String::new();
        for segment in parents {
            walked.push('/');
            walked.push_str(segment);
            match current.child(segment) {
                Some(child) if child.is_dir() => current = child,
                Some(_) => return Err(Error::NotAFile(walked)),
                None => return Ok(()),
            }
        }
        Ok(())
    }

    /// Walks to the directory at `parents`, creating missing ones.
    fn ensure_dir(&mut self, parents: &[String], index: u64) -> Result<&mut Node> {
        let mut current = &mut self.root;
        let mut walked = String::new();
        for segment in parents {
            walked.push('/');
            walked.push_str(segment);
            let next = match &mut current.kind {
                NodeKind::Dir(children) => children
                    .entry(segment.clone())
                    .or_insert_with(|| Node::new_dir(walked.clone(), index)),
                NodeKind::Leaf(_) => {
                    return Err(Error::Internal(format!("{walked} turned into a leaf")));
                }
            };
            current = next;
        }
        Ok(current)
    }

    fn remove(&mut self, segments: &[String]) -> Result<Node> {
        let Some((name, parents)) = segments.split_last() else {
            return Err(Error::Internal("attempted to remove the root".to_string()));
        };
        let removed = match self.root.lookup_mut(parents).map(|parent| &mut parent.kind) {
            Some(NodeKind::Dir(children)) => children.remove(name),
            _ => None,
        };
        removed.ok_or_else(|| Error::Internal(format!("{name} vanished during removal")))
    }
}
