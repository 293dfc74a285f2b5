//! Raft-replicated hierarchical key-value store.
//!
//! Clients write through a [`gateway::Gateway`], which proposes a
//! [`command::Command`] to the Raft log. Every replica applies committed
//! commands one at a time, in log order, to its in-memory [`store::Store`],
//! so all replicas walk through the same sequence of states and events.
//! Keys may carry a TTL; the leader's expiration scheduler turns elapsed
//! TTLs into replicated `Expire` commands.
//!
//! # Architecture
//!
//! Each node is a set of tokio tasks joined by channels:
//!
//! - **Raft worker**: owns the raft state machine, handles proposals, peer
//!   messages and ticks
//! - **Apply loop**: the only writer of the store; bumps the global index once
//!   per committed command
//! - **Expiration scheduler**: sleeps until the next TTL deadline
//! - **Network**: one listener plus one sender per peer, length-prefixed
//!   protobuf frames over TCP
//! - **HTTP**: the etcd v1 style key API in [`v1`]
//!
//! # Modules
//!
//! - [`store`]: namespace tree, events and event history
//! - [`command`]: mutations replicated through the Raft log
//! - [`applier`]: sequential apply loop
//! - [`scheduler`]: TTL expiration
//! - [`node`]: tikv/raft wrapper
//! - [`consensus`]: the seam between raft and the rest of the node
//! - [`runtime`]: worker loop, networking, node spawning
//! - [`gateway`]: dispatch and local reads
//! - [`v1`]: HTTP handlers
//! - [`cli`], [`topology`]: configuration

pub mod applier;
pub mod cli;
pub mod clock;
pub mod command;
pub mod consensus;
pub mod error;
pub mod gateway;
pub mod node;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod topology;
pub mod v1;

pub use error::{Error, Result};
