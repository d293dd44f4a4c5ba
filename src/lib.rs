//! Total-order broadcast for a fixed group of processes, built on
//! multi-instance Paxos.
//!
//! Each position (_slot_) in the total order is decided by its own Paxos
//! instance. A [`Replica`] accepts values through [`Replica::submit`],
//! drives Phase 1 (PREPARE/PROMISE) and Phase 2 (PROPOSE/ACCEPT) for the
//! next open slot, and hands chosen values to the application through
//! [`Replica::take`] in strict slot order, identically on every live member.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use paxos_broadcast::{local::LocalNetwork, Configuration, NoFailures, Replica};
//! # async fn run() {
//! let group = ["a:4000", "b:4001", "c:4002"];
//! let network = LocalNetwork::new(group.len());
//!
//! let replicas = group
//!     .iter()
//!     .map(|name| {
//!         let config = Configuration::new(name, group.iter()).unwrap();
//!         let (transport, inbound) = network.join(config.current());
//!         Replica::start(config, transport, inbound, NoFailures)
//!     })
//!     .collect::<Vec<_>>();
//!
//! replicas[0].submit("hello").await;
//! for replica in &replicas {
//!     assert_eq!(Some("hello".into()), replica.take().await);
//! }
//! # }
//! ```
#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[macro_use]
extern crate log;

mod acceptor;
mod commands;
pub mod config;
mod failure;
mod instance;
pub mod local;
mod proposer;
mod replica;
mod retry;
mod window;

pub use commands::{Command, Inbound, Transport};
pub use config::{ConfigError, Configuration};
pub use failure::{Checkpoint, Crash, CrashAt, FailureInjector, NoFailures};
pub use replica::{Outcome, Replica};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a value within the total order. The first slot is `1`.
pub type Slot = u64;

/// A `NodeId` is the rank of a process within the static group list.
pub type NodeId = u32;

/// Ballot numbering orders proposals across every process in the group.
///
/// A ballot is `counter * group_size + node`, so ballots minted by
/// different nodes never collide and a node can always exceed any ballot
/// it has observed by raising its own counter.
#[derive(Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub struct Ballot(pub u64);

impl Ballot {
    /// Ballot for a node's `counter`-th proposal.
    pub fn new(counter: u64, group_size: usize, node: NodeId) -> Ballot {
        assert!((node as usize) < group_size);
        Ballot(counter * group_size as u64 + u64::from(node))
    }

    /// Counter component of the ballot.
    pub fn counter(self, group_size: usize) -> u64 {
        self.0 / group_size as u64
    }

    /// Node that minted the ballot.
    pub fn node(self, group_size: usize) -> NodeId {
        (self.0 % group_size as u64) as NodeId
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
