use crate::{failure::Crash, Ballot, NodeId, Slot};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Stream of `(sender, payload)` pairs delivered by the transport.
pub type Inbound = mpsc::UnboundedReceiver<(NodeId, Bytes)>;

/// Reliable group communication used to exchange encoded commands.
///
/// Sends are fire-and-forget; the transport is expected to eventually
/// deliver payloads to live members.
pub trait Transport: Send + Sync + 'static {
    /// Send a payload to a single member
    fn send(&self, node: NodeId, payload: Bytes);

    /// Send a payload to every member except the current node
    fn broadcast(&self, payload: Bytes);

    /// Stops sending and receiving
    fn shutdown(&self) {}
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
/// Messages exchanged between replicas. Every message names the slot
/// (Paxos instance) it belongs to and the ballot of the round.
pub enum Command {
    /// Phase 1a PREPARE message containing the proposed ballot
    Prepare(Slot, Ballot),

    /// Phase 1b PROMISE message not to accept ballots below the proposed
    /// one, carrying the acceptor's last accepted ballot and value, if any.
    Promise(Slot, Ballot, Option<(Ballot, Bytes)>),

    /// Phase 2a PROPOSE message asking acceptors to accept a value
    Propose(Slot, Ballot, Bytes),

    /// Phase 2b ACCEPT message announcing that the sender accepted the value
    Accept(Slot, Ballot, Bytes),
}

impl Command {
    /// Slot the command applies to
    pub fn slot(&self) -> Slot {
        match *self {
            Command::Prepare(slot, ..)
            | Command::Promise(slot, ..)
            | Command::Propose(slot, ..)
            | Command::Accept(slot, ..) => slot,
        }
    }

    /// Wire encoding of the command
    pub fn encode(&self) -> Result<Bytes, bincode::Error> {
        bincode::serialize(self).map(Bytes::from)
    }

    /// Decodes a command from the wire
    pub fn decode(payload: &[u8]) -> Result<Command, bincode::Error> {
        bincode::deserialize(payload)
    }
}

/// Receiver of Paxos commands.
///
/// Each handler is invoked with the node that sent the command. A handler
/// returns `Err(Crash)` when a failure checkpoint stopped the replica.
pub(crate) trait Commander {
    /// Receive a Phase 1a PREPARE message
    fn prepare(&self, node: NodeId, slot: Slot, bal: Ballot) -> Result<(), Crash>;

    /// Receive a Phase 1b PROMISE message
    fn promise(
        &self,
        node: NodeId,
        slot: Slot,
        bal: Ballot,
        accepted: Option<(Ballot, Bytes)>,
    ) -> Result<(), Crash>;

    /// Receive a Phase 2a PROPOSE message
    fn propose(&self, node: NodeId, slot: Slot, bal: Ballot, val: Bytes) -> Result<(), Crash>;

    /// Receive a Phase 2b ACCEPT message
    fn accept(&self, node: NodeId, slot: Slot, bal: Ballot, val: Bytes) -> Result<(), Crash>;

    /// Routes a command to its handler
    fn receive(&self, node: NodeId, command: Command) -> Result<(), Crash> {
        match command {
            Command::Prepare(slot, bal) => self.prepare(node, slot, bal),
            Command::Promise(slot, bal, accepted) => self.promise(node, slot, bal, accepted),
            Command::Propose(slot, bal, val) => self.propose(node, slot, bal, val),
            Command::Accept(slot, bal, val) => self.accept(node, slot, bal, val),
        }
    }
}
