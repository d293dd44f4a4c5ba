use crate::{config::QuorumSet, Ballot, NodeId, Slot};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

/// Highest accepted proposal reported by a quorum of promises, if any.
pub type Promised = Option<(Ballot, Bytes)>;

/// Result of receiving a PREPARE from a proposer
#[derive(Debug, PartialEq, Eq)]
pub enum PrepareResponse {
    /// Acceptor has promised to not accept a ballot less than the
    /// proposed ballot
    Promise { proposed: Ballot, value: Option<(Ballot, Bytes)> },
    /// The ballot does not exceed the last promise; no reply is sent
    Ignore { promised: Ballot },
}

/// Result of receiving a PROPOSE from a proposer
#[derive(Debug, PartialEq, Eq)]
pub enum ProposeResponse {
    /// Acceptor has accepted the value of the proposed ballot
    Accepted { proposed: Ballot },
    /// The ballot is below the last promise; no reply is sent
    Ignore { promised: Ballot },
}

/// Round this node is driving for the slot as proposer
#[derive(Debug)]
struct Round {
    /// Ballot sent with PREPARE and PROPOSE messages
    ballot: Ballot,
    /// Acceptors that sent a PROMISE for the ballot
    promises: QuorumSet,
    /// Highest accepted proposal reported by those promises
    highest_accepted: Option<(Ballot, Bytes)>,
    /// Released once the promises reach quorum
    phase1: Option<oneshot::Sender<Promised>>,
    /// Released once ACCEPTs for the ballot reach quorum
    phase2: Option<oneshot::Sender<()>>,
}

/// State of a single Paxos instance (slot) as seen by this node.
///
/// The node plays every role for the slot: acceptor (`promised` and
/// `accepted`), proposer (`round`) and learner (`votes`, `chosen`).
#[derive(Debug)]
pub struct InstanceState {
    /// last promised ballot within this instance
    promised: Option<Ballot>,
    /// last accepted ballot/value pair within this instance
    accepted: Option<(Ballot, Bytes)>,
    round: Option<Round>,
    /// ACCEPTs received per ballot
    votes: HashMap<Ballot, QuorumSet>,
    /// Value chosen by a quorum of acceptors. Set at most once; the
    /// value is handed to the delivery queue at that moment.
    chosen: Option<Bytes>,
    quorum: usize,
}

impl InstanceState {
    pub fn new(quorum: usize) -> InstanceState {
        InstanceState {
            promised: None,
            accepted: None,
            round: None,
            votes: HashMap::new(),
            chosen: None,
            quorum,
        }
    }

    /// Ballot of the last promise
    #[cfg(test)]
    pub fn promised(&self) -> Option<Ballot> {
        self.promised
    }

    /// Last accepted proposal
    #[cfg(test)]
    pub fn accepted(&self) -> Option<&(Ballot, Bytes)> {
        self.accepted.as_ref()
    }

    /// Value chosen for the slot, once learned
    pub fn chosen(&self) -> Option<&Bytes> {
        self.chosen.as_ref()
    }

    /// Whether ACCEPTs for the ballot have reached quorum
    pub fn accepted_by_quorum(&self, ballot: Ballot) -> bool {
        self.votes.get(&ballot).map(QuorumSet::has_quorum).unwrap_or(false)
    }

    /// Handler for a PREPARE message. Only a ballot strictly above the
    /// last promise is promised; the promise carries the last accepted
    /// proposal.
    pub fn receive_prepare(&mut self, ballot: Ballot) -> PrepareResponse {
        match self.promised {
            Some(promised) if promised >= ballot => PrepareResponse::Ignore { promised },
            _ => {
                self.promised = Some(ballot);
                PrepareResponse::Promise { proposed: ballot, value: self.accepted.clone() }
            }
        }
    }

    /// Handler for a PROPOSE message. A ballot at or above the last
    /// promise is accepted, and the promise is raised to it.
    pub fn receive_propose(&mut self, ballot: Ballot, value: Bytes) -> ProposeResponse {
        match self.promised {
            Some(promised) if promised > ballot => ProposeResponse::Ignore { promised },
            _ => {
                self.promised = Some(ballot);
                self.accepted = Some((ballot, value));
                ProposeResponse::Accepted { proposed: ballot }
            }
        }
    }

    /// Starts Phase 1 for `ballot`, discarding any earlier round.
    ///
    /// The returned signal fires with the highest accepted proposal
    /// reported once a quorum of PROMISE messages has been received.
    pub fn start_phase1(&mut self, ballot: Ballot) -> oneshot::Receiver<Promised> {
        let (sender, receiver) = oneshot::channel();
        self.round = Some(Round {
            ballot,
            promises: QuorumSet::with_size(self.quorum),
            highest_accepted: None,
            phase1: Some(sender),
            phase2: None,
        });
        receiver
    }

    /// Note a promise from a peer. Returns `true` when the promise
    /// completed the Phase 1 quorum of the current round.
    pub fn receive_promise(
        &mut self,
        peer: NodeId,
        ballot: Ballot,
        accepted: Option<(Ballot, Bytes)>,
    ) -> bool {
        let quorum = self.quorum;
        let round = match self.round {
            // only count promises for the current round, once per peer
            Some(ref mut round) if round.ballot == ballot => round,
            _ => return false,
        };

        if !round.promises.insert(peer) {
            trace!("Duplicate PROMISE for {} from peer {}", ballot, peer);
            return false;
        }

        // the highest previously accepted proposal must be re-proposed
        if let Some((bal, value)) = accepted {
            let higher = match round.highest_accepted {
                Some((highest, _)) => highest < bal,
                None => true,
            };
            if higher {
                trace!("Peer {} has the highest accepted value thus far at {}", peer, bal);
                round.highest_accepted = Some((bal, value));
            }
        }

        if round.promises.len() != quorum {
            return false;
        }

        if let Some(phase1) = round.phase1.take() {
            // the proposer may have given up on the round
            let _ = phase1.send(round.highest_accepted.clone());
        }
        true
    }

    /// Starts Phase 2 for the current round.
    ///
    /// The returned signal fires once a quorum of ACCEPT messages for
    /// the ballot has been received.
    pub fn start_phase2(&mut self, ballot: Ballot) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        let reached = self.accepted_by_quorum(ballot);

        match self.round {
            Some(ref mut round) if round.ballot == ballot => {
                if reached {
                    let _ = sender.send(());
                } else {
                    round.phase2 = Some(sender);
                }
            }
            _ => {
                // not driving this ballot: the signal is dropped and the wait fails
                warn!("Phase 2 started for {} without a matching round", ballot);
            }
        }
        receiver
    }

    /// Note an ACCEPT from a peer. Returns the value when this ACCEPT
    /// makes the slot chosen for the first time.
    pub fn receive_accept(&mut self, peer: NodeId, ballot: Ballot, value: Bytes) -> Option<Bytes> {
        let quorum = self.quorum;
        let votes = self.votes.entry(ballot).or_insert_with(|| QuorumSet::with_size(quorum));
        if !votes.insert(peer) || !votes.has_quorum() {
            return None;
        }

        if let Some(ref mut round) = self.round {
            if round.ballot == ballot {
                if let Some(phase2) = round.phase2.take() {
                    let _ = phase2.send(());
                }
            }
        }

        match self.chosen {
            Some(ref chosen) => {
                if *chosen != value {
                    error!(
                        "Quorum for {} on a different value than the chosen one: {:?} != {:?}",
                        ballot, value, chosen
                    );
                }
                None
            }
            None => {
                self.chosen = Some(value.clone());
                Some(value)
            }
        }
    }
}

/// A single slot's state behind its own lock.
#[derive(Debug)]
pub struct Instance(Mutex<InstanceState>);

impl Instance {
    pub fn lock(&self) -> MutexGuard<'_, InstanceState> {
        match self.0.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Instances keyed by slot, created on first reference.
pub struct InstanceStore {
    instances: Mutex<HashMap<Slot, Arc<Instance>>>,
    quorum: usize,
}

impl InstanceStore {
    pub fn new(quorum: usize) -> InstanceStore {
        InstanceStore { instances: Mutex::new(HashMap::new()), quorum }
    }

    /// Instance for a slot
    pub fn get(&self, slot: Slot) -> Arc<Instance> {
        let mut instances = match self.instances.lock() {
            Ok(instances) => instances,
            Err(poisoned) => poisoned.into_inner(),
        };
        let quorum = self.quorum;
        instances
            .entry(slot)
            .or_insert_with(|| Arc::new(Instance(Mutex::new(InstanceState::new(quorum)))))
            .clone()
    }
}
