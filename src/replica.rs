use crate::{
    commands::{Command, Commander, Inbound, Transport},
    config::Configuration,
    failure::{Checkpoint, Crash, FailureInjector},
    instance::InstanceStore,
    proposer::{PendingSubmission, Proposer},
    window::DeliveryQueue,
    Ballot, NodeId, Slot,
};
use bytes::Bytes;
use std::mem;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// First slot of the total order
const FIRST_SLOT: Slot = 1;

/// Result of a submitted value's round.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    /// The submitted value was chosen for the slot
    Chosen(Slot),
    /// The round for the slot completed with a value another proposer had
    /// already gotten accepted. The submitted value was not chosen and is
    /// not retried.
    Superseded(Slot),
    /// The replica stopped before the round completed
    Cancelled,
}

/// State shared by the receiver and proposer tasks of a replica.
pub(crate) struct Core {
    pub config: Configuration,
    transport: Box<dyn Transport>,
    failures: Box<dyn FailureInjector>,
    pub instances: InstanceStore,
    pub delivery: DeliveryQueue,
    /// Next slot this node will propose into
    next_slot: AtomicU64,
    /// Counter component of the last ballot minted or observed
    counter: AtomicU64,
    pub cancel: CancellationToken,
}

impl Core {
    pub fn new(
        config: Configuration,
        transport: Box<dyn Transport>,
        failures: Box<dyn FailureInjector>,
    ) -> Core {
        Core {
            instances: InstanceStore::new(config.quorum_size()),
            delivery: DeliveryQueue::new(FIRST_SLOT),
            next_slot: AtomicU64::new(FIRST_SLOT),
            counter: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            config,
            transport,
            failures,
        }
    }

    /// Sends a command to a single node. Commands addressed to the current
    /// node are handled in place.
    pub fn send(&self, node: NodeId, command: Command) -> Result<(), Crash> {
        if self.cancel.is_cancelled() {
            return Err(Crash);
        }
        if node == self.config.current() {
            return self.receive(node, command);
        }
        if let Some(payload) = encode(&command) {
            self.transport.send(node, payload);
        }
        Ok(())
    }

    /// Sends a command to every member, the current node included.
    pub fn broadcast(&self, command: Command) -> Result<(), Crash> {
        if self.cancel.is_cancelled() {
            return Err(Crash);
        }
        if let Some(payload) = encode(&command) {
            self.transport.broadcast(payload);
        }
        self.receive(self.config.current(), command)
    }

    /// Consults the failure injector, stopping the replica on a crash.
    pub fn check(&self, checkpoint: Checkpoint) -> Result<(), Crash> {
        self.failures.check(checkpoint).map_err(|crash| {
            warn!("Node {} crashing at {:?}", self.config.current(), checkpoint);
            self.stop();
            crash
        })
    }

    /// Stops both tasks, releases waiting callers and leaves the group.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.delivery.close();
        self.transport.shutdown();
    }

    /// Hands a chosen value to the application and moves proposals past it.
    pub fn learn(&self, slot: Slot, value: Bytes) {
        self.advance(slot + 1);
        self.delivery.deliver(slot, value);
    }

    pub fn next_slot(&self) -> Slot {
        self.next_slot.load(Ordering::Acquire)
    }

    /// Raises the next proposal slot to at least `slot`.
    pub fn advance(&self, slot: Slot) {
        self.next_slot.fetch_max(slot, Ordering::AcqRel);
    }

    /// Mints a ballot higher than every ballot minted or observed so far.
    pub fn next_ballot(&self) -> Ballot {
        let counter = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        Ballot::new(counter, self.config.group_size(), self.config.current())
    }

    /// Notes a ballot seen from another proposer.
    pub fn observe(&self, ballot: Ballot) {
        let counter = ballot.counter(self.config.group_size());
        if self.counter.fetch_max(counter, Ordering::AcqRel) < counter {
            trace!("Observed higher {}", ballot);
        }
    }
}

/// Encodes a command for the transport. A command that fails to encode
/// is logged and not sent.
fn encode(command: &Command) -> Option<Bytes> {
    match command.encode() {
        Ok(payload) => Some(payload),
        Err(e) => {
            error!("Dropping {:?}, failed to encode: {}", command, e);
            None
        }
    }
}

/// A member of the broadcast group.
///
/// Values passed to [`submit`](Replica::submit) on any member are
/// delivered by [`take`](Replica::take) on every live member in the same
/// order.
pub struct Replica {
    core: Arc<Core>,
    submissions: mpsc::UnboundedSender<PendingSubmission>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Replica {
    /// Starts the receiver and proposer tasks for the current node.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start<T, F>(config: Configuration, transport: T, inbound: Inbound, failures: F) -> Replica
    where
        T: Transport,
        F: FailureInjector,
    {
        info!(
            "Starting node {} ({}) with quorum {}/{}",
            config.current(),
            config.current_name(),
            config.quorum_size(),
            config.group_size()
        );

        let core = Arc::new(Core::new(config, Box::new(transport), Box::new(failures)));
        let (submissions, queue) = mpsc::unbounded_channel();

        let receiver = tokio::spawn(receive_loop(core.clone(), inbound));
        let proposer = tokio::spawn(Proposer::new(core.clone(), queue).run());

        Replica { core, submissions, tasks: Mutex::new(vec![receiver, proposer]) }
    }

    /// Identifier of the current node
    pub fn node(&self) -> NodeId {
        self.core.config.current()
    }

    /// Flag indicating whether the replica has shut down or crashed
    pub fn is_stopped(&self) -> bool {
        self.core.cancel.is_cancelled()
    }

    /// Submits a value for broadcast and waits for its round to complete.
    ///
    /// Completion means a value was chosen for the slot the round ran in;
    /// see [`Outcome`] for whether it was this one.
    pub async fn submit<V: Into<Bytes>>(&self, value: V) -> Outcome {
        let (done, completed) = oneshot::channel();
        let submission = PendingSubmission { value: value.into(), done };
        if self.submissions.send(submission).is_err() {
            return Outcome::Cancelled;
        }
        // the proposer drops pending submissions when it stops
        completed.await.unwrap_or(Outcome::Cancelled)
    }

    /// Waits for the next value in the total order. Returns `None` once the
    /// replica has stopped and every value released before that was taken.
    pub async fn take(&self) -> Option<Bytes> {
        self.core.delivery.take().await
    }

    /// Stops the replica, releasing every caller blocked in `submit` or `take`.
    pub async fn shutdown(&self) {
        info!("Shutting down node {}", self.node());
        self.core.stop();

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => mem::take(&mut *tasks),
            Err(poisoned) => mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            if let Err(e) = task.await {
                error!("Replica task failed: {}", e);
            }
        }
        info!("Node {} shut down", self.node());
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.core.stop();
    }
}

/// Reads commands from the transport and hands each to its handler, one
/// at a time.
async fn receive_loop(core: Arc<Core>, mut inbound: Inbound) {
    debug!("Receiver started for node {}", core.config.current());
    loop {
        let (node, payload) = tokio::select! {
            _ = core.cancel.cancelled() => break,
            next = inbound.recv() => match next {
                Some(message) => message,
                None => {
                    info!("Transport closed the inbound stream");
                    break;
                }
            },
        };

        if node == core.config.current() || core.config.member(node).is_none() {
            warn!("Dropping message from unknown node {}", node);
            continue;
        }

        let command = match Command::decode(&payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("Dropping malformed message from node {}: {}", node, e);
                continue;
            }
        };

        trace!("Received {:?} from node {}", command, node);
        if core.receive(node, command).is_err() {
            break;
        }
    }
    debug!("Receiver stopped for node {}", core.config.current());
}
