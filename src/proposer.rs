use crate::{
    commands::Command,
    failure::{Checkpoint, Crash},
    instance::Instance,
    replica::{Core, Outcome},
    retry::Backoff,
    Slot,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};

/// Value waiting for a round, with the caller's completion signal.
pub(crate) struct PendingSubmission {
    pub value: Bytes,
    pub done: oneshot::Sender<Outcome>,
}

/// Result of running a single round
#[derive(Debug)]
enum Attempt {
    /// A value was chosen for the slot by this round
    Completed(Outcome),
    /// The slot was chosen by another proposer; move on to the next slot
    Skip,
    /// The round timed out; retry the slot with a higher ballot
    Retry,
}

/// Drives submitted values through Paxos rounds, one value at a time.
pub(crate) struct Proposer {
    core: Arc<Core>,
    submissions: mpsc::UnboundedReceiver<PendingSubmission>,
    backoff: Backoff,
}

impl Proposer {
    pub fn new(core: Arc<Core>, submissions: mpsc::UnboundedReceiver<PendingSubmission>) -> Proposer {
        let (base, max) = core.config.backoff();
        Proposer { core, submissions, backoff: Backoff::new(base, max) }
    }

    /// Serves submissions until the replica stops. Submissions still
    /// queued at that point are dropped, completing them as cancelled.
    pub async fn run(mut self) {
        debug!("Proposer started for node {}", self.core.config.current());
        let cancel = self.core.cancel.clone();
        loop {
            let submission = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.submissions.recv() => match next {
                    Some(submission) => submission,
                    None => break,
                },
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Outcome::Cancelled,
                outcome = self.drive(&submission.value) => outcome,
            };
            if submission.done.send(outcome).is_err() {
                debug!("Submitter went away before {:?}", outcome);
            }
        }
        debug!("Proposer stopped for node {}", self.core.config.current());
    }

    /// Runs rounds for a value until one of them completes.
    async fn drive(&mut self, value: &Bytes) -> Outcome {
        self.backoff.reset();
        let mut slot = self.core.next_slot();
        loop {
            match self.attempt(slot, value).await {
                Ok(Attempt::Completed(outcome)) => return outcome,
                Ok(Attempt::Skip) => {
                    debug!("Slot {} already chosen, moving on", slot);
                    slot = self.core.next_slot();
                }
                Ok(Attempt::Retry) => {
                    // the same slot is retried, it may yet be chosen with this value
                    let wait = self.backoff.next_wait();
                    debug!("Retrying slot {} in {:?}", slot, wait);
                    sleep(wait).await;
                }
                Err(Crash) => return Outcome::Cancelled,
            }
        }
    }

    /// Runs both phases for a slot under a fresh ballot.
    async fn attempt(&self, slot: Slot, value: &Bytes) -> Result<Attempt, Crash> {
        let instance = self.core.instances.get(slot);
        if let Some(attempt) = self.resolved(slot, &instance, value) {
            return Ok(attempt);
        }

        let ballot = self.core.next_ballot();
        let phase_timeout = self.core.config.phase_timeout();
        debug!("Starting Phase 1 for slot {} with {}", slot, ballot);

        // Phase 1
        let promised = instance.lock().start_phase1(ballot);
        self.core.broadcast(Command::Prepare(slot, ballot))?;
        self.core.check(Checkpoint::PrepareBroadcast)?;
        let highest_accepted = match timeout(phase_timeout, promised).await {
            Ok(Ok(highest_accepted)) => highest_accepted,
            _ => {
                debug!("Phase 1 timed out for slot {} at {}", slot, ballot);
                return Ok(self.resolved(slot, &instance, value).unwrap_or(Attempt::Retry));
            }
        };

        // a value accepted at a lower ballot may already be chosen
        let (proposal, outcome) = match highest_accepted {
            Some((accepted, forced)) if forced != *value => {
                info!("Re-proposing value accepted at {} for slot {}", accepted, slot);
                (forced, Outcome::Superseded(slot))
            }
            _ => (value.clone(), Outcome::Chosen(slot)),
        };

        // Phase 2
        debug!("Starting Phase 2 for slot {} with {}", slot, ballot);
        let accepted = instance.lock().start_phase2(ballot);
        self.core.broadcast(Command::Propose(slot, ballot, proposal.clone()))?;
        let signalled = matches!(timeout(phase_timeout, accepted).await, Ok(Ok(())));
        // a higher ballot may have finished the slot with this round's value
        if signalled || instance.lock().chosen() == Some(&proposal) {
            self.core.check(Checkpoint::ValueChosen)?;
            self.core.advance(slot + 1);
            info!("Round for slot {} completed at {} as {:?}", slot, ballot, outcome);
            return Ok(Attempt::Completed(outcome));
        }

        debug!("Phase 2 timed out for slot {} at {}", slot, ballot);
        Ok(self.resolved(slot, &instance, value).unwrap_or(Attempt::Retry))
    }

    /// Settles a slot that was chosen outside of the current round.
    /// Returns `None` while the slot is still open.
    fn resolved(&self, slot: Slot, instance: &Instance, value: &Bytes) -> Option<Attempt> {
        let chosen = instance.lock().chosen().cloned()?;
        self.core.advance(slot + 1);
        if chosen == *value {
            debug!("Slot {} was chosen with the submitted value by an earlier round", slot);
            Some(Attempt::Completed(Outcome::Chosen(slot)))
        } else {
            Some(Attempt::Skip)
        }
    }
}
