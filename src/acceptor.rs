use crate::{
    commands::{Command, Commander},
    failure::{Checkpoint, Crash},
    instance::{PrepareResponse, ProposeResponse},
    replica::Core,
    Ballot, NodeId, Slot,
};
use bytes::Bytes;

/// Acceptor and learner handlers. The instance lock is released before
/// anything is sent, since messages to the current node are handled in
/// place.
impl Commander for Core {
    fn prepare(&self, node: NodeId, slot: Slot, bal: Ballot) -> Result<(), Crash> {
        self.check(Checkpoint::PrepareReceived)?;
        self.observe(bal);

        let response = self.instances.get(slot).lock().receive_prepare(bal);
        match response {
            PrepareResponse::Promise { proposed, value } => {
                debug!("Promising {} for slot {} to node {}", proposed, slot, node);
                self.send(node, Command::Promise(slot, proposed, value))?;
                self.check(Checkpoint::PromiseSent)
            }
            PrepareResponse::Ignore { promised } => {
                debug!(
                    "Ignoring PREPARE {} for slot {} from node {}, promised {}",
                    bal, slot, node, promised
                );
                Ok(())
            }
        }
    }

    fn promise(
        &self,
        node: NodeId,
        slot: Slot,
        bal: Ballot,
        accepted: Option<(Ballot, Bytes)>,
    ) -> Result<(), Crash> {
        trace!("PROMISE {} for slot {} from node {}", bal, slot, node);
        if self.instances.get(slot).lock().receive_promise(node, bal, accepted) {
            debug!("Quorum reached for Phase 1 of slot {} at {}", slot, bal);
        }
        Ok(())
    }

    fn propose(&self, node: NodeId, slot: Slot, bal: Ballot, val: Bytes) -> Result<(), Crash> {
        self.observe(bal);

        let response = self.instances.get(slot).lock().receive_propose(bal, val.clone());
        match response {
            ProposeResponse::Accepted { proposed } => {
                debug!("Accepted {} for slot {} from node {}", proposed, slot, node);
                self.broadcast(Command::Accept(slot, proposed, val))
            }
            ProposeResponse::Ignore { promised } => {
                debug!(
                    "Ignoring PROPOSE {} for slot {} from node {}, promised {}",
                    bal, slot, node, promised
                );
                Ok(())
            }
        }
    }

    fn accept(&self, node: NodeId, slot: Slot, bal: Ballot, val: Bytes) -> Result<(), Crash> {
        trace!("ACCEPT {} for slot {} from node {}", bal, slot, node);
        let chosen = self.instances.get(slot).lock().receive_accept(node, bal, val);
        if let Some(value) = chosen {
            info!("Slot {} chosen at {}", slot, bal);
            self.learn(slot, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        commands::Transport,
        config::Configuration,
        failure::{CrashAt, FailureInjector, NoFailures},
    };
    use std::sync::{Arc, Mutex};

    #[test]
    fn prepare_replies_with_promise() {
        let (core, sent) = core_at("a", NoFailures);

        core.prepare(1, 1, Ballot(4)).unwrap();
        assert_eq!(
            vec![Sent::To(1, Command::Promise(1, Ballot(4), None))],
            sent.take()
        );

        // equal or lower ballots get no reply
        core.prepare(2, 1, Ballot(4)).unwrap();
        core.prepare(2, 1, Ballot(2)).unwrap();
        assert!(sent.take().is_empty());

        // other slots are independent
        core.prepare(2, 2, Ballot(2)).unwrap();
        assert_eq!(
            vec![Sent::To(2, Command::Promise(2, Ballot(2), None))],
            sent.take()
        );
    }

    #[test]
    fn prepare_raises_ballot_counter() {
        let (core, _sent) = core_at("a", NoFailures);
        assert_eq!(Ballot(3), core.next_ballot());

        // #13 has counter 4 in a group of 3
        core.prepare(1, 1, Ballot(13)).unwrap();
        assert_eq!(Ballot(15), core.next_ballot());
    }

    #[test]
    fn promise_carries_accepted_value() {
        let (core, sent) = core_at("b", NoFailures);
        core.propose(0, 1, Ballot(3), "x".into()).unwrap();
        sent.take();

        core.prepare(2, 1, Ballot(5)).unwrap();
        assert_eq!(
            vec![Sent::To(2, Command::Promise(1, Ballot(5), Some((Ballot(3), "x".into()))))],
            sent.take()
        );
    }

    #[test]
    fn propose_broadcasts_accept() {
        let (core, sent) = core_at("a", NoFailures);

        core.propose(1, 1, Ballot(4), "v".into()).unwrap();
        assert_eq!(vec![Sent::All(Command::Accept(1, Ballot(4), "v".into()))], sent.take());

        // the local ACCEPT counts toward the quorum
        let instance = core.instances.get(1);
        assert!(instance.lock().chosen().is_none());
        core.accept(1, 1, Ballot(4), "v".into()).unwrap();
        assert_eq!(Some(&Bytes::from("v")), instance.lock().chosen());
        assert_eq!(2, core.next_slot());
    }

    #[test]
    fn propose_below_promise_ignored() {
        let (core, sent) = core_at("a", NoFailures);
        core.prepare(2, 1, Ballot(8)).unwrap();
        sent.take();

        core.propose(1, 1, Ballot(4), "v".into()).unwrap();
        assert!(sent.take().is_empty());
        assert!(core.instances.get(1).lock().accepted().is_none());
    }

    #[tokio::test]
    async fn chosen_values_delivered_in_order() {
        let (core, _sent) = core_at("c", NoFailures);
        core.accept(0, 2, Ballot(3), "second".into()).unwrap();
        core.accept(1, 2, Ballot(3), "second".into()).unwrap();
        assert_eq!(3, core.next_slot());

        core.accept(0, 1, Ballot(3), "first".into()).unwrap();
        core.accept(1, 1, Ballot(3), "first".into()).unwrap();

        // a third ACCEPT does not deliver again
        core.accept(2, 1, Ballot(3), "first".into()).unwrap();
        core.delivery.close();

        assert_eq!(Some(Bytes::from("first")), core.delivery.take().await);
        assert_eq!(Some(Bytes::from("second")), core.delivery.take().await);
        assert_eq!(None, core.delivery.take().await);
    }

    #[test]
    fn crash_after_promise() {
        let (core, sent) = core_at("a", CrashAt::new(Checkpoint::PromiseSent));

        assert_eq!(Err(Crash), core.prepare(1, 1, Ballot(4)));
        assert_eq!(
            vec![Sent::To(1, Command::Promise(1, Ballot(4), None)), Sent::Shutdown],
            sent.take()
        );
        assert!(core.cancel.is_cancelled());

        // a stopped replica sends nothing
        assert_eq!(Err(Crash), core.propose(1, 1, Ballot(4), "v".into()));
        assert!(sent.take().is_empty());
    }

    #[test]
    fn crash_on_prepare_sends_nothing() {
        let (core, sent) = core_at("a", CrashAt::new(Checkpoint::PrepareReceived));

        assert_eq!(Err(Crash), core.prepare(1, 1, Ballot(4)));
        assert_eq!(vec![Sent::Shutdown], sent.take());
        assert_eq!(None, core.instances.get(1).lock().promised());
    }

    fn core_at<F: FailureInjector>(name: &str, failures: F) -> (Core, Recorder) {
        let config = Configuration::new(name, vec!["a", "b", "c"]).unwrap();
        let recorder = Recorder::default();
        let core = Core::new(config, Box::new(recorder.clone()), Box::new(failures));
        (core, recorder)
    }

    #[derive(PartialEq, Debug)]
    enum Sent {
        To(NodeId, Command),
        All(Command),
        Shutdown,
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Sent>>>);

    impl Recorder {
        fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl Transport for Recorder {
        fn send(&self, node: NodeId, payload: Bytes) {
            let command = Command::decode(&payload).unwrap();
            self.0.lock().unwrap().push(Sent::To(node, command));
        }

        fn broadcast(&self, payload: Bytes) {
            let command = Command::decode(&payload).unwrap();
            self.0.lock().unwrap().push(Sent::All(command));
        }

        fn shutdown(&self) {
            self.0.lock().unwrap().push(Sent::Shutdown);
        }
    }
}
