//! Hooks for injecting crash-stop failures at fixed protocol points.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Protocol points at which a [`FailureInjector`] is consulted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Checkpoint {
    /// An acceptor has just received a PREPARE
    PrepareReceived,
    /// An acceptor has just sent a PROMISE
    PromiseSent,
    /// A proposer has just broadcast a PREPARE, trying to lead a slot
    PrepareBroadcast,
    /// A proposer has just observed a Phase 2 quorum for its value
    ValueChosen,
}

/// Marker returned when a checkpoint stopped the replica.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Crash;

/// Decides whether the replica survives each checkpoint.
pub trait FailureInjector: Send + Sync + 'static {
    fn check(&self, checkpoint: Checkpoint) -> Result<(), Crash>;
}

impl<F: FailureInjector> FailureInjector for Arc<F> {
    fn check(&self, checkpoint: Checkpoint) -> Result<(), Crash> {
        (**self).check(checkpoint)
    }
}

/// Production injector: never fails.
#[derive(Clone, Copy, Default, Debug)]
pub struct NoFailures;

impl FailureInjector for NoFailures {
    fn check(&self, _checkpoint: Checkpoint) -> Result<(), Crash> {
        Ok(())
    }
}

/// Crashes the replica the first time the given checkpoint is reached.
#[derive(Debug)]
pub struct CrashAt {
    checkpoint: Checkpoint,
    fired: AtomicBool,
}

impl CrashAt {
    pub fn new(checkpoint: Checkpoint) -> CrashAt {
        CrashAt { checkpoint, fired: AtomicBool::new(false) }
    }

    /// Whether the crash has been triggered
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl FailureInjector for CrashAt {
    fn check(&self, checkpoint: Checkpoint) -> Result<(), Crash> {
        if checkpoint == self.checkpoint && !self.fired.swap(true, Ordering::AcqRel) {
            Err(Crash)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_at_fires_once() {
        let injector = CrashAt::new(Checkpoint::PromiseSent);
        assert_eq!(Ok(()), injector.check(Checkpoint::PrepareReceived));
        assert_eq!(Ok(()), injector.check(Checkpoint::ValueChosen));
        assert!(!injector.fired());

        assert_eq!(Err(Crash), injector.check(Checkpoint::PromiseSent));
        assert!(injector.fired());
        assert_eq!(Ok(()), injector.check(Checkpoint::PromiseSent));
    }
}
