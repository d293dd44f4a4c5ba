//! Static group membership and protocol timing.
use crate::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Default bound on waiting for a Phase 1 or Phase 2 quorum.
const PHASE_TIMEOUT_MS: u64 = 3_000;
/// Default base unit for retry backoff.
const BACKOFF_BASE_MS: u64 = 50;
/// Backoff is capped at this multiple of the base unit.
const BACKOFF_CAP_FACTOR: u32 = 10;

/// Error building a [`Configuration`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("group membership is empty")]
    EmptyGroup,
    #[error("process {0} is not a member of the group")]
    NotAMember(String),
    #[error("process {0} appears more than once in the group")]
    DuplicateMember(String),
}

/// Configuration holds the membership of the group and the timing used
/// to drive rounds.
///
/// Membership is fixed for the lifetime of the group. A process's
/// [`NodeId`] is its rank within the group list, so every member must be
/// given the list in the same order.
#[derive(Clone, Debug)]
pub struct Configuration {
    current: NodeId,
    members: Vec<String>,
    phase_timeout: Duration,
    backoff_base: Duration,
}

impl Configuration {
    /// Creates a configuration for the process named `current` within
    /// the ordered `group`.
    pub fn new<S, I>(current: S, group: I) -> Result<Configuration, ConfigError>
    where
        S: AsRef<str>,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let members: Vec<String> = group.into_iter().map(|m| m.as_ref().to_string()).collect();
        if members.is_empty() {
            return Err(ConfigError::EmptyGroup);
        }

        for (i, member) in members.iter().enumerate() {
            if members[..i].contains(member) {
                return Err(ConfigError::DuplicateMember(member.clone()));
            }
        }

        let current = current.as_ref();
        let rank = members
            .iter()
            .position(|m| m == current)
            .ok_or_else(|| ConfigError::NotAMember(current.to_string()))?;

        Ok(Configuration {
            current: rank as NodeId,
            members,
            phase_timeout: Duration::from_millis(PHASE_TIMEOUT_MS),
            backoff_base: Duration::from_millis(BACKOFF_BASE_MS),
        })
    }

    /// Sets the bound on each quorum wait.
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Configuration {
        self.phase_timeout = timeout;
        self
    }

    /// Sets the base backoff unit. The cap is ten times the base.
    pub fn with_backoff(mut self, base: Duration) -> Configuration {
        self.backoff_base = base;
        self
    }

    /// Size of quorum
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Number of members in the group
    pub fn group_size(&self) -> usize {
        self.members.len()
    }

    /// Current node identifier
    pub fn current(&self) -> NodeId {
        self.current
    }

    /// Name of the current process
    pub fn current_name(&self) -> &str {
        &self.members[self.current as usize]
    }

    /// Iterator containing `NodeId` values of the other members
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        let current = self.current;
        (0..self.members.len() as NodeId).filter(move |n| *n != current)
    }

    /// Gets the name of a member.
    pub fn member(&self, node: NodeId) -> Option<&str> {
        self.members.get(node as usize).map(String::as_str)
    }

    /// Gets the node ID from a process name.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.members.iter().position(|m| m == name).map(|i| i as NodeId)
    }

    /// Bound on waiting for a phase quorum
    pub fn phase_timeout(&self) -> Duration {
        self.phase_timeout
    }

    /// Initial and maximum retry backoff
    pub fn backoff(&self) -> (Duration, Duration) {
        (self.backoff_base, self.backoff_base * BACKOFF_CAP_FACTOR)
    }
}

/// `QuorumSet` tracks nodes that have sent a certain message and detects
/// when a majority is reached. Duplicates count once.
#[derive(Clone, Debug)]
pub(crate) struct QuorumSet {
    // sorted, de-duplicated
    nodes: Vec<NodeId>,
    quorum: usize,
}

impl QuorumSet {
    /// Creates a QuorumSet with a given size for quorum.
    pub fn with_size(quorum: usize) -> QuorumSet {
        assert!(quorum > 0);
        QuorumSet { nodes: Vec::with_capacity(quorum), quorum }
    }

    /// Inserts a node into the set. Returns `false` for a node already present.
    pub fn insert(&mut self, n: NodeId) -> bool {
        match self.nodes.binary_search(&n) {
            Ok(_) => false,
            Err(loc) => {
                self.nodes.insert(loc, n);
                true
            }
        }
    }

    /// Flag indicating whether quorum has been reached.
    pub fn has_quorum(&self) -> bool {
        self.nodes.len() >= self.quorum
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
