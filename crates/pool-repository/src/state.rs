//! Replica states and the transition table enforced by `set_state`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a replica.
///
/// `New` and `Destroyed` are pseudo-states: `New` means the repository has no
/// record for the id, `Destroyed` means the record and its data file have
/// been erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    New,
    FromClient,
    FromStore,
    FromPool,
    Precious,
    Cached,
    Broken,
    Removed,
    Destroyed,
}

/// Outcome of checking a requested `set_state` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Perform the state change.
    Apply,
    /// Nothing to do; the request is already satisfied.
    NoOp,
    /// Not permitted through `set_state`.
    Illegal,
}

impl ReplicaState {
    pub const ALL: [ReplicaState; 9] = [
        ReplicaState::New,
        ReplicaState::FromClient,
        ReplicaState::FromStore,
        ReplicaState::FromPool,
        ReplicaState::Precious,
        ReplicaState::Cached,
        ReplicaState::Broken,
        ReplicaState::Removed,
        ReplicaState::Destroyed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReplicaState::New => "NEW",
            ReplicaState::FromClient => "FROM_CLIENT",
            ReplicaState::FromStore => "FROM_STORE",
            ReplicaState::FromPool => "FROM_POOL",
            ReplicaState::Precious => "PRECIOUS",
            ReplicaState::Cached => "CACHED",
            ReplicaState::Broken => "BROKEN",
            ReplicaState::Removed => "REMOVED",
            ReplicaState::Destroyed => "DESTROYED",
        }
    }

    /// States a replica is in while its write handle is open.
    pub fn is_transfer(self) -> bool {
        matches!(
            self,
            ReplicaState::FromClient | ReplicaState::FromStore | ReplicaState::FromPool
        )
    }

    /// States a committed write handle may move a replica into.
    pub fn is_target(self) -> bool {
        matches!(self, ReplicaState::Precious | ReplicaState::Cached)
    }

    /// Whether replicas in this state can be opened for reading.
    pub fn is_readable(self) -> bool {
        matches!(self, ReplicaState::Precious | ReplicaState::Cached)
    }

    /// Whether sticky flags may be set on replicas in this state.
    pub fn accepts_sticky(self) -> bool {
        matches!(
            self,
            ReplicaState::Precious | ReplicaState::Cached | ReplicaState::Broken
        )
    }

    /// Check a transition requested through `set_state`.
    ///
    /// Transfer states are left only through a write handle, so they never
    /// appear on either side of a legal transition here.
    pub fn transition_to(self, target: ReplicaState) -> Transition {
        use ReplicaState::*;
        match (self, target) {
            (New | Removed | Destroyed, Removed) => Transition::NoOp,
            (Precious | Cached | Broken, Removed | Cached | Precious | Broken) => {
                if self == target {
                    Transition::NoOp
                } else {
                    Transition::Apply
                }
            }
            _ => Transition::Illegal,
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicaState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        ReplicaState::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| format!("unknown replica state: {}", s))
    }
}
