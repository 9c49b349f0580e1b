//! Session processing state and the candidate-pair check list.
//!
//! A session moves through a small monotonic state machine while its
//! connectivity checks run. The check list tracks every scheduled pair
//! and its progress; validated pairs feed the nomination policy in
//! [`nomination`].
//!
//! # Examples
//!
//! ```rust
//! use rustice::ice::IceProcessingState;
//!
//! let state = IceProcessingState::Completed;
//! assert!(state.is_over());
//! assert!(state.is_established());
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub mod nomination;
pub mod session;

/// Overall processing state of a session.
///
/// Transitions are monotonic: `Waiting` -> `Running` ->
/// `Completed`/`Failed` -> `Terminated`. A completed or failed session
/// ages into `Terminated` after a grace delay, during which it still
/// answers incoming checks but starts no new work.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default)]
pub enum IceProcessingState {
    #[default]
    Waiting,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl IceProcessingState {
    /// Returns true once processing has finished, successfully or not.
    #[inline]
    pub fn is_over(&self) -> bool {
        matches!(
            self,
            IceProcessingState::Completed
                | IceProcessingState::Failed
                | IceProcessingState::Terminated
        )
    }

    /// Returns true if processing finished with a usable pair.
    #[inline]
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            IceProcessingState::Completed | IceProcessingState::Terminated
        )
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_advance_to(&self, next: IceProcessingState) -> bool {
        use IceProcessingState::*;
        matches!(
            (self, next),
            (Waiting, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, Terminated)
                | (Failed, Terminated)
        )
    }
}

/// Type of the local candidate a check pair was built from.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum CandidateKind {
    /// Address of a local interface.
    Host,
    /// Externally observed address, discovered via a STUN server.
    ServerReflexive,
    /// Address allocated on a relay server.
    Relayed,
}

impl CandidateKind {
    #[inline]
    pub fn is_relayed(&self) -> bool {
        self == &CandidateKind::Relayed
    }
}

/// Progress of a single scheduled connectivity check.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum PairState {
    #[default]
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

impl PairState {
    /// A settled check will not change state again.
    #[inline]
    pub fn is_settled(&self) -> bool {
        matches!(self, PairState::Succeeded | PairState::Failed)
    }
}

/// One candidate pair scheduled for a connectivity check.
pub struct CheckPair {
    /// Local transport address of the pair.
    pub local: SocketAddr,
    /// Remote transport address of the pair.
    pub remote: SocketAddr,
    /// Ordering key, higher wins.
    pub priority: u64,
    /// Kind of the local candidate.
    pub kind: CandidateKind,
    state: AtomicCell<PairState>,
}

impl CheckPair {
    pub fn state(&self) -> PairState {
        self.state.load()
    }

    pub fn set_in_progress(&self) {
        self.state.store(PairState::InProgress);
    }

    pub(crate) fn settle(&self, state: PairState) {
        self.state.store(state);
    }
}

/// A pair that passed its connectivity check.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ValidatedPair {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub priority: u64,
    pub kind: CandidateKind,
    /// Round-trip time observed by the successful check.
    pub rtt: Duration,
}

impl ValidatedPair {
    pub(crate) fn from_check(pair: &CheckPair, rtt: Duration) -> Self {
        Self {
            local: pair.local,
            remote: pair.remote,
            priority: pair.priority,
            kind: pair.kind,
            rtt,
        }
    }
}

/// The ordered set of checks scheduled for one session.
///
/// Shared between the caller driving the checks and the nomination
/// task observing their progress.
#[derive(Clone, Default)]
pub struct CheckList {
    pairs: Arc<Mutex<Vec<Arc<CheckPair>>>>,
}

impl CheckList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a check for the given pair.
    pub fn add(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        priority: u64,
        kind: CandidateKind,
    ) -> Arc<CheckPair> {
        let pair = Arc::new(CheckPair {
            local,
            remote,
            priority,
            kind,
            state: AtomicCell::new(PairState::Waiting),
        });
        self.pairs.lock().push(pair.clone());
        pair
    }

    pub fn len(&self) -> usize {
        self.pairs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.lock().is_empty()
    }

    /// Whether a check with priority above `priority` is still unsettled.
    pub fn has_unsettled_above(&self, priority: u64) -> bool {
        self.pairs
            .lock()
            .iter()
            .any(|p| p.priority > priority && !p.state().is_settled())
    }

    /// Whether every scheduled check has succeeded or failed.
    pub fn all_settled(&self) -> bool {
        self.pairs.lock().iter().all(|p| p.state().is_settled())
    }

    /// Whether at least one check has succeeded.
    pub fn any_succeeded(&self) -> bool {
        self.pairs
            .lock()
            .iter()
            .any(|p| p.state() == PairState::Succeeded)
    }
}
