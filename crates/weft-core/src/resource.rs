//! The resource lifecycle ladder shared by the wire contract and the store.
//!
//! Every live entity (worker, pipeline instance, segment instance, manifold
//! instance) carries a status drawn from a **total order**; transitions may
//! only move forward. Monotonicity gives subscribers a simple convergence
//! predicate: once an entity is observed at a status, no later snapshot will
//! show it earlier.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a live entity.
///
/// The ladder is totally ordered:
///
/// ```text
/// Registered < Activated < Ready < Running < Completed < Stopped < Destroyed
/// ```
///
/// An entity may skip rungs but never descend. Removal from the store is only
/// legal at `Destroyed`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Created in the store, not yet activated by its owner.
    Registered = 1,
    /// Activated by its owning client; participating in the data plane.
    Activated = 2,
    /// Fully wired and ready to process.
    Ready = 3,
    /// Actively processing.
    Running = 4,
    /// Finished processing successfully.
    Completed = 5,
    /// Halted; no further processing.
    Stopped = 6,
    /// Torn down; eligible for removal from the store.
    Destroyed = 7,
}

impl ResourceStatus {
    /// Returns true if an entity at `self` may move to `next`.
    ///
    /// Equal statuses are allowed so repeated updates are idempotent.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        next >= self
    }

    /// Returns true once the entity may be removed from the store.
    #[must_use]
    pub fn is_destroyed(self) -> bool {
        self == Self::Destroyed
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered => write!(f, "registered"),
            Self::Activated => write!(f, "activated"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// The entity kinds that carry a [`ResourceStatus`].
///
/// Used on the wire to name the target of a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A registered transport endpoint.
    Worker,
    /// A live pipeline materialization.
    PipelineInstance,
    /// A live segment materialization.
    SegmentInstance,
    /// A cross-worker port connector.
    ManifoldInstance,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker => write!(f, "worker"),
            Self::PipelineInstance => write!(f, "pipeline instance"),
            Self::SegmentInstance => write!(f, "segment instance"),
            Self::ManifoldInstance => write!(f, "manifold instance"),
        }
    }
}
