//! Error types for the state domain.

use weft_core::{ResourceKind, ResourceStatus};

/// The result type used throughout weft-state.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors emitted by the state store.
///
/// All variants except [`StoreError::IdExhausted`] and
/// [`StoreError::InvariantViolation`] are validation failures: they are
/// recoverable, leave the store unchanged, and are reported back to the
/// originating client inline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A referenced prerequisite entity does not exist.
    #[error("missing prerequisite: {message}")]
    MissingPrerequisite {
        /// What was required and missing.
        message: String,
    },

    /// An entity with this identity already exists.
    #[error("duplicate: {message}")]
    DuplicateId {
        /// What collided.
        message: String,
    },

    /// A status update would move an entity backward in the lifecycle.
    #[error("invalid state transition on {kind} {id}: {from} -> {to}")]
    InvalidTransition {
        /// Kind of the entity.
        kind: ResourceKind,
        /// Id of the entity within its kind.
        id: u64,
        /// Current status.
        from: ResourceStatus,
        /// Rejected target status.
        to: ResourceStatus,
    },

    /// Removal was attempted before the entity reached `Destroyed`.
    #[error("premature removal of {kind} {id}: status is {status}")]
    PrematureRemoval {
        /// Kind of the entity.
        kind: ResourceKind,
        /// Id of the entity within its kind.
        id: u64,
        /// Status at the time of the attempt.
        status: ResourceStatus,
    },

    /// No entity of the named kind has this id.
    #[error("unknown id: no {kind} with id {id}")]
    UnknownId {
        /// Kind that was looked up.
        kind: &'static str,
        /// Id that was not found.
        id: u64,
    },

    /// Removal would orphan a referrer.
    #[error("dangling reference: {message}")]
    DanglingReference {
        /// What still refers to the entity.
        message: String,
    },

    /// The id counter for an entity kind overflowed. Fatal.
    #[error("id space exhausted for {kind}")]
    IdExhausted {
        /// The entity kind whose counter overflowed.
        kind: &'static str,
    },

    /// A reducer produced inconsistent state. Fatal: the store's invariants
    /// are a contract the server must uphold, and continuing risks
    /// corruption.
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// The violated invariant.
        message: String,
    },
}

impl StoreError {
    /// Creates a missing-prerequisite error.
    #[must_use]
    pub fn missing_prerequisite(message: impl Into<String>) -> Self {
        Self::MissingPrerequisite {
            message: message.into(),
        }
    }

    /// Creates a duplicate-identity error.
    #[must_use]
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::DuplicateId {
            message: message.into(),
        }
    }

    /// Creates a dangling-reference error.
    #[must_use]
    pub fn dangling(message: impl Into<String>) -> Self {
        Self::DanglingReference {
            message: message.into(),
        }
    }

    /// Creates an invariant-violation error.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Returns true for errors the server must not survive.
    ///
    /// Validation errors are returned to the offending client; fatal errors
    /// terminate the server because the store can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::IdExhausted { .. } | Self::InvariantViolation { .. }
        )
    }
}

impl From<weft_core::Error> for StoreError {
    fn from(err: weft_core::Error) -> Self {
        match err {
            weft_core::Error::IdSpaceExhausted { kind } => Self::IdExhausted { kind },
            weft_core::Error::InvalidId { message } => Self::InvariantViolation { message },
        }
    }
}
