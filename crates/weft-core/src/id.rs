//! Strongly-typed identifiers for weft entities.
//!
//! All identifiers in weft are:
//! - **Strongly typed**: Prevents mixing up different id types at compile time
//! - **Dense**: Allocated from a per-kind monotonic counter starting at 1
//! - **Never reused**: A removed entity's id stays retired for the lifetime of
//!   the server; counter overflow is reported as an error rather than wrapped
//!
//! # Example
//!
//! ```rust
//! use weft_core::id::{IdAllocator, WorkerId};
//!
//! let mut ids: IdAllocator<WorkerId> = IdAllocator::new();
//! assert_eq!(ids.next_id().unwrap(), WorkerId::new(1));
//! assert_eq!(ids.next_id().unwrap(), WorkerId::new(2));
//!
//! // Ids are different types - this won't compile:
//! // let wrong: weft_core::ConnectionId = ids.next_id().unwrap();
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Implemented by every typed id so allocators and stores can treat them
/// uniformly while the rest of the codebase stays strongly typed.
pub trait TypedId: Copy + Eq + Ord + fmt::Debug {
    /// Human-readable entity kind, used in error messages.
    const KIND: &'static str;

    /// Wraps a raw counter value.
    fn from_raw(raw: u64) -> Self;

    /// Returns the raw counter value.
    fn raw(self) -> u64;
}

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw id value.
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw id value.
            #[must_use]
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl TypedId for $name {
            const KIND: &'static str = $kind;

            fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.parse::<u64>().map(Self).map_err(|e| Error::InvalidId {
                    message: format!("invalid {} id '{s}': {e}", $kind),
                })
            }
        }
    };
}

define_id!(
    /// Identifies one live client session. On the wire this is the machine id:
    /// the first response on every event stream carries it.
    ConnectionId,
    "connection"
);

define_id!(
    /// Identifies a transport endpoint registered by a connection; the unit of
    /// segment placement.
    WorkerId,
    "worker"
);

define_id!(
    /// Identifies an immutable pipeline template. Shared across connections
    /// and content-addressed: structurally identical definitions collapse to
    /// one id.
    PipelineDefId,
    "pipeline definition"
);

define_id!(
    /// Identifies an immutable segment template within a pipeline definition.
    SegmentDefId,
    "segment definition"
);

define_id!(
    /// Identifies a live materialization of a pipeline definition for one
    /// connection.
    PipelineInstanceId,
    "pipeline instance"
);

define_id!(
    /// Identifies a live materialization of a segment definition on one
    /// worker.
    SegmentInstanceId,
    "segment instance"
);

define_id!(
    /// Identifies the cross-worker connector for a named port within a
    /// pipeline instance.
    ManifoldInstanceId,
    "manifold instance"
);

define_id!(
    /// Identifies a subscription-service record.
    SubscriptionServiceId,
    "subscription service"
);

/// Per-kind monotonic id counter.
///
/// The first allocated id is 1. Ids are never reused; when the counter would
/// wrap, allocation fails with [`Error::IdSpaceExhausted`] and the caller is
/// expected to treat that as fatal.
#[derive(Debug, Clone)]
pub struct IdAllocator<T: TypedId> {
    next: u64,
    _marker: PhantomData<T>,
}

impl<T: TypedId> IdAllocator<T> {
    /// Creates an allocator whose first id is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: 1,
            _marker: PhantomData,
        }
    }

    /// Allocates a fresh id, advancing the counter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdSpaceExhausted`] once the `u64` counter is spent.
    pub fn next_id(&mut self) -> Result<T> {
        if self.next == u64::MAX {
            return Err(Error::IdSpaceExhausted { kind: T::KIND });
        }
        let id = T::from_raw(self.next);
        self.next += 1;
        Ok(id)
    }

    /// Returns the id the next allocation would produce, without advancing.
    #[must_use]
    pub fn peek(&self) -> T {
        T::from_raw(self.next)
    }
}

impl<T: TypedId> Default for IdAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The placement address of a segment instance.
///
/// Packs the segment definition id into the upper 32 bits and the instance's
/// rank (its 0-based position among the workers the segment was mapped to)
/// into the lower 32 bits of one word, so workers can recover both halves
/// without a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentAddress(u64);

impl SegmentAddress {
    /// Encodes a (segment definition, rank) pair into an address word.
    #[must_use]
    pub fn encode(definition_id: SegmentDefId, rank: u32) -> Self {
        Self((definition_id.value() << 32) | u64::from(rank))
    }

    /// Returns the raw address word.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the segment definition id half of the address.
    #[must_use]
    pub const fn definition_id(self) -> SegmentDefId {
        SegmentDefId::new(self.0 >> 32)
    }

    /// Returns the rank half of the address.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn rank(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for SegmentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.definition_id(), self.rank())
    }
}
