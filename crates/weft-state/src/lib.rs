//! # weft-state
//!
//! The authoritative data model of the weft control plane.
//!
//! This crate implements the state domain, providing:
//!
//! - **State Store**: Typed slices for connections, workers, pipeline and
//!   segment definitions, pipeline/segment/manifold instances, and
//!   subscription services
//! - **Reducers**: Validated, atomic mutations with cascading lifecycles
//! - **Selectors**: Read-only queries over the slices
//! - **Assignment Planner**: Materializes a pipeline definition plus a
//!   segment-to-worker mapping into concrete instances
//! - **Snapshots**: Immutable, versioned projections for broadcast
//!
//! ## Guarantees
//!
//! - **Atomic**: Every mutation either fully applies or leaves the store
//!   untouched; observers see pre-state or fully-reconciled post-state
//! - **Monotonic**: Entity status only moves forward; the store version and
//!   snapshot nonce strictly increase
//! - **Consistent**: The cross-slice invariants are re-verified after every
//!   mutation batch; a violation is fatal by contract
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use weft_state::StateStore;
//!
//! # fn main() -> Result<(), weft_state::StoreError> {
//! let mut store = StateStore::new();
//! let machine = store.connections_add("127.0.0.1:50051")?;
//! let workers = store.workers_add(machine, vec![Bytes::from_static(b"ucx-addr")])?;
//! assert_eq!(workers.len(), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod objects;
pub mod planner;
pub mod snapshot;
pub mod store;

pub use error::{Result, StoreError};
pub use objects::{
    Connection, ManifoldInstance, PipelineDefinition, PipelineInstance, ResourceState,
    SegmentDefinition, SegmentInstance, SubscriptionService, Worker,
};
pub use planner::{
    AssignmentOutcome, AssignmentRequest, PlannerError, SegmentMapping, SegmentSpec,
};
pub use snapshot::ControlPlaneState;
pub use store::StateStore;
