//! # weft-core
//!
//! Core abstractions for the weft distributed dataflow control plane.
//!
//! This crate provides the foundational types used across all weft components:
//!
//! - **Identifiers**: Strongly-typed ids for connections, workers, definitions
//!   and instances, allocated from per-kind monotonic counters
//! - **Resource Lifecycle**: The totally-ordered resource status ladder shared
//!   by the wire contract and the state store
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization helpers
//!
//! ## Crate Boundary
//!
//! `weft-core` is the **only** crate allowed to define shared primitives.
//! Cross-component contracts (the wire protocol, the state store) build on the
//! types defined here.
//!
//! ## Example
//!
//! ```rust
//! use weft_core::{ConnectionId, IdAllocator};
//!
//! let mut ids: IdAllocator<ConnectionId> = IdAllocator::new();
//! let first = ids.next_id().unwrap();
//! assert_eq!(first, ConnectionId::new(1));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod resource;

pub use error::{Error, Result};
pub use id::{
    ConnectionId, IdAllocator, ManifoldInstanceId, PipelineDefId, PipelineInstanceId,
    SegmentAddress, SegmentDefId, SegmentInstanceId, SubscriptionServiceId, TypedId, WorkerId,
};
pub use observability::{init_logging, LogFormat};
pub use resource::{ResourceKind, ResourceStatus};
