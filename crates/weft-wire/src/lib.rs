//! # weft-wire
//!
//! The wire contract of the weft control plane.
//!
//! Every message on the bidirectional event stream shares a single envelope,
//! [`Event`]: an [`EventType`] discriminant, a correlation `tag` for unary
//! request/response exchanges nested in the stream, a typed payload, and an
//! optional error. Envelopes travel as length-prefixed MessagePack frames;
//! see [`codec`] for the framing rules.
//!
//! The encoding is opaque and only required to be self-consistent within a
//! deployment: both sides of every stream are built from this crate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod codec;
pub mod event;

pub use codec::{read_event, write_event, CodecError, MAX_FRAME_SIZE};
pub use event::{
    Ack, ActivateStreamRequest, ErrorCode, Event, EventPayload, EventType,
    ManifoldUpdateActualAssignmentsRequest, PipelineAssignmentRequest,
    PipelineAssignmentResponse, PingRequest, PingResponse, RegisterWorkersRequest,
    RegisterWorkersResponse, SegmentMapping, SegmentSpec, StateUpdate, StreamConnected,
    UpdateResourceStateRequest, UpdateSubscriptionServiceRequest, WireError, WorkerDropRequest,
};
