//! The event envelope and its typed payloads.
//!
//! Requests flow client → server; `StreamConnected`, unary responses and
//! `ServerStateUpdate` flow server → client. The `tag` field correlates a
//! unary response with its request; stream-style events use tag 0.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use weft_core::{ResourceKind, ResourceStatus};

/// Discriminant for every message on the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Liveness probe; the server echoes the tag.
    Ping,
    /// First response on every stream; carries the machine id.
    ClientEventStreamConnected,
    /// Register N workers for the caller's connection.
    ClientUnaryRegisterWorkers,
    /// Move the referenced workers to `Activated`.
    ClientUnaryActivateStream,
    /// Materialize a pipeline definition onto the caller's workers.
    ClientUnaryRequestPipelineAssignment,
    /// Report the realized port wiring of a manifold instance.
    ClientUnaryManifoldUpdateActualAssignments,
    /// Update or create a subscription-service record.
    ClientUnaryUpdateSubscriptionService,
    /// Mark a worker `Destroyed` and remove it.
    ClientUnaryDropWorker,
    /// Monotonic status update on a named entity.
    ClientEventUpdateResourceState,
    /// Control-plane state snapshot pushed to every subscribed stream.
    ServerStateUpdate,
    /// Reserved discriminant; never dispatched. Sending it fails with
    /// `UnsupportedEvent` and the stream stays open. (A discriminant this
    /// build cannot decode at all is a transport error and drops the
    /// connection.)
    Unknown,
    /// Unary response (success or error) correlated by tag.
    Response,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ping => "ping",
            Self::ClientEventStreamConnected => "client_event_stream_connected",
            Self::ClientUnaryRegisterWorkers => "client_unary_register_workers",
            Self::ClientUnaryActivateStream => "client_unary_activate_stream",
            Self::ClientUnaryRequestPipelineAssignment => {
                "client_unary_request_pipeline_assignment"
            }
            Self::ClientUnaryManifoldUpdateActualAssignments => {
                "client_unary_manifold_update_actual_assignments"
            }
            Self::ClientUnaryUpdateSubscriptionService => {
                "client_unary_update_subscription_service"
            }
            Self::ClientUnaryDropWorker => "client_unary_drop_worker",
            Self::ClientEventUpdateResourceState => "client_event_update_resource_state",
            Self::ServerStateUpdate => "server_state_update",
            Self::Response => "response",
            Self::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Error categories reported inline on the stream.
///
/// Validation failures are recoverable: the envelope carrying one echoes the
/// request's tag and the connection stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A referenced prerequisite entity does not exist yet.
    MissingPrerequisite,
    /// An entity with this id already exists.
    DuplicateId,
    /// A status update would move an entity backward.
    InvalidTransition,
    /// Removal was attempted before the entity reached `Destroyed`.
    PrematureRemoval,
    /// No entity with this id exists.
    UnknownId,
    /// Removal would orphan a referrer.
    DanglingReference,
    /// The event type is not recognized by this server.
    UnsupportedEvent,
    /// The payload does not match the event type or fails validation.
    MalformedRequest,
    /// The request was abandoned because its stream closed.
    Cancelled,
    /// An unexpected server-side failure.
    Internal,
}

/// Inline error attached to a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Error category.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl WireError {
    /// Creates an inline error.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Liveness probe request. The response carries no payload beyond the tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {}

/// Liveness probe response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {}

/// Greeting pushed by the server as the first event on a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConnected {
    /// The connection id assigned to this stream.
    pub machine_id: u64,
}

/// Registers one worker per listed transport address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWorkersRequest {
    /// Opaque UCX worker addresses, one per worker to create.
    pub ucx_worker_addresses: Vec<Bytes>,
}

/// Ids assigned to newly registered workers, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWorkersResponse {
    /// The caller's connection id.
    pub machine_id: u64,
    /// One worker id per requested address, in order.
    pub instance_ids: Vec<u64>,
}

/// Moves the referenced workers to `Activated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateStreamRequest {
    /// Worker ids previously returned by `RegisterWorkers`.
    pub instance_ids: Vec<u64>,
}

/// Empty acknowledgement for unary requests with no result data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

/// One compute stage of a requested pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSpec {
    /// Segment name, unique within the pipeline.
    pub name: String,
    /// Port names this segment consumes.
    pub ingress_ports: Vec<String>,
    /// Port names this segment produces.
    pub egress_ports: Vec<String>,
}

/// Maps one segment onto the workers that should host instances of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMapping {
    /// Name of the segment being placed.
    pub segment_name: String,
    /// Workers to host one instance each.
    pub worker_ids: Vec<u64>,
}

/// Asks the server to materialize a pipeline onto the caller's workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineAssignmentRequest {
    /// The pipeline's segments.
    pub segments: Vec<SegmentSpec>,
    /// Placement of segments onto workers.
    pub assignments: Vec<SegmentMapping>,
}

/// Ids created (or reused, for interned definitions) by an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineAssignmentResponse {
    /// The interned pipeline definition.
    pub pipeline_definition_id: u64,
    /// The interned segment definitions, in segment order.
    pub segment_definition_ids: Vec<u64>,
    /// The live pipeline materialization for this connection.
    pub pipeline_instance_id: u64,
    /// The live segment materializations, in (mapping, worker) order.
    pub segment_instance_ids: Vec<u64>,
}

/// Reports the realized wiring of a manifold's ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifoldUpdateActualAssignmentsRequest {
    /// The manifold being updated.
    pub manifold_instance_id: u64,
    /// Segment instances now feeding the manifold.
    pub actual_input: Vec<u64>,
    /// Segment instances now consuming from the manifold.
    pub actual_output: Vec<u64>,
}

/// Updates or creates a subscription-service record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSubscriptionServiceRequest {
    /// Service name; a record is created on first use.
    pub service_name: String,
    /// Role the members participate as.
    pub role: String,
    /// Instance ids to record under the role.
    pub instance_ids: Vec<u64>,
}

/// Marks a worker `Destroyed` and removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDropRequest {
    /// The worker to drop.
    pub instance_id: u64,
}

/// Monotonic status update on a named entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResourceStateRequest {
    /// The kind of entity being updated.
    pub kind: ResourceKind,
    /// Id of the entity within its kind.
    pub instance_id: u64,
    /// The new status; must not move the entity backward.
    pub status: ResourceStatus,
}

/// A control-plane snapshot pushed to subscribers.
///
/// The snapshot body is an encoded blob rather than a typed structure so the
/// envelope stays independent of the store's types; subscribers decode it
/// with the state crate. Nonces are strictly increasing per subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    /// Monotonic version of the snapshot.
    pub nonce: u64,
    /// JSON-encoded `ControlPlaneState`.
    pub state: Bytes,
}

/// Typed payload of an [`Event`], one variant per message shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    /// Payload of [`EventType::Ping`].
    Ping(PingRequest),
    /// Payload of a ping response.
    Pong(PingResponse),
    /// Payload of [`EventType::ClientEventStreamConnected`].
    StreamConnected(StreamConnected),
    /// Payload of [`EventType::ClientUnaryRegisterWorkers`].
    RegisterWorkers(RegisterWorkersRequest),
    /// Response to a worker registration.
    RegisterWorkersResponse(RegisterWorkersResponse),
    /// Payload of [`EventType::ClientUnaryActivateStream`].
    ActivateStream(ActivateStreamRequest),
    /// Empty acknowledgement.
    Ack(Ack),
    /// Payload of [`EventType::ClientUnaryRequestPipelineAssignment`].
    PipelineAssignment(PipelineAssignmentRequest),
    /// Response to a pipeline assignment.
    PipelineAssignmentResponse(PipelineAssignmentResponse),
    /// Payload of [`EventType::ClientUnaryManifoldUpdateActualAssignments`].
    ManifoldUpdateActualAssignments(ManifoldUpdateActualAssignmentsRequest),
    /// Payload of [`EventType::ClientUnaryUpdateSubscriptionService`].
    UpdateSubscriptionService(UpdateSubscriptionServiceRequest),
    /// Payload of [`EventType::ClientUnaryDropWorker`].
    DropWorker(WorkerDropRequest),
    /// Payload of [`EventType::ClientEventUpdateResourceState`].
    UpdateResourceState(UpdateResourceStateRequest),
    /// Payload of [`EventType::ServerStateUpdate`].
    StateUpdate(StateUpdate),
}

/// The envelope shared by every message on the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Message discriminant.
    pub event: EventType,
    /// Correlates a unary response with its request; 0 for stream events.
    pub tag: u64,
    /// Typed payload; absent for bare acknowledgements and error responses.
    pub payload: Option<EventPayload>,
    /// Inline error; present exactly when the request failed.
    pub error: Option<WireError>,
}

impl Event {
    /// Creates a request or stream event with a payload and no error.
    #[must_use]
    pub fn new(event: EventType, tag: u64, payload: EventPayload) -> Self {
        Self {
            event,
            tag,
            payload: Some(payload),
            error: None,
        }
    }

    /// Creates a successful unary response correlated to `tag`.
    #[must_use]
    pub fn response(tag: u64, payload: EventPayload) -> Self {
        Self {
            event: EventType::Response,
            tag,
            payload: Some(payload),
            error: None,
        }
    }

    /// Creates an error response correlated to `tag`.
    #[must_use]
    pub fn error(tag: u64, error: WireError) -> Self {
        Self {
            event: EventType::Response,
            tag,
            payload: None,
            error: Some(error),
        }
    }

    /// Returns true if this envelope carries an inline error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_constructor_sets_tag_and_payload() {
        let event = Event::response(42, EventPayload::Ack(Ack {}));
        assert_eq!(event.event, EventType::Response);
        assert_eq!(event.tag, 42);
        assert!(!event.is_error());
    }

    #[test]
    fn error_constructor_carries_code_and_tag() {
        let event = Event::error(9, WireError::new(ErrorCode::UnknownId, "no worker 3"));
        assert!(event.is_error());
        assert_eq!(event.tag, 9);
        assert_eq!(event.error.unwrap().code, ErrorCode::UnknownId);
        assert!(event.payload.is_none());
    }

    #[test]
    fn event_type_display_is_snake_case() {
        assert_eq!(
            EventType::ClientUnaryRegisterWorkers.to_string(),
            "client_unary_register_workers"
        );
        assert_eq!(EventType::ServerStateUpdate.to_string(), "server_state_update");
    }
}
