//! Per-stream session handling.
//!
//! Each accepted stream gets one session task. The task:
//!
//! 1. allocates a machine id and inserts the Connection, then greets the
//!    client with `ClientEventStreamConnected`,
//! 2. spawns a writer task (sole owner of the write half, fed by an
//!    outbound queue, so responses and state updates stay FIFO) and a
//!    forwarder task pushing snapshot changes into that queue,
//! 3. reads events in arrival order and dispatches them; unary responses
//!    carry the request's tag, validation failures are returned inline and
//!    the stream stays open,
//! 4. on stream close, decode failure, or abort: removes the Connection,
//!    which cascades through workers, pipeline instances, and segment
//!    instances.
//!
//! Fatal store errors escalate to the server loop; everything else is local
//! to the stream.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use weft_core::observability::session_span;
use weft_core::{ConnectionId, ManifoldInstanceId, SegmentInstanceId, WorkerId};
use weft_state::{
    AssignmentRequest, ControlPlaneState, PlannerError, SegmentMapping, SegmentSpec, StoreError,
};
use weft_wire::{
    read_event, write_event, CodecError, ErrorCode, Event, EventPayload, EventType,
    PingResponse, RegisterWorkersResponse, StateUpdate, StreamConnected, WireError,
};

use crate::server::{AsStoreError, Shared};

/// Depth of the per-stream outbound queue.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Why a session ended, beyond a clean peer close.
#[derive(Debug, thiserror::Error)]
enum SessionError {
    /// The stream failed or sent undecodable bytes.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The store can no longer be trusted; the server is shutting down.
    #[error("fatal store failure: {0}")]
    Fatal(StoreError),

    /// The writer task went away while the session still had output.
    #[error("outbound writer closed")]
    WriterGone,
}

/// Entry point for one accepted stream.
pub(crate) async fn run(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    match drive(&shared, stream, peer).await {
        Ok(()) => {}
        Err(SessionError::Fatal(err)) => {
            tracing::error!(peer = %peer, error = %err, "session hit fatal store failure");
        }
        Err(err) => {
            tracing::debug!(peer = %peer, error = %err, "session ended with error");
        }
    }
}

async fn drive(
    shared: &Shared,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), SessionError> {
    let (mut reader, writer) = stream.into_split();

    // Every mutation here is serialized through the store lock; an error on
    // connection insert can only be fatal (id exhaustion).
    let machine_id = shared
        .mutate(|store| store.connections_add(peer.to_string()))
        .await
        .map_err(SessionError::Fatal)?;

    let (outbound_tx, outbound_rx) = mpsc::channel::<Event>(OUTBOUND_QUEUE_DEPTH);
    let writer_task = tokio::spawn(write_outbound(writer, outbound_rx));

    // The greeting must be the first response on the stream, so it enters
    // the queue before the forwarder starts pushing snapshots.
    outbound_tx
        .send(Event::new(
            EventType::ClientEventStreamConnected,
            0,
            EventPayload::StreamConnected(StreamConnected {
                machine_id: machine_id.value(),
            }),
        ))
        .await
        .map_err(|_| SessionError::WriterGone)?;

    let forwarder = tokio::spawn(forward_updates(
        shared.publisher.subscribe(),
        outbound_tx.clone(),
    ));

    let span = session_span(machine_id.value(), &peer.to_string());
    let result = read_loop(shared, machine_id, &mut reader, &outbound_tx)
        .instrument(span)
        .await;

    forwarder.abort();
    drop(outbound_tx);
    let _ = writer_task.await;

    // Stream gone, clean or not: drop the connection and cascade.
    match shared
        .mutate(|store| store.connections_remove(machine_id))
        .await
    {
        Ok(()) => {
            tracing::info!(machine_id = machine_id.value(), "connection removed");
        }
        Err(err) if err.is_fatal() => return Err(SessionError::Fatal(err)),
        Err(err) => {
            tracing::warn!(
                machine_id = machine_id.value(),
                error = %err,
                "connection cleanup failed"
            );
        }
    }

    result
}

/// Sole owner of the write half; drains the outbound queue in order.
async fn write_outbound(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        if let Err(err) = write_event(&mut writer, &event).await {
            tracing::debug!(error = %err, "outbound write failed");
            break;
        }
    }
}

/// Pushes snapshot changes into the outbound queue, starting with the
/// snapshot current at subscribe time. The watch channel coalesces: a slow
/// stream skips intermediate snapshots and jumps to the latest.
async fn forward_updates(
    mut updates: watch::Receiver<Arc<ControlPlaneState>>,
    tx: mpsc::Sender<Event>,
) {
    loop {
        let snapshot = updates.borrow_and_update().clone();
        match state_update_event(&snapshot) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::error!(error = %err, nonce = snapshot.nonce, "snapshot encode failed");
            }
        }
        if updates.changed().await.is_err() {
            break;
        }
    }
}

fn state_update_event(snapshot: &ControlPlaneState) -> Result<Event, serde_json::Error> {
    let body = serde_json::to_vec(snapshot)?;
    Ok(Event::new(
        EventType::ServerStateUpdate,
        0,
        EventPayload::StateUpdate(StateUpdate {
            nonce: snapshot.nonce,
            state: Bytes::from(body),
        }),
    ))
}

async fn read_loop(
    shared: &Shared,
    machine_id: ConnectionId,
    reader: &mut OwnedReadHalf,
    tx: &mpsc::Sender<Event>,
) -> Result<(), SessionError> {
    loop {
        match read_event(reader).await {
            Ok(Some(event)) => {
                if let Some(response) = handle_event(shared, machine_id, event).await? {
                    tx.send(response)
                        .await
                        .map_err(|_| SessionError::WriterGone)?;
                }
            }
            Ok(None) => {
                tracing::info!("stream closed by peer");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(error = %err, "stream failure; dropping connection");
                return Err(err.into());
            }
        }
    }
}

/// Dispatches one event; returns the response to queue, if any.
///
/// Validation failures come back as inline error events carrying the
/// request's tag. Only fatal store errors propagate.
async fn handle_event(
    shared: &Shared,
    machine_id: ConnectionId,
    event: Event,
) -> Result<Option<Event>, SessionError> {
    let tag = event.tag;
    let response = match event.event {
        EventType::Ping => match event.payload {
            Some(EventPayload::Ping(_)) => {
                Some(Event::response(tag, EventPayload::Pong(PingResponse {})))
            }
            _ => Some(malformed(tag, EventType::Ping)),
        },

        EventType::ClientUnaryRegisterWorkers => match event.payload {
            Some(EventPayload::RegisterWorkers(request)) => {
                let result = shared
                    .mutate(|store| store.workers_add(machine_id, request.ucx_worker_addresses))
                    .await
                    .map(|ids| {
                        EventPayload::RegisterWorkersResponse(RegisterWorkersResponse {
                            machine_id: machine_id.value(),
                            instance_ids: ids.iter().map(|id| id.value()).collect(),
                        })
                    });
                Some(finish(tag, result)?)
            }
            _ => Some(malformed(tag, EventType::ClientUnaryRegisterWorkers)),
        },

        EventType::ClientUnaryActivateStream => match event.payload {
            Some(EventPayload::ActivateStream(request)) => {
                let ids: Vec<WorkerId> = request
                    .instance_ids
                    .iter()
                    .copied()
                    .map(WorkerId::new)
                    .collect();
                let result = shared
                    .mutate(|store| store.workers_activate(machine_id, &ids))
                    .await
                    .map(|()| EventPayload::Ack(weft_wire::Ack {}));
                Some(finish(tag, result)?)
            }
            _ => Some(malformed(tag, EventType::ClientUnaryActivateStream)),
        },

        EventType::ClientUnaryRequestPipelineAssignment => match event.payload {
            Some(EventPayload::PipelineAssignment(request)) => {
                let planner_request = to_planner_request(&request);
                let result = shared
                    .mutate(|store| store.assign_pipeline(machine_id, &planner_request))
                    .await
                    .map(|outcome| {
                        EventPayload::PipelineAssignmentResponse(
                            weft_wire::PipelineAssignmentResponse {
                                pipeline_definition_id: outcome.pipeline_definition_id.value(),
                                segment_definition_ids: outcome
                                    .segment_definition_ids
                                    .iter()
                                    .map(|id| id.value())
                                    .collect(),
                                pipeline_instance_id: outcome.pipeline_instance_id.value(),
                                segment_instance_ids: outcome
                                    .segment_instance_ids
                                    .iter()
                                    .map(|id| id.value())
                                    .collect(),
                            },
                        )
                    });
                Some(finish(tag, result)?)
            }
            _ => Some(malformed(tag, EventType::ClientUnaryRequestPipelineAssignment)),
        },

        EventType::ClientUnaryManifoldUpdateActualAssignments => match event.payload {
            Some(EventPayload::ManifoldUpdateActualAssignments(request)) => {
                let input: Vec<SegmentInstanceId> = request
                    .actual_input
                    .iter()
                    .copied()
                    .map(SegmentInstanceId::new)
                    .collect();
                let output: Vec<SegmentInstanceId> = request
                    .actual_output
                    .iter()
                    .copied()
                    .map(SegmentInstanceId::new)
                    .collect();
                let result = shared
                    .mutate(|store| {
                        store.manifold_set_actuals(
                            ManifoldInstanceId::new(request.manifold_instance_id),
                            input,
                            output,
                        )
                    })
                    .await
                    .map(|()| EventPayload::Ack(weft_wire::Ack {}));
                Some(finish(tag, result)?)
            }
            _ => Some(malformed(
                tag,
                EventType::ClientUnaryManifoldUpdateActualAssignments,
            )),
        },

        EventType::ClientUnaryUpdateSubscriptionService => match event.payload {
            Some(EventPayload::UpdateSubscriptionService(request)) => {
                let result = shared
                    .mutate(|store| {
                        store.subscription_service_update(
                            request.service_name,
                            request.role,
                            request.instance_ids,
                        )
                    })
                    .await
                    .map(|_| EventPayload::Ack(weft_wire::Ack {}));
                Some(finish(tag, result)?)
            }
            _ => Some(malformed(tag, EventType::ClientUnaryUpdateSubscriptionService)),
        },

        EventType::ClientUnaryDropWorker => match event.payload {
            Some(EventPayload::DropWorker(request)) => {
                let result = shared
                    .mutate(|store| {
                        store.worker_drop(machine_id, WorkerId::new(request.instance_id))
                    })
                    .await
                    .map(|()| EventPayload::Ack(weft_wire::Ack {}));
                Some(finish(tag, result)?)
            }
            _ => Some(malformed(tag, EventType::ClientUnaryDropWorker)),
        },

        EventType::ClientEventUpdateResourceState => match event.payload {
            Some(EventPayload::UpdateResourceState(request)) => {
                let result = shared
                    .mutate(|store| {
                        store.update_resource_state(
                            request.kind,
                            request.instance_id,
                            request.status,
                        )
                    })
                    .await;
                match result {
                    // Stream-style events (tag 0) are not acknowledged; the
                    // state-update broadcast carries the effect.
                    Ok(()) if tag == 0 => None,
                    Ok(()) => Some(Event::response(tag, EventPayload::Ack(weft_wire::Ack {}))),
                    Err(err) => Some(finish(tag, Err::<EventPayload, _>(err))?),
                }
            }
            _ => Some(malformed(tag, EventType::ClientEventUpdateResourceState)),
        },

        EventType::ClientEventStreamConnected
        | EventType::ServerStateUpdate
        | EventType::Response
        | EventType::Unknown => Some(Event::error(
            tag,
            WireError::new(
                ErrorCode::UnsupportedEvent,
                format!("event type '{}' is not accepted by the server", event.event),
            ),
        )),
    };
    Ok(response)
}

fn to_planner_request(request: &weft_wire::PipelineAssignmentRequest) -> AssignmentRequest {
    AssignmentRequest {
        segments: request
            .segments
            .iter()
            .map(|segment| SegmentSpec {
                name: segment.name.clone(),
                ingress_ports: segment.ingress_ports.clone(),
                egress_ports: segment.egress_ports.clone(),
            })
            .collect(),
        mappings: request
            .assignments
            .iter()
            .map(|mapping| SegmentMapping {
                segment_name: mapping.segment_name.clone(),
                worker_ids: mapping.worker_ids.iter().copied().map(WorkerId::new).collect(),
            })
            .collect(),
    }
}

/// Turns a handler outcome into the unary response, escalating fatal store
/// errors to end the session.
fn finish(
    tag: u64,
    result: Result<EventPayload, impl HandlerError>,
) -> Result<Event, SessionError> {
    match result {
        Ok(payload) => Ok(Event::response(tag, payload)),
        Err(err) => {
            if let Some(store_err) = err.as_store_error() {
                if store_err.is_fatal() {
                    return Err(SessionError::Fatal(store_err.clone()));
                }
            }
            Ok(Event::error(tag, err.to_wire_error()))
        }
    }
}

fn malformed(tag: u64, event_type: EventType) -> Event {
    Event::error(
        tag,
        WireError::new(
            ErrorCode::MalformedRequest,
            format!("payload does not match event type '{event_type}'"),
        ),
    )
}

/// Store and planner errors both map onto the wire taxonomy.
trait HandlerError: AsStoreError {
    fn to_wire_error(&self) -> WireError;
}

impl HandlerError for StoreError {
    fn to_wire_error(&self) -> WireError {
        WireError::new(store_error_code(self), self.to_string())
    }
}

impl HandlerError for PlannerError {
    fn to_wire_error(&self) -> WireError {
        let code = match self {
            PlannerError::UnknownWorker { .. } => ErrorCode::UnknownId,
            PlannerError::ForeignWorker { .. } => ErrorCode::MissingPrerequisite,
            PlannerError::Store(err) => store_error_code(err),
            _ => ErrorCode::MalformedRequest,
        };
        WireError::new(code, self.to_string())
    }
}

fn store_error_code(err: &StoreError) -> ErrorCode {
    match err {
        StoreError::MissingPrerequisite { .. } => ErrorCode::MissingPrerequisite,
        StoreError::DuplicateId { .. } => ErrorCode::DuplicateId,
        StoreError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
        StoreError::PrematureRemoval { .. } => ErrorCode::PrematureRemoval,
        StoreError::UnknownId { .. } => ErrorCode::UnknownId,
        StoreError::DanglingReference { .. } => ErrorCode::DanglingReference,
        StoreError::IdExhausted { .. } | StoreError::InvariantViolation { .. } => {
            ErrorCode::Internal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{ResourceKind, ResourceStatus};

    #[test]
    fn store_errors_map_onto_wire_codes() {
        assert_eq!(
            store_error_code(&StoreError::missing_prerequisite("x")),
            ErrorCode::MissingPrerequisite
        );
        assert_eq!(
            store_error_code(&StoreError::UnknownId { kind: "worker", id: 1 }),
            ErrorCode::UnknownId
        );
        assert_eq!(
            store_error_code(&StoreError::InvalidTransition {
                kind: ResourceKind::Worker,
                id: 1,
                from: ResourceStatus::Ready,
                to: ResourceStatus::Registered,
            }),
            ErrorCode::InvalidTransition
        );
        assert_eq!(
            store_error_code(&StoreError::invariant("broken")),
            ErrorCode::Internal
        );
    }

    #[test]
    fn planner_errors_map_onto_wire_codes() {
        assert_eq!(
            PlannerError::UnknownWorker {
                id: WorkerId::new(9)
            }
            .to_wire_error()
            .code,
            ErrorCode::UnknownId
        );
        assert_eq!(
            PlannerError::EmptyPipeline.to_wire_error().code,
            ErrorCode::MalformedRequest
        );
        assert_eq!(
            PlannerError::Store(StoreError::missing_prerequisite("x"))
                .to_wire_error()
                .code,
            ErrorCode::MissingPrerequisite
        );
    }
}
