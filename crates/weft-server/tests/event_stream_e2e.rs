//! End-to-end scenarios: a real server on an ephemeral port, driven by a
//! framed test client over TCP. State assertions go through the same
//! `ServerStateUpdate` broadcast real clients consume.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use weft_core::{ResourceKind, ResourceStatus};
use weft_server::Server;
use weft_state::ControlPlaneState;
use weft_wire::{
    read_event, write_event, ActivateStreamRequest, ErrorCode, Event, EventPayload, EventType,
    ManifoldUpdateActualAssignmentsRequest, PipelineAssignmentRequest, PingRequest,
    RegisterWorkersRequest, SegmentMapping, SegmentSpec, StateUpdate,
    UpdateResourceStateRequest, UpdateSubscriptionServiceRequest, WorkerDropRequest,
};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> SocketAddr {
    let server = Server::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = server.local_addr();
    tokio::spawn(server.run());
    addr
}

struct TestClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    machine_id: u64,
    last_nonce: Option<u64>,
}

impl TestClient {
    /// Connects and consumes the `ClientEventStreamConnected` greeting.
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        let (mut reader, writer) = stream.into_split();
        let greeting = timeout(WAIT, read_event(&mut reader))
            .await
            .expect("timed out waiting for greeting")
            .expect("greeting read failed")
            .expect("stream closed before greeting");
        assert_eq!(greeting.event, EventType::ClientEventStreamConnected);
        assert_eq!(greeting.tag, 0);
        let machine_id = match greeting.payload {
            Some(EventPayload::StreamConnected(payload)) => payload.machine_id,
            other => panic!("unexpected greeting payload: {other:?}"),
        };
        Self {
            reader,
            writer,
            machine_id,
            last_nonce: None,
        }
    }

    async fn send(&mut self, event: Event) {
        write_event(&mut self.writer, &event)
            .await
            .expect("write failed");
    }

    async fn recv(&mut self) -> Event {
        timeout(WAIT, read_event(&mut self.reader))
            .await
            .expect("timed out waiting for event")
            .expect("read failed")
            .expect("stream closed")
    }

    /// Reads until the unary response correlated to `tag`, skipping state
    /// updates.
    async fn recv_response(&mut self, tag: u64) -> Event {
        loop {
            let event = self.recv().await;
            if event.event == EventType::Response && event.tag == tag {
                return event;
            }
        }
    }

    async fn unary(&mut self, event: Event) -> Event {
        let tag = event.tag;
        self.send(event).await;
        self.recv_response(tag).await
    }

    /// Reads state updates until one satisfies `predicate`, checking nonce
    /// monotonicity along the way.
    async fn wait_for_state(
        &mut self,
        predicate: impl Fn(&ControlPlaneState) -> bool,
    ) -> ControlPlaneState {
        loop {
            let event = self.recv().await;
            if event.event != EventType::ServerStateUpdate {
                continue;
            }
            let Some(EventPayload::StateUpdate(StateUpdate { nonce, state })) = event.payload
            else {
                panic!("state update without payload");
            };
            let state: ControlPlaneState =
                serde_json::from_slice(&state).expect("snapshot decode failed");
            assert_eq!(state.nonce, nonce);
            if let Some(last) = self.last_nonce {
                assert!(nonce > last, "nonce went backward: {last} -> {nonce}");
            }
            self.last_nonce = Some(nonce);
            if predicate(&state) {
                return state;
            }
        }
    }

    async fn register_workers(&mut self, addresses: &[&str], tag: u64) -> Vec<u64> {
        let response = self
            .unary(Event::new(
                EventType::ClientUnaryRegisterWorkers,
                tag,
                EventPayload::RegisterWorkers(RegisterWorkersRequest {
                    ucx_worker_addresses: addresses
                        .iter()
                        .map(|a| Bytes::copy_from_slice(a.as_bytes()))
                        .collect(),
                }),
            ))
            .await;
        match response.payload {
            Some(EventPayload::RegisterWorkersResponse(payload)) => {
                assert_eq!(payload.machine_id, self.machine_id);
                payload.instance_ids
            }
            other => panic!("unexpected register response: {other:?}"),
        }
    }
}

fn two_segment_assignment(worker_ids: &[u64]) -> PipelineAssignmentRequest {
    PipelineAssignmentRequest {
        segments: vec![
            SegmentSpec {
                name: "my_seg".into(),
                ingress_ports: vec![],
                egress_ports: vec!["port_x".into()],
            },
            SegmentSpec {
                name: "my_seg2".into(),
                ingress_ports: vec!["port_x".into()],
                egress_ports: vec![],
            },
        ],
        assignments: vec![
            SegmentMapping {
                segment_name: "my_seg".into(),
                worker_ids: worker_ids.to_vec(),
            },
            SegmentMapping {
                segment_name: "my_seg2".into(),
                worker_ids: worker_ids.to_vec(),
            },
        ],
    }
}

#[tokio::test]
async fn connect_assigns_machine_id_one() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    assert_eq!(client.machine_id, 1);

    let state = client
        .wait_for_state(|state| state.connections.len() == 1)
        .await;
    assert!(state.connections.contains_key(&1));
    assert!(state.workers.is_empty());
}

#[tokio::test]
async fn register_workers_returns_dense_instance_ids() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;

    let ids = client.register_workers(&["a", "b"], 9876).await;
    assert_eq!(ids, vec![1, 2]);

    let state = client
        .wait_for_state(|state| state.workers.len() == 2)
        .await;
    for worker in state.workers.values() {
        assert_eq!(worker.machine_id.value(), 1);
        assert_eq!(worker.state.status, ResourceStatus::Registered);
    }
}

#[tokio::test]
async fn activate_stream_moves_workers_to_activated() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    let ids = client.register_workers(&["a", "b"], 1).await;

    let response = client
        .unary(Event::new(
            EventType::ClientUnaryActivateStream,
            2,
            EventPayload::ActivateStream(ActivateStreamRequest { instance_ids: ids }),
        ))
        .await;
    assert!(matches!(response.payload, Some(EventPayload::Ack(_))));

    client
        .wait_for_state(|state| {
            state.workers.len() == 2
                && state
                    .workers
                    .values()
                    .all(|w| w.state.status == ResourceStatus::Activated)
        })
        .await;
}

#[tokio::test]
async fn pipeline_assignment_materializes_two_by_two() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    let ids = client.register_workers(&["a", "b"], 1).await;

    let response = client
        .unary(Event::new(
            EventType::ClientUnaryRequestPipelineAssignment,
            3,
            EventPayload::PipelineAssignment(two_segment_assignment(&ids)),
        ))
        .await;
    let assignment = match response.payload {
        Some(EventPayload::PipelineAssignmentResponse(payload)) => payload,
        other => panic!("unexpected assignment response: {other:?}"),
    };
    assert_eq!(assignment.pipeline_definition_id, 1);
    assert_eq!(assignment.segment_definition_ids, vec![1, 2]);
    assert_eq!(assignment.pipeline_instance_id, 1);
    assert_eq!(assignment.segment_instance_ids, vec![1, 2, 3, 4]);

    let state = client
        .wait_for_state(|state| state.segment_instances.len() == 4)
        .await;
    assert_eq!(state.pipeline_definitions.len(), 1);
    assert_eq!(state.segment_definitions.len(), 2);
    assert_eq!(state.pipeline_instances.len(), 1);
    assert_eq!(state.manifold_instances.len(), 1);
    for segment in state.segment_instances.values() {
        assert_eq!(segment.state.status, ResourceStatus::Registered);
    }
}

#[tokio::test]
async fn stream_abort_cascades_but_definitions_survive() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    let ids = client.register_workers(&["a", "b"], 1).await;
    client
        .unary(Event::new(
            EventType::ClientUnaryRequestPipelineAssignment,
            2,
            EventPayload::PipelineAssignment(two_segment_assignment(&ids)),
        ))
        .await;

    let mut observer = TestClient::connect(addr).await;
    observer
        .wait_for_state(|state| state.segment_instances.len() == 4)
        .await;

    drop(client);

    let state = observer
        .wait_for_state(|state| state.connections.len() == 1 && state.workers.is_empty())
        .await;
    assert!(state.connections.contains_key(&observer.machine_id));
    assert!(state.pipeline_instances.is_empty());
    assert!(state.segment_instances.is_empty());
    assert!(state.manifold_instances.is_empty());
    assert_eq!(state.pipeline_definitions.len(), 1);
    for def in state.pipeline_definitions.values() {
        assert!(def.instance_ids.is_empty());
    }
    for def in state.segment_definitions.values() {
        assert!(def.instance_ids.is_empty());
    }
}

#[tokio::test]
async fn concurrent_clients_share_one_definition() {
    let addr = start_server().await;
    let mut client_a = TestClient::connect(addr).await;
    let mut client_b = TestClient::connect(addr).await;

    let ids_a = client_a.register_workers(&["a"], 1).await;
    let ids_b = client_b.register_workers(&["b"], 1).await;

    let (response_a, response_b) = tokio::join!(
        client_a.unary(Event::new(
            EventType::ClientUnaryRequestPipelineAssignment,
            10,
            EventPayload::PipelineAssignment(two_segment_assignment(&ids_a)),
        )),
        client_b.unary(Event::new(
            EventType::ClientUnaryRequestPipelineAssignment,
            11,
            EventPayload::PipelineAssignment(two_segment_assignment(&ids_b)),
        )),
    );
    assert!(!response_a.is_error());
    assert!(!response_b.is_error());

    let state = client_a
        .wait_for_state(|state| state.pipeline_instances.len() == 2)
        .await;
    assert_eq!(state.pipeline_definitions.len(), 1);
    let machines: std::collections::BTreeSet<u64> = state
        .pipeline_instances
        .values()
        .map(|i| i.machine_id.value())
        .collect();
    assert_eq!(machines.len(), 2);
}

#[tokio::test]
async fn ping_echoes_tag() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;

    let response = client
        .unary(Event::new(
            EventType::Ping,
            424_242,
            EventPayload::Ping(PingRequest {}),
        ))
        .await;
    assert_eq!(response.tag, 424_242);
    assert!(!response.is_error());
}

#[tokio::test]
async fn unsupported_event_reports_error_and_keeps_stream_open() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;

    let response = client
        .unary(Event::new(
            EventType::ServerStateUpdate,
            77,
            EventPayload::StateUpdate(StateUpdate {
                nonce: 0,
                state: Bytes::new(),
            }),
        ))
        .await;
    assert_eq!(response.error.as_ref().unwrap().code, ErrorCode::UnsupportedEvent);
    assert_eq!(response.tag, 77);

    // The connection survives the rejection.
    let pong = client
        .unary(Event::new(EventType::Ping, 78, EventPayload::Ping(PingRequest {})))
        .await;
    assert!(!pong.is_error());
}

#[tokio::test]
async fn validation_error_keeps_connection_open() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;

    let response = client
        .unary(Event::new(
            EventType::ClientUnaryActivateStream,
            5,
            EventPayload::ActivateStream(ActivateStreamRequest {
                instance_ids: vec![99],
            }),
        ))
        .await;
    assert_eq!(response.error.as_ref().unwrap().code, ErrorCode::UnknownId);

    let pong = client
        .unary(Event::new(EventType::Ping, 6, EventPayload::Ping(PingRequest {})))
        .await;
    assert!(!pong.is_error());
}

#[tokio::test]
async fn resource_state_event_flows_through_broadcast() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    let ids = client.register_workers(&["a"], 1).await;

    // Stream-style update: tag 0, no acknowledgement expected.
    client
        .send(Event::new(
            EventType::ClientEventUpdateResourceState,
            0,
            EventPayload::UpdateResourceState(UpdateResourceStateRequest {
                kind: ResourceKind::Worker,
                instance_id: ids[0],
                status: ResourceStatus::Ready,
            }),
        ))
        .await;
    client
        .wait_for_state(|state| {
            state
                .workers
                .values()
                .any(|w| w.state.status == ResourceStatus::Ready)
        })
        .await;

    // A backward transition is rejected inline with the request's tag.
    let response = client
        .unary(Event::new(
            EventType::ClientEventUpdateResourceState,
            9,
            EventPayload::UpdateResourceState(UpdateResourceStateRequest {
                kind: ResourceKind::Worker,
                instance_id: ids[0],
                status: ResourceStatus::Registered,
            }),
        ))
        .await;
    assert_eq!(
        response.error.as_ref().unwrap().code,
        ErrorCode::InvalidTransition
    );
}

#[tokio::test]
async fn drop_worker_removes_it_from_state() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    let ids = client.register_workers(&["a", "b"], 1).await;

    let response = client
        .unary(Event::new(
            EventType::ClientUnaryDropWorker,
            4,
            EventPayload::DropWorker(WorkerDropRequest {
                instance_id: ids[0],
            }),
        ))
        .await;
    assert!(matches!(response.payload, Some(EventPayload::Ack(_))));

    let state = client
        .wait_for_state(|state| state.workers.len() == 1)
        .await;
    assert!(state.workers.contains_key(&ids[1]));
}

#[tokio::test]
async fn manifold_actuals_round_trip_through_state() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    let ids = client.register_workers(&["a", "b"], 1).await;
    let response = client
        .unary(Event::new(
            EventType::ClientUnaryRequestPipelineAssignment,
            2,
            EventPayload::PipelineAssignment(two_segment_assignment(&ids)),
        ))
        .await;
    let assignment = match response.payload {
        Some(EventPayload::PipelineAssignmentResponse(payload)) => payload,
        other => panic!("unexpected assignment response: {other:?}"),
    };

    let state = client
        .wait_for_state(|state| state.manifold_instances.len() == 1)
        .await;
    let manifold_id = *state.manifold_instances.keys().next().unwrap();

    let ack = client
        .unary(Event::new(
            EventType::ClientUnaryManifoldUpdateActualAssignments,
            3,
            EventPayload::ManifoldUpdateActualAssignments(
                ManifoldUpdateActualAssignmentsRequest {
                    manifold_instance_id: manifold_id,
                    actual_input: assignment.segment_instance_ids[..2].to_vec(),
                    actual_output: assignment.segment_instance_ids[2..].to_vec(),
                },
            ),
        ))
        .await;
    assert!(matches!(ack.payload, Some(EventPayload::Ack(_))));

    let state = client
        .wait_for_state(|state| {
            state
                .manifold_instances
                .values()
                .any(|m| !m.actual_input.is_empty())
        })
        .await;
    let manifold = state.manifold_instances.values().next().unwrap();
    assert_eq!(manifold.actual_input.len(), 2);
    assert_eq!(manifold.actual_output.len(), 2);
}

#[tokio::test]
async fn subscription_service_updates_merge() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    let ids = client.register_workers(&["a", "b"], 1).await;

    for (tag, id) in ids.iter().enumerate() {
        let ack = client
            .unary(Event::new(
                EventType::ClientUnaryUpdateSubscriptionService,
                100 + tag as u64,
                EventPayload::UpdateSubscriptionService(UpdateSubscriptionServiceRequest {
                    service_name: "data_plane".into(),
                    role: "publisher".into(),
                    instance_ids: vec![*id],
                }),
            ))
            .await;
        assert!(matches!(ack.payload, Some(EventPayload::Ack(_))));
    }

    let state = client
        .wait_for_state(|state| {
            state
                .subscription_services
                .values()
                .any(|s| s.roles.get("publisher").is_some_and(|m| m.len() == 2))
        })
        .await;
    let service = state.subscription_services.values().next().unwrap();
    assert_eq!(service.name, "data_plane");
}
