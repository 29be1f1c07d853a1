//! Property-based tests for weft-state invariants.
//!
//! These tests use proptest to verify the store's invariants hold across
//! randomly generated action sequences.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use proptest::prelude::*;

use weft_core::{ConnectionId, ResourceKind, ResourceStatus, WorkerId};
use weft_state::{AssignmentRequest, SegmentMapping, SegmentSpec, StateStore, StoreError};

/// Generates a random resource status.
fn arb_status() -> impl Strategy<Value = ResourceStatus> {
    prop::sample::select(vec![
        ResourceStatus::Registered,
        ResourceStatus::Activated,
        ResourceStatus::Ready,
        ResourceStatus::Running,
        ResourceStatus::Completed,
        ResourceStatus::Stopped,
        ResourceStatus::Destroyed,
    ])
}

/// Generates a random segment name.
fn arb_segment_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{2,12}".prop_map(|s| s)
}

/// One randomly chosen store action.
#[derive(Debug, Clone)]
enum Action {
    Connect,
    Disconnect(usize),
    RegisterWorkers(usize, usize),
    UpdateWorkerStatus(usize, ResourceStatus),
    DropWorker(usize),
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        2 => Just(Action::Connect),
        1 => (0usize..8).prop_map(Action::Disconnect),
        3 => ((0usize..8), (1usize..4)).prop_map(|(c, n)| Action::RegisterWorkers(c, n)),
        3 => ((0usize..16), arb_status()).prop_map(|(w, s)| Action::UpdateWorkerStatus(w, s)),
        1 => (0usize..16).prop_map(Action::DropWorker),
    ]
}

/// Applies an action, treating validation errors as no-ops and fatal errors
/// as test failures.
fn apply(store: &mut StateStore, action: &Action, connections: &mut Vec<ConnectionId>) {
    let result: Result<(), StoreError> = match action {
        Action::Connect => store.connections_add("prop-peer").map(|id| {
            connections.push(id);
        }),
        Action::Disconnect(index) => match connections.get(*index).copied() {
            Some(id) => store.connections_remove(id).map(|()| {
                connections.retain(|c| *c != id);
            }),
            None => Ok(()),
        },
        Action::RegisterWorkers(index, count) => match connections.get(*index).copied() {
            Some(id) => {
                let addresses = (0..*count).map(|i| Bytes::from(format!("ucx-{i}"))).collect();
                store.workers_add(id, addresses).map(|_| ())
            }
            None => Ok(()),
        },
        Action::UpdateWorkerStatus(raw, status) => store
            .update_resource_state(ResourceKind::Worker, *raw as u64, *status)
            .or(Ok(())),
        Action::DropWorker(raw) => {
            let id = WorkerId::new(*raw as u64);
            match store.worker(id).map(|w| w.machine_id) {
                Some(machine) => store.worker_drop(machine, id).or(Ok(())),
                None => Ok(()),
            }
        }
    };

    match result {
        Ok(()) => {}
        Err(err) if err.is_fatal() => panic!("fatal store error from {action:?}: {err}"),
        Err(_) => {}
    }
}

proptest! {
    /// INVARIANT: after every action in any sequence, the cross-slice
    /// invariants hold and the version only moves forward.
    #[test]
    fn invariants_hold_across_action_sequences(
        actions in prop::collection::vec(arb_action(), 1..40),
    ) {
        let mut store = StateStore::new();
        let mut connections = Vec::new();
        let mut last_version = store.version();

        for action in &actions {
            apply(&mut store, action, &mut connections);
            store.verify_invariants().expect("invariants violated");
            prop_assert!(store.version() >= last_version);
            last_version = store.version();
        }
    }

    /// INVARIANT: a rejected backward transition leaves the status at its
    /// prior value.
    #[test]
    fn status_updates_are_monotonic(
        first in arb_status(),
        second in arb_status(),
    ) {
        let mut store = StateStore::new();
        let machine = store.connections_add("peer").unwrap();
        let ids = store.workers_add(machine, vec![Bytes::from_static(b"a")]).unwrap();
        let raw = ids[0].value();

        store
            .update_resource_state(ResourceKind::Worker, raw, first)
            .unwrap();

        let result = store.update_resource_state(ResourceKind::Worker, raw, second);
        let status = store.worker(ids[0]).unwrap().state.status;

        if second >= first {
            prop_assert!(result.is_ok());
            prop_assert_eq!(status, second);
        } else {
            let is_invalid_transition = matches!(result, Err(StoreError::InvalidTransition { .. }));
            prop_assert!(is_invalid_transition);
            prop_assert_eq!(status, first);
        }
    }

    /// INVARIANT: removing a connection leaves nothing referring to it.
    #[test]
    fn connection_removal_leaves_no_orphans(
        worker_count in 1usize..4,
        segment_names in prop::collection::btree_set(arb_segment_name(), 2..4),
    ) {
        let names: Vec<String> = segment_names.into_iter().collect();
        let mut store = StateStore::new();
        let machine = store.connections_add("peer").unwrap();
        let addresses = (0..worker_count).map(|i| Bytes::from(format!("ucx-{i}"))).collect();
        let workers = store.workers_add(machine, addresses).unwrap();

        // Chain the segments into a linear pipeline.
        let segments: Vec<SegmentSpec> = names
            .iter()
            .enumerate()
            .map(|(i, name)| SegmentSpec {
                name: name.clone(),
                ingress_ports: if i == 0 { vec![] } else { vec![format!("edge_{i}")] },
                egress_ports: if i == names.len() - 1 {
                    vec![]
                } else {
                    vec![format!("edge_{}", i + 1)]
                },
            })
            .collect();
        let mappings = names
            .iter()
            .map(|name| SegmentMapping {
                segment_name: name.clone(),
                worker_ids: workers.clone(),
            })
            .collect();

        store
            .assign_pipeline(machine, &AssignmentRequest { segments, mappings })
            .unwrap();
        prop_assert!(!store.segment_instances().is_empty());

        store.connections_remove(machine).unwrap();

        prop_assert!(store.connections().is_empty());
        prop_assert!(store.workers().is_empty());
        prop_assert!(store.pipeline_instances().is_empty());
        prop_assert!(store.segment_instances().is_empty());
        prop_assert!(store.manifold_instances().is_empty());
        for def in store.pipeline_definitions() {
            prop_assert!(def.instance_ids.is_empty());
        }
        store.verify_invariants().expect("invariants violated after cascade");
    }

    /// INVARIANT: interning the same structural content twice returns the
    /// same id and inserts no new rows, regardless of segment order.
    #[test]
    fn definition_interning_is_idempotent(
        names in prop::collection::btree_set(arb_segment_name(), 2..5),
        shuffle_seed in 0usize..6,
    ) {
        let names: Vec<String> = names.into_iter().collect();
        let segments: Vec<SegmentSpec> = names
            .iter()
            .enumerate()
            .map(|(i, name)| SegmentSpec {
                name: name.clone(),
                ingress_ports: if i == 0 { vec![] } else { vec![format!("edge_{i}")] },
                egress_ports: if i == names.len() - 1 {
                    vec![]
                } else {
                    vec![format!("edge_{}", i + 1)]
                },
            })
            .collect();

        let mut store = StateStore::new();
        let (first_id, _) = store.pipeline_definitions_add(&segments).unwrap();
        let rows = (
            store.pipeline_definitions().len(),
            store.segment_definitions().len(),
        );

        let mut reordered = segments.clone();
        let reordered_len = reordered.len();
        reordered.rotate_left(shuffle_seed % reordered_len);
        let (second_id, _) = store.pipeline_definitions_add(&reordered).unwrap();

        prop_assert_eq!(first_id, second_id);
        prop_assert_eq!(
            rows,
            (
                store.pipeline_definitions().len(),
                store.segment_definitions().len(),
            )
        );
    }

    /// INVARIANT: snapshots taken after successive mutations carry strictly
    /// increasing nonces.
    #[test]
    fn snapshot_nonces_strictly_increase(peer_count in 1usize..6) {
        let mut store = StateStore::new();
        let mut last = store.snapshot().nonce;
        for i in 0..peer_count {
            store.connections_add(format!("peer-{i}")).unwrap();
            let nonce = store.snapshot().nonce;
            prop_assert!(nonce > last);
            last = nonce;
        }
    }
}
