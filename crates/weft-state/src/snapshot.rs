//! Immutable control-plane snapshots.
//!
//! A snapshot is a projection over every store slice plus the store version
//! as its `nonce`. Snapshots are built under the write lock, so the store's
//! cross-slice invariants hold within any snapshot a subscriber receives;
//! slices are keyed by raw id in ordered maps so serialized snapshots are
//! stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::objects::{
    Connection, ManifoldInstance, PipelineDefinition, PipelineInstance, SegmentDefinition,
    SegmentInstance, SubscriptionService, Worker,
};
use crate::store::StateStore;

/// A versioned, self-consistent copy of the whole control-plane state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneState {
    /// Monotonic snapshot version; strictly increases across publishes.
    pub nonce: u64,
    /// Live connections by id.
    pub connections: BTreeMap<u64, Connection>,
    /// Registered workers by id.
    pub workers: BTreeMap<u64, Worker>,
    /// Interned pipeline definitions by id.
    pub pipeline_definitions: BTreeMap<u64, PipelineDefinition>,
    /// Interned segment definitions by id.
    pub segment_definitions: BTreeMap<u64, SegmentDefinition>,
    /// Live pipeline instances by id.
    pub pipeline_instances: BTreeMap<u64, PipelineInstance>,
    /// Live segment instances by id.
    pub segment_instances: BTreeMap<u64, SegmentInstance>,
    /// Live manifold instances by id.
    pub manifold_instances: BTreeMap<u64, ManifoldInstance>,
    /// Subscription-service records by id.
    pub subscription_services: BTreeMap<u64, SubscriptionService>,
}

impl StateStore {
    /// Builds an immutable snapshot of the current state.
    ///
    /// The snapshot's `nonce` is the store version at the time of the call.
    #[must_use]
    pub fn snapshot(&self) -> ControlPlaneState {
        ControlPlaneState {
            nonce: self.version(),
            connections: self
                .connections()
                .into_iter()
                .map(|c| (c.id.value(), c.clone()))
                .collect(),
            workers: self
                .workers()
                .into_iter()
                .map(|w| (w.id.value(), w.clone()))
                .collect(),
            pipeline_definitions: self
                .pipeline_definitions()
                .into_iter()
                .map(|d| (d.id.value(), d.clone()))
                .collect(),
            segment_definitions: self
                .segment_definitions()
                .into_iter()
                .map(|d| (d.id.value(), d.clone()))
                .collect(),
            pipeline_instances: self
                .pipeline_instances()
                .into_iter()
                .map(|i| (i.id.value(), i.clone()))
                .collect(),
            segment_instances: self
                .segment_instances()
                .into_iter()
                .map(|i| (i.id.value(), i.clone()))
                .collect(),
            manifold_instances: self
                .manifold_instances()
                .into_iter()
                .map(|i| (i.id.value(), i.clone()))
                .collect(),
            subscription_services: self
                .subscription_services()
                .into_iter()
                .map(|s| (s.id.value(), s.clone()))
                .collect(),
        }
    }
}
