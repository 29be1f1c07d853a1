//! The entities tracked by the control plane.
//!
//! Forward and back references between entities are ids, never pointers
//! (arena-and-index); the store keeps both sides consistent within a single
//! mutation. Definitions are immutable and shared across connections; live
//! entities are owned, transitively, by exactly one connection.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_core::{
    ConnectionId, ManifoldInstanceId, PipelineDefId, PipelineInstanceId, ResourceStatus,
    SegmentAddress, SegmentDefId, SegmentInstanceId, SubscriptionServiceId, WorkerId,
};

/// Lifecycle state carried by every live entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    /// Current position on the status ladder.
    pub status: ResourceStatus,
    /// Count of external holders pinning the entity.
    pub ref_count: u64,
}

impl ResourceState {
    /// A freshly registered entity with no holders.
    #[must_use]
    pub const fn registered() -> Self {
        Self {
            status: ResourceStatus::Registered,
            ref_count: 0,
        }
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::registered()
    }
}

/// One live client session, pinned to one event stream.
///
/// Owns its workers and, transitively through them, its pipeline and segment
/// instances. Created when the stream opens; removing it cascades through
/// every descendant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Connection id; the machine id on the wire.
    pub id: ConnectionId,
    /// Remote peer, for logs and debugging.
    pub peer_info: String,
    /// Workers hosted by this client.
    pub worker_ids: Vec<WorkerId>,
    /// Pipeline instances assigned to this client.
    pub assigned_pipeline_ids: Vec<PipelineInstanceId>,
    /// When the stream was accepted.
    pub registered_at: DateTime<Utc>,
}

impl Connection {
    /// Creates a connection record for a newly accepted stream.
    #[must_use]
    pub fn new(id: ConnectionId, peer_info: impl Into<String>) -> Self {
        Self {
            id,
            peer_info: peer_info.into(),
            worker_ids: Vec::new(),
            assigned_pipeline_ids: Vec::new(),
            registered_at: Utc::now(),
        }
    }
}

/// A transport endpoint registered by a connection; the unit of segment
/// placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// Worker id.
    pub id: WorkerId,
    /// Owning connection.
    pub machine_id: ConnectionId,
    /// Opaque UCX endpoint address.
    pub ucx_address: Bytes,
    /// Lifecycle state.
    pub state: ResourceState,
    /// Segment instances placed on this worker.
    pub assigned_segment_ids: Vec<SegmentInstanceId>,
    /// When the worker was registered.
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// Creates a registered worker owned by `machine_id`.
    #[must_use]
    pub fn new(id: WorkerId, machine_id: ConnectionId, ucx_address: Bytes) -> Self {
        Self {
            id,
            machine_id,
            ucx_address,
            state: ResourceState::registered(),
            assigned_segment_ids: Vec::new(),
            registered_at: Utc::now(),
        }
    }
}

/// An immutable pipeline template.
///
/// Content-addressed: two definitions with identical structure collapse to
/// one id. Not owned by any connection; lives until explicitly removed,
/// which requires that no instance refers to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    /// Definition id.
    pub id: PipelineDefId,
    /// Hex digest of the structural content; the interning key.
    pub structural_hash: String,
    /// Segment definitions, in the order the pipeline was described.
    pub segment_ids: Vec<SegmentDefId>,
    /// Distinct manifold port names, sorted.
    pub port_names: Vec<String>,
    /// Live instances materialized from this definition.
    pub instance_ids: Vec<PipelineInstanceId>,
}

/// An immutable segment template within a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDefinition {
    /// Segment definition id.
    pub id: SegmentDefId,
    /// The pipeline definition this segment belongs to.
    pub parent_pipeline_id: PipelineDefId,
    /// Segment name, unique within the pipeline.
    pub name: String,
    /// Port names this segment consumes.
    pub ingress_ports: Vec<String>,
    /// Port names this segment produces.
    pub egress_ports: Vec<String>,
    /// Live instances materialized from this definition.
    pub instance_ids: Vec<SegmentInstanceId>,
}

/// A live materialization of a pipeline definition for one connection.
///
/// At most one exists per (definition, connection) pair; its lifecycle is
/// bound to the owning connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInstance {
    /// Instance id.
    pub id: PipelineInstanceId,
    /// The definition this instance materializes.
    pub definition_id: PipelineDefId,
    /// Owning connection.
    pub machine_id: ConnectionId,
    /// Segment instances belonging to this pipeline.
    pub segment_ids: Vec<SegmentInstanceId>,
    /// Manifold instances belonging to this pipeline.
    pub manifold_ids: Vec<ManifoldInstanceId>,
    /// Lifecycle state.
    pub state: ResourceState,
    /// When the instance was created.
    pub registered_at: DateTime<Utc>,
}

impl PipelineInstance {
    /// Creates a registered instance of `definition_id` for `machine_id`.
    #[must_use]
    pub fn new(
        id: PipelineInstanceId,
        definition_id: PipelineDefId,
        machine_id: ConnectionId,
    ) -> Self {
        Self {
            id,
            definition_id,
            machine_id,
            segment_ids: Vec::new(),
            manifold_ids: Vec::new(),
            state: ResourceState::registered(),
            registered_at: Utc::now(),
        }
    }
}

/// A live materialization of a segment definition on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentInstance {
    /// Instance id.
    pub id: SegmentInstanceId,
    /// The segment definition this instance materializes.
    pub definition_id: SegmentDefId,
    /// The pipeline instance this segment belongs to.
    pub pipeline_instance_id: PipelineInstanceId,
    /// The worker hosting this instance.
    pub worker_id: WorkerId,
    /// Segment name, copied from the definition for convenience.
    pub name: String,
    /// Encoded (definition, rank) placement address.
    pub address: SegmentAddress,
    /// Lifecycle state.
    pub state: ResourceState,
    /// When the instance was created.
    pub registered_at: DateTime<Utc>,
}

/// The cross-worker connector for one named port within a pipeline instance.
///
/// The planner fills the `requested` sides from the definition graph; the
/// `actual` sides start empty and are reported by workers once the wiring is
/// realized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifoldInstance {
    /// Manifold id.
    pub id: ManifoldInstanceId,
    /// The port this manifold connects.
    pub port_name: String,
    /// The pipeline instance this manifold belongs to.
    pub pipeline_instance_id: PipelineInstanceId,
    /// Segment instances expected to feed the manifold.
    pub requested_input: Vec<SegmentInstanceId>,
    /// Segment instances expected to consume from the manifold.
    pub requested_output: Vec<SegmentInstanceId>,
    /// Segment instances actually feeding the manifold.
    pub actual_input: Vec<SegmentInstanceId>,
    /// Segment instances actually consuming from the manifold.
    pub actual_output: Vec<SegmentInstanceId>,
    /// Lifecycle state.
    pub state: ResourceState,
    /// When the manifold was created.
    pub registered_at: DateTime<Utc>,
}

/// A subscription-service record.
///
/// Keyed by name; the first update creates the record and later updates
/// merge members into roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionService {
    /// Record id.
    pub id: SubscriptionServiceId,
    /// Service name; the lookup key.
    pub name: String,
    /// Member instance ids per role, deduplicated and sorted.
    pub roles: BTreeMap<String, Vec<u64>>,
    /// When the record was created.
    pub registered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_state_defaults_to_registered() {
        let state = ResourceState::default();
        assert_eq!(state.status, ResourceStatus::Registered);
        assert_eq!(state.ref_count, 0);
    }

    #[test]
    fn connection_starts_with_no_descendants() {
        let conn = Connection::new(ConnectionId::new(1), "127.0.0.1:4000");
        assert!(conn.worker_ids.is_empty());
        assert!(conn.assigned_pipeline_ids.is_empty());
    }

    #[test]
    fn worker_starts_registered() {
        let worker = Worker::new(
            WorkerId::new(1),
            ConnectionId::new(1),
            Bytes::from_static(b"ucx"),
        );
        assert_eq!(worker.state.status, ResourceStatus::Registered);
        assert!(worker.assigned_segment_ids.is_empty());
    }

    #[test]
    fn entities_serialize_camel_case() {
        let conn = Connection::new(ConnectionId::new(1), "peer");
        let json = serde_json::to_value(&conn).unwrap();
        assert!(json.get("workerIds").is_some());
        assert!(json.get("assignedPipelineIds").is_some());
    }
}
