//! The authoritative state store.
//!
//! Sole owner of the data model. Every mutating operation:
//!
//! 1. validates against the current state (foreign keys, status gates),
//! 2. applies on a scratch copy, so a failed validation leaves the store
//!    untouched and observers see pre-state or fully-reconciled post-state,
//! 3. re-verifies the cross-slice invariants,
//! 4. commits with exactly one version bump per batch.
//!
//! Selectors are pure reads. Invariant failures are fatal by contract: the
//! caller is expected to log and terminate rather than serve from a store it
//! can no longer trust.

use std::collections::HashMap;

use bytes::Bytes;

use weft_core::id::TypedId;
use weft_core::{
    ConnectionId, IdAllocator, ManifoldInstanceId, PipelineDefId, PipelineInstanceId,
    ResourceKind, ResourceStatus, SegmentAddress, SegmentDefId, SegmentInstanceId,
    SubscriptionServiceId, WorkerId,
};

use crate::error::{Result, StoreError};
use crate::objects::{
    Connection, ManifoldInstance, PipelineDefinition, PipelineInstance, ResourceState,
    SegmentDefinition, SegmentInstance, SubscriptionService, Worker,
};

/// The in-memory control-plane store.
///
/// One instance is the single logical authority for a cluster. It is not
/// internally synchronized; callers serialize mutations (the server wraps it
/// in a mutex so only one mutation runs at a time).
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    pub(crate) connections: HashMap<ConnectionId, Connection>,
    pub(crate) workers: HashMap<WorkerId, Worker>,
    pub(crate) pipeline_definitions: HashMap<PipelineDefId, PipelineDefinition>,
    pub(crate) segment_definitions: HashMap<SegmentDefId, SegmentDefinition>,
    pub(crate) pipeline_instances: HashMap<PipelineInstanceId, PipelineInstance>,
    pub(crate) segment_instances: HashMap<SegmentInstanceId, SegmentInstance>,
    pub(crate) manifold_instances: HashMap<ManifoldInstanceId, ManifoldInstance>,
    pub(crate) subscription_services: HashMap<SubscriptionServiceId, SubscriptionService>,

    /// Structural hash -> interned definition.
    pub(crate) definitions_by_hash: HashMap<String, PipelineDefId>,

    pub(crate) connection_ids: IdAllocator<ConnectionId>,
    pub(crate) worker_ids: IdAllocator<WorkerId>,
    pub(crate) pipeline_def_ids: IdAllocator<PipelineDefId>,
    pub(crate) segment_def_ids: IdAllocator<SegmentDefId>,
    pub(crate) pipeline_instance_ids: IdAllocator<PipelineInstanceId>,
    pub(crate) segment_instance_ids: IdAllocator<SegmentInstanceId>,
    pub(crate) manifold_instance_ids: IdAllocator<ManifoldInstanceId>,
    pub(crate) subscription_service_ids: IdAllocator<SubscriptionServiceId>,

    pub(crate) version: u64,
}

impl StateStore {
    /// Creates an empty store at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The store version; bumped once per successful mutation batch.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Runs one mutation batch atomically.
    ///
    /// The batch executes on a scratch copy; on success the copy replaces
    /// the live state with one version bump and the invariants re-verified.
    /// On any error the live state is untouched.
    pub(crate) fn commit<T>(&mut self, work: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mut next = self.clone();
        let out = work(&mut next)?;
        next.version = self
            .version
            .checked_add(1)
            .ok_or(StoreError::IdExhausted { kind: "version" })?;
        next.verify_invariants()?;
        *self = next;
        Ok(out)
    }

    // --- Connections ---

    /// Inserts a connection for a newly accepted stream and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IdExhausted`] once the connection counter is
    /// spent.
    pub fn connections_add(&mut self, peer_info: impl Into<String>) -> Result<ConnectionId> {
        let peer_info = peer_info.into();
        self.commit(|store| {
            let id = store.connection_ids.next_id()?;
            store.connections.insert(id, Connection::new(id, peer_info));
            Ok(id)
        })
    }

    /// Removes a connection and every entity it transitively owns.
    ///
    /// Workers, pipeline instances, segment instances, and manifolds owned
    /// by the connection are removed regardless of status — stream closure
    /// is the teardown signal. Definitions survive; their back-reference
    /// lists are pruned. Subscription-service members that referred to the
    /// removed workers are pruned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownId`] if no such connection exists.
    pub fn connections_remove(&mut self, id: ConnectionId) -> Result<()> {
        self.commit(|store| store.connections_remove_in(id))
    }

    pub(crate) fn connections_remove_in(&mut self, id: ConnectionId) -> Result<()> {
        let conn = self
            .connections
            .remove(&id)
            .ok_or(StoreError::UnknownId {
                kind: "connection",
                id: id.value(),
            })?;

        for pipeline_id in &conn.assigned_pipeline_ids {
            let Some(instance) = self.pipeline_instances.remove(pipeline_id) else {
                return Err(StoreError::invariant(format!(
                    "connection {id} lists pipeline instance {pipeline_id} which does not exist"
                )));
            };
            for segment_id in &instance.segment_ids {
                if let Some(segment) = self.segment_instances.remove(segment_id) {
                    if let Some(def) = self.segment_definitions.get_mut(&segment.definition_id)
                    {
                        def.instance_ids.retain(|sid| sid != segment_id);
                    }
                }
            }
            for manifold_id in &instance.manifold_ids {
                self.manifold_instances.remove(manifold_id);
            }
            if let Some(def) = self.pipeline_definitions.get_mut(&instance.definition_id) {
                def.instance_ids.retain(|pid| pid != pipeline_id);
            }
        }

        for worker_id in &conn.worker_ids {
            self.workers.remove(worker_id);
            self.prune_subscription_members(worker_id.value());
        }

        tracing::debug!(
            connection = id.value(),
            workers = conn.worker_ids.len(),
            pipelines = conn.assigned_pipeline_ids.len(),
            "connection cascade complete"
        );
        Ok(())
    }

    // --- Workers ---

    /// Registers one worker per listed transport address, all owned by
    /// `machine_id`. Ids are returned in request order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingPrerequisite`] if the connection does
    /// not exist.
    pub fn workers_add(
        &mut self,
        machine_id: ConnectionId,
        ucx_addresses: Vec<Bytes>,
    ) -> Result<Vec<WorkerId>> {
        self.commit(|store| {
            if !store.connections.contains_key(&machine_id) {
                return Err(StoreError::missing_prerequisite(format!(
                    "cannot register workers: connection {machine_id} does not exist"
                )));
            }
            let mut ids = Vec::with_capacity(ucx_addresses.len());
            for address in ucx_addresses {
                let id = store.worker_ids.next_id()?;
                store
                    .workers
                    .insert(id, Worker::new(id, machine_id, address));
                store
                    .connections
                    .get_mut(&machine_id)
                    .ok_or(StoreError::UnknownId {
                        kind: "connection",
                        id: machine_id.value(),
                    })?
                    .worker_ids
                    .push(id);
                ids.push(id);
            }
            Ok(ids)
        })
    }

    /// Moves the referenced workers to `Activated`, in one batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownId`] for an unregistered worker,
    /// [`StoreError::MissingPrerequisite`] for a worker owned by a different
    /// connection, and [`StoreError::InvalidTransition`] for a worker that
    /// already moved past `Activated`. Re-activation is an idempotent
    /// success.
    pub fn workers_activate(
        &mut self,
        machine_id: ConnectionId,
        worker_ids: &[WorkerId],
    ) -> Result<()> {
        self.commit(|store| {
            for worker_id in worker_ids {
                let worker =
                    store
                        .workers
                        .get_mut(worker_id)
                        .ok_or(StoreError::UnknownId {
                            kind: "worker",
                            id: worker_id.value(),
                        })?;
                if worker.machine_id != machine_id {
                    return Err(StoreError::missing_prerequisite(format!(
                        "worker {worker_id} is not registered to connection {machine_id}"
                    )));
                }
                advance(
                    &mut worker.state,
                    ResourceKind::Worker,
                    worker_id.value(),
                    ResourceStatus::Activated,
                )?;
            }
            Ok(())
        })
    }

    /// Marks a worker `Destroyed` and removes it, in one batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownId`] if the worker does not exist,
    /// [`StoreError::MissingPrerequisite`] if it is owned by a different
    /// connection, and [`StoreError::DanglingReference`] if segment
    /// instances are still placed on it.
    pub fn worker_drop(&mut self, machine_id: ConnectionId, worker_id: WorkerId) -> Result<()> {
        self.commit(|store| {
            let worker = store
                .workers
                .get_mut(&worker_id)
                .ok_or(StoreError::UnknownId {
                    kind: "worker",
                    id: worker_id.value(),
                })?;
            if worker.machine_id != machine_id {
                return Err(StoreError::missing_prerequisite(format!(
                    "worker {worker_id} is not registered to connection {machine_id}"
                )));
            }
            advance(
                &mut worker.state,
                ResourceKind::Worker,
                worker_id.value(),
                ResourceStatus::Destroyed,
            )?;
            store.workers_remove_in(worker_id)
        })
    }

    /// Removes a worker that has reached `Destroyed`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownId`] if the worker does not exist,
    /// [`StoreError::PrematureRemoval`] if it is not `Destroyed`, and
    /// [`StoreError::DanglingReference`] if segment instances still refer
    /// to it.
    pub fn workers_remove(&mut self, worker_id: WorkerId) -> Result<()> {
        self.commit(|store| store.workers_remove_in(worker_id))
    }

    pub(crate) fn workers_remove_in(&mut self, worker_id: WorkerId) -> Result<()> {
        let worker = self.workers.get(&worker_id).ok_or(StoreError::UnknownId {
            kind: "worker",
            id: worker_id.value(),
        })?;
        if !worker.state.status.is_destroyed() {
            return Err(StoreError::PrematureRemoval {
                kind: ResourceKind::Worker,
                id: worker_id.value(),
                status: worker.state.status,
            });
        }
        if !worker.assigned_segment_ids.is_empty() {
            return Err(StoreError::dangling(format!(
                "worker {worker_id} still hosts {} segment instance(s)",
                worker.assigned_segment_ids.len()
            )));
        }
        let machine_id = worker.machine_id;
        self.workers.remove(&worker_id);
        if let Some(conn) = self.connections.get_mut(&machine_id) {
            conn.worker_ids.retain(|wid| *wid != worker_id);
        }
        self.prune_subscription_members(worker_id.value());
        Ok(())
    }

    // --- Pipeline instances ---

    /// Creates a pipeline instance of `definition_id` owned by `machine_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingPrerequisite`] if the definition or the
    /// connection does not exist, and [`StoreError::DuplicateId`] if the
    /// (definition, connection) pair already has an instance.
    pub fn pipeline_instances_add(
        &mut self,
        definition_id: PipelineDefId,
        machine_id: ConnectionId,
    ) -> Result<PipelineInstanceId> {
        self.commit(|store| store.pipeline_instances_add_in(definition_id, machine_id))
    }

    pub(crate) fn pipeline_instances_add_in(
        &mut self,
        definition_id: PipelineDefId,
        machine_id: ConnectionId,
    ) -> Result<PipelineInstanceId> {
        if !self.pipeline_definitions.contains_key(&definition_id) {
            return Err(StoreError::missing_prerequisite(format!(
                "pipeline definition {definition_id} does not exist"
            )));
        }
        if !self.connections.contains_key(&machine_id) {
            return Err(StoreError::missing_prerequisite(format!(
                "connection {machine_id} does not exist"
            )));
        }
        if self
            .find_pipeline_instance(definition_id, machine_id)
            .is_some()
        {
            return Err(StoreError::duplicate(format!(
                "connection {machine_id} already has an instance of pipeline definition {definition_id}"
            )));
        }

        let id = self.pipeline_instance_ids.next_id()?;
        self.pipeline_instances
            .insert(id, PipelineInstance::new(id, definition_id, machine_id));
        if let Some(def) = self.pipeline_definitions.get_mut(&definition_id) {
            def.instance_ids.push(id);
        }
        if let Some(conn) = self.connections.get_mut(&machine_id) {
            conn.assigned_pipeline_ids.push(id);
        }
        Ok(id)
    }

    /// Removes a pipeline instance that has reached `Destroyed`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownId`], [`StoreError::PrematureRemoval`],
    /// or [`StoreError::DanglingReference`] if segment or manifold
    /// instances still belong to it.
    pub fn pipeline_instances_remove(&mut self, id: PipelineInstanceId) -> Result<()> {
        self.commit(|store| {
            let instance =
                store
                    .pipeline_instances
                    .get(&id)
                    .ok_or(StoreError::UnknownId {
                        kind: "pipeline instance",
                        id: id.value(),
                    })?;
            if !instance.state.status.is_destroyed() {
                return Err(StoreError::PrematureRemoval {
                    kind: ResourceKind::PipelineInstance,
                    id: id.value(),
                    status: instance.state.status,
                });
            }
            if !instance.segment_ids.is_empty() {
                return Err(StoreError::dangling(format!(
                    "pipeline instance {id} still owns {} segment instance(s)",
                    instance.segment_ids.len()
                )));
            }
            if !instance.manifold_ids.is_empty() {
                return Err(StoreError::dangling(format!(
                    "pipeline instance {id} still owns {} manifold instance(s)",
                    instance.manifold_ids.len()
                )));
            }
            let definition_id = instance.definition_id;
            let machine_id = instance.machine_id;
            store.pipeline_instances.remove(&id);
            if let Some(def) = store.pipeline_definitions.get_mut(&definition_id) {
                def.instance_ids.retain(|pid| *pid != id);
            }
            if let Some(conn) = store.connections.get_mut(&machine_id) {
                conn.assigned_pipeline_ids.retain(|pid| *pid != id);
            }
            Ok(())
        })
    }

    // --- Segment instances ---

    /// Creates a segment instance of `definition_id` on `worker_id` within
    /// `pipeline_instance_id`, at the given rank.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingPrerequisite`] if the worker, pipeline
    /// instance, segment definition, or its parent pipeline definition does
    /// not exist, or if the worker belongs to a different connection than
    /// the pipeline instance.
    pub fn segment_instances_add(
        &mut self,
        definition_id: SegmentDefId,
        pipeline_instance_id: PipelineInstanceId,
        worker_id: WorkerId,
        rank: u32,
    ) -> Result<SegmentInstanceId> {
        self.commit(|store| {
            store.segment_instances_add_in(definition_id, pipeline_instance_id, worker_id, rank)
        })
    }

    pub(crate) fn segment_instances_add_in(
        &mut self,
        definition_id: SegmentDefId,
        pipeline_instance_id: PipelineInstanceId,
        worker_id: WorkerId,
        rank: u32,
    ) -> Result<SegmentInstanceId> {
        let Some(worker) = self.workers.get(&worker_id) else {
            return Err(StoreError::missing_prerequisite(format!(
                "worker {worker_id} does not exist"
            )));
        };
        let Some(pipeline) = self.pipeline_instances.get(&pipeline_instance_id) else {
            return Err(StoreError::missing_prerequisite(format!(
                "pipeline instance {pipeline_instance_id} does not exist"
            )));
        };
        let Some(definition) = self.segment_definitions.get(&definition_id) else {
            return Err(StoreError::missing_prerequisite(format!(
                "segment definition {definition_id} does not exist"
            )));
        };
        if !self
            .pipeline_definitions
            .contains_key(&definition.parent_pipeline_id)
        {
            return Err(StoreError::missing_prerequisite(format!(
                "pipeline definition {} does not exist",
                definition.parent_pipeline_id
            )));
        }
        if worker.machine_id != pipeline.machine_id {
            return Err(StoreError::missing_prerequisite(format!(
                "worker {worker_id} belongs to connection {} but pipeline instance {pipeline_instance_id} belongs to connection {}",
                worker.machine_id, pipeline.machine_id
            )));
        }
        let name = definition.name.clone();

        let id = self.segment_instance_ids.next_id()?;
        self.segment_instances.insert(
            id,
            SegmentInstance {
                id,
                definition_id,
                pipeline_instance_id,
                worker_id,
                name,
                address: SegmentAddress::encode(definition_id, rank),
                state: ResourceState::registered(),
                registered_at: chrono::Utc::now(),
            },
        );
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.assigned_segment_ids.push(id);
        }
        if let Some(pipeline) = self.pipeline_instances.get_mut(&pipeline_instance_id) {
            pipeline.segment_ids.push(id);
        }
        if let Some(definition) = self.segment_definitions.get_mut(&definition_id) {
            definition.instance_ids.push(id);
        }
        Ok(id)
    }

    /// Removes a segment instance that has reached `Destroyed`.
    ///
    /// Back-references on its worker, pipeline instance, and segment
    /// definition are pruned, as are manifold lists that still name it —
    /// a manifold adapts to losing a requested or actual endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownId`] or [`StoreError::PrematureRemoval`].
    pub fn segment_instances_remove(&mut self, id: SegmentInstanceId) -> Result<()> {
        self.commit(|store| {
            let instance = store
                .segment_instances
                .get(&id)
                .ok_or(StoreError::UnknownId {
                    kind: "segment instance",
                    id: id.value(),
                })?;
            if !instance.state.status.is_destroyed() {
                return Err(StoreError::PrematureRemoval {
                    kind: ResourceKind::SegmentInstance,
                    id: id.value(),
                    status: instance.state.status,
                });
            }
            let worker_id = instance.worker_id;
            let pipeline_id = instance.pipeline_instance_id;
            let definition_id = instance.definition_id;
            store.segment_instances.remove(&id);
            if let Some(worker) = store.workers.get_mut(&worker_id) {
                worker.assigned_segment_ids.retain(|sid| *sid != id);
            }
            if let Some(pipeline) = store.pipeline_instances.get_mut(&pipeline_id) {
                pipeline.segment_ids.retain(|sid| *sid != id);
            }
            if let Some(definition) = store.segment_definitions.get_mut(&definition_id) {
                definition.instance_ids.retain(|sid| *sid != id);
            }
            for manifold in store.manifold_instances.values_mut() {
                manifold.requested_input.retain(|sid| *sid != id);
                manifold.requested_output.retain(|sid| *sid != id);
                manifold.actual_input.retain(|sid| *sid != id);
                manifold.actual_output.retain(|sid| *sid != id);
            }
            Ok(())
        })
    }

    // --- Manifold instances ---

    /// Records the realized wiring of a manifold's ports.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownId`] if the manifold does not exist and
    /// [`StoreError::MissingPrerequisite`] if any referenced segment
    /// instance does not.
    pub fn manifold_set_actuals(
        &mut self,
        id: ManifoldInstanceId,
        actual_input: Vec<SegmentInstanceId>,
        actual_output: Vec<SegmentInstanceId>,
    ) -> Result<()> {
        self.commit(|store| {
            if !store.manifold_instances.contains_key(&id) {
                return Err(StoreError::UnknownId {
                    kind: "manifold instance",
                    id: id.value(),
                });
            }
            for segment_id in actual_input.iter().chain(actual_output.iter()) {
                if !store.segment_instances.contains_key(segment_id) {
                    return Err(StoreError::missing_prerequisite(format!(
                        "segment instance {segment_id} does not exist"
                    )));
                }
            }
            let manifold = store
                .manifold_instances
                .get_mut(&id)
                .ok_or(StoreError::UnknownId {
                    kind: "manifold instance",
                    id: id.value(),
                })?;
            manifold.actual_input = actual_input;
            manifold.actual_output = actual_output;
            Ok(())
        })
    }

    /// Removes a manifold instance that has reached `Destroyed`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownId`] or [`StoreError::PrematureRemoval`].
    pub fn manifold_instances_remove(&mut self, id: ManifoldInstanceId) -> Result<()> {
        self.commit(|store| {
            let manifold = store
                .manifold_instances
                .get(&id)
                .ok_or(StoreError::UnknownId {
                    kind: "manifold instance",
                    id: id.value(),
                })?;
            if !manifold.state.status.is_destroyed() {
                return Err(StoreError::PrematureRemoval {
                    kind: ResourceKind::ManifoldInstance,
                    id: id.value(),
                    status: manifold.state.status,
                });
            }
            let pipeline_id = manifold.pipeline_instance_id;
            store.manifold_instances.remove(&id);
            if let Some(pipeline) = store.pipeline_instances.get_mut(&pipeline_id) {
                pipeline.manifold_ids.retain(|mid| *mid != id);
            }
            Ok(())
        })
    }

    // --- Pipeline definitions ---

    /// Removes a pipeline definition and its segment definitions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownId`] if the definition does not exist
    /// and [`StoreError::DanglingReference`] while any live instance still
    /// refers to the definition or one of its segments.
    pub fn pipeline_definitions_remove(&mut self, id: PipelineDefId) -> Result<()> {
        self.commit(|store| {
            let definition =
                store
                    .pipeline_definitions
                    .get(&id)
                    .ok_or(StoreError::UnknownId {
                        kind: "pipeline definition",
                        id: id.value(),
                    })?;
            if !definition.instance_ids.is_empty() {
                return Err(StoreError::dangling(format!(
                    "pipeline definition {id} still has {} live instance(s)",
                    definition.instance_ids.len()
                )));
            }
            for segment_id in &definition.segment_ids {
                if let Some(segment) = store.segment_definitions.get(segment_id) {
                    if !segment.instance_ids.is_empty() {
                        return Err(StoreError::dangling(format!(
                            "segment definition {segment_id} still has {} live instance(s)",
                            segment.instance_ids.len()
                        )));
                    }
                }
            }
            let segment_ids = definition.segment_ids.clone();
            let hash = definition.structural_hash.clone();
            store.pipeline_definitions.remove(&id);
            for segment_id in segment_ids {
                store.segment_definitions.remove(&segment_id);
            }
            store.definitions_by_hash.remove(&hash);
            Ok(())
        })
    }

    // --- Status updates ---

    /// Applies a monotonic status update to the named entity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownId`] if no entity of the kind has this
    /// id and [`StoreError::InvalidTransition`] if the update would move
    /// the entity backward.
    pub fn update_resource_state(
        &mut self,
        kind: ResourceKind,
        id: u64,
        status: ResourceStatus,
    ) -> Result<()> {
        self.commit(|store| {
            let state = match kind {
                ResourceKind::Worker => {
                    &mut store
                        .workers
                        .get_mut(&WorkerId::new(id))
                        .ok_or(StoreError::UnknownId { kind: "worker", id })?
                        .state
                }
                ResourceKind::PipelineInstance => {
                    &mut store
                        .pipeline_instances
                        .get_mut(&PipelineInstanceId::new(id))
                        .ok_or(StoreError::UnknownId {
                            kind: "pipeline instance",
                            id,
                        })?
                        .state
                }
                ResourceKind::SegmentInstance => {
                    &mut store
                        .segment_instances
                        .get_mut(&SegmentInstanceId::new(id))
                        .ok_or(StoreError::UnknownId {
                            kind: "segment instance",
                            id,
                        })?
                        .state
                }
                ResourceKind::ManifoldInstance => {
                    &mut store
                        .manifold_instances
                        .get_mut(&ManifoldInstanceId::new(id))
                        .ok_or(StoreError::UnknownId {
                            kind: "manifold instance",
                            id,
                        })?
                        .state
                }
            };
            advance(state, kind, id, status)
        })
    }

    // --- Subscription services ---

    /// Updates or creates the subscription-service record named
    /// `service_name`, merging `members` into `role`.
    ///
    /// Members are deduplicated and kept sorted. Returns the record's id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IdExhausted`] once the record counter is spent.
    pub fn subscription_service_update(
        &mut self,
        service_name: impl Into<String>,
        role: impl Into<String>,
        members: Vec<u64>,
    ) -> Result<SubscriptionServiceId> {
        let service_name = service_name.into();
        let role = role.into();
        self.commit(|store| {
            let existing = store
                .subscription_services
                .values()
                .find(|service| service.name == service_name)
                .map(|service| service.id);
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = store.subscription_service_ids.next_id()?;
                    store.subscription_services.insert(
                        id,
                        SubscriptionService {
                            id,
                            name: service_name,
                            roles: std::collections::BTreeMap::new(),
                            registered_at: chrono::Utc::now(),
                        },
                    );
                    id
                }
            };
            let service =
                store
                    .subscription_services
                    .get_mut(&id)
                    .ok_or(StoreError::UnknownId {
                        kind: "subscription service",
                        id: id.value(),
                    })?;
            let entry = service.roles.entry(role).or_default();
            entry.extend(members);
            entry.sort_unstable();
            entry.dedup();
            Ok(id)
        })
    }

    pub(crate) fn prune_subscription_members(&mut self, member: u64) {
        for service in self.subscription_services.values_mut() {
            for members in service.roles.values_mut() {
                members.retain(|m| *m != member);
            }
        }
    }

    // --- Selectors ---

    /// Looks up a connection by id.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// All connections, sorted by id.
    #[must_use]
    pub fn connections(&self) -> Vec<&Connection> {
        sorted_by_id(self.connections.values(), |c| c.id.value())
    }

    /// Looks up a worker by id.
    #[must_use]
    pub fn worker(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.get(&id)
    }

    /// All workers, sorted by id.
    #[must_use]
    pub fn workers(&self) -> Vec<&Worker> {
        sorted_by_id(self.workers.values(), |w| w.id.value())
    }

    /// Looks up the listed workers; fails on the first missing id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownId`] for the first id not in the store.
    pub fn workers_by_ids(&self, ids: &[WorkerId]) -> Result<Vec<&Worker>> {
        ids.iter()
            .map(|id| {
                self.workers.get(id).ok_or(StoreError::UnknownId {
                    kind: "worker",
                    id: id.value(),
                })
            })
            .collect()
    }

    /// Looks up a pipeline definition by id.
    #[must_use]
    pub fn pipeline_definition(&self, id: PipelineDefId) -> Option<&PipelineDefinition> {
        self.pipeline_definitions.get(&id)
    }

    /// All pipeline definitions, sorted by id.
    #[must_use]
    pub fn pipeline_definitions(&self) -> Vec<&PipelineDefinition> {
        sorted_by_id(self.pipeline_definitions.values(), |d| d.id.value())
    }

    /// Looks up a segment definition by id.
    #[must_use]
    pub fn segment_definition(&self, id: SegmentDefId) -> Option<&SegmentDefinition> {
        self.segment_definitions.get(&id)
    }

    /// All segment definitions, sorted by id.
    #[must_use]
    pub fn segment_definitions(&self) -> Vec<&SegmentDefinition> {
        sorted_by_id(self.segment_definitions.values(), |d| d.id.value())
    }

    /// Looks up a pipeline instance by id.
    #[must_use]
    pub fn pipeline_instance(&self, id: PipelineInstanceId) -> Option<&PipelineInstance> {
        self.pipeline_instances.get(&id)
    }

    /// All pipeline instances, sorted by id.
    #[must_use]
    pub fn pipeline_instances(&self) -> Vec<&PipelineInstance> {
        sorted_by_id(self.pipeline_instances.values(), |i| i.id.value())
    }

    /// The live instance of (definition, connection), if one exists.
    #[must_use]
    pub fn find_pipeline_instance(
        &self,
        definition_id: PipelineDefId,
        machine_id: ConnectionId,
    ) -> Option<&PipelineInstance> {
        self.pipeline_instances
            .values()
            .find(|i| i.definition_id == definition_id && i.machine_id == machine_id)
    }

    /// Looks up a segment instance by id.
    #[must_use]
    pub fn segment_instance(&self, id: SegmentInstanceId) -> Option<&SegmentInstance> {
        self.segment_instances.get(&id)
    }

    /// All segment instances, sorted by id.
    #[must_use]
    pub fn segment_instances(&self) -> Vec<&SegmentInstance> {
        sorted_by_id(self.segment_instances.values(), |i| i.id.value())
    }

    /// Looks up a manifold instance by id.
    #[must_use]
    pub fn manifold_instance(&self, id: ManifoldInstanceId) -> Option<&ManifoldInstance> {
        self.manifold_instances.get(&id)
    }

    /// All manifold instances, sorted by id.
    #[must_use]
    pub fn manifold_instances(&self) -> Vec<&ManifoldInstance> {
        sorted_by_id(self.manifold_instances.values(), |i| i.id.value())
    }

    /// Looks up a subscription service by name.
    #[must_use]
    pub fn subscription_service_by_name(&self, name: &str) -> Option<&SubscriptionService> {
        self.subscription_services
            .values()
            .find(|service| service.name == name)
    }

    /// All subscription services, sorted by id.
    #[must_use]
    pub fn subscription_services(&self) -> Vec<&SubscriptionService> {
        sorted_by_id(self.subscription_services.values(), |s| s.id.value())
    }

    // --- Invariants ---

    /// Verifies the cross-slice invariants.
    ///
    /// Run automatically after every mutation batch. A failure here means a
    /// reducer bug; the server treats it as fatal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvariantViolation`] naming the first breach.
    pub fn verify_invariants(&self) -> Result<()> {
        // Ownership chains resolve (invariants 1-3).
        for worker in self.workers.values() {
            let conn = self.connections.get(&worker.machine_id).ok_or_else(|| {
                StoreError::invariant(format!(
                    "worker {} is owned by missing connection {}",
                    worker.id, worker.machine_id
                ))
            })?;
            if !conn.worker_ids.contains(&worker.id) {
                return Err(StoreError::invariant(format!(
                    "connection {} does not list its worker {}",
                    conn.id, worker.id
                )));
            }
        }
        for instance in self.pipeline_instances.values() {
            let conn = self.connections.get(&instance.machine_id).ok_or_else(|| {
                StoreError::invariant(format!(
                    "pipeline instance {} is owned by missing connection {}",
                    instance.id, instance.machine_id
                ))
            })?;
            if !conn.assigned_pipeline_ids.contains(&instance.id) {
                return Err(StoreError::invariant(format!(
                    "connection {} does not list its pipeline instance {}",
                    conn.id, instance.id
                )));
            }
            let def = self
                .pipeline_definitions
                .get(&instance.definition_id)
                .ok_or_else(|| {
                    StoreError::invariant(format!(
                        "pipeline instance {} refers to missing definition {}",
                        instance.id, instance.definition_id
                    ))
                })?;
            if !def.instance_ids.contains(&instance.id) {
                return Err(StoreError::invariant(format!(
                    "pipeline definition {} does not list its instance {}",
                    def.id, instance.id
                )));
            }
        }
        for segment in self.segment_instances.values() {
            let worker = self.workers.get(&segment.worker_id).ok_or_else(|| {
                StoreError::invariant(format!(
                    "segment instance {} is placed on missing worker {}",
                    segment.id, segment.worker_id
                ))
            })?;
            let pipeline = self
                .pipeline_instances
                .get(&segment.pipeline_instance_id)
                .ok_or_else(|| {
                    StoreError::invariant(format!(
                        "segment instance {} belongs to missing pipeline instance {}",
                        segment.id, segment.pipeline_instance_id
                    ))
                })?;
            // Invariant 2: co-ownership of worker and pipeline instance.
            if worker.machine_id != pipeline.machine_id {
                return Err(StoreError::invariant(format!(
                    "segment instance {} spans connections: worker {} is owned by {} but pipeline instance {} by {}",
                    segment.id, worker.id, worker.machine_id, pipeline.id, pipeline.machine_id
                )));
            }
            let def = self
                .segment_definitions
                .get(&segment.definition_id)
                .ok_or_else(|| {
                    StoreError::invariant(format!(
                        "segment instance {} refers to missing segment definition {}",
                        segment.id, segment.definition_id
                    ))
                })?;
            if !self
                .pipeline_definitions
                .contains_key(&def.parent_pipeline_id)
            {
                return Err(StoreError::invariant(format!(
                    "segment definition {} refers to missing pipeline definition {}",
                    def.id, def.parent_pipeline_id
                )));
            }
            if !worker.assigned_segment_ids.contains(&segment.id) {
                return Err(StoreError::invariant(format!(
                    "worker {} does not list its segment instance {}",
                    worker.id, segment.id
                )));
            }
            if !pipeline.segment_ids.contains(&segment.id) {
                return Err(StoreError::invariant(format!(
                    "pipeline instance {} does not list its segment instance {}",
                    pipeline.id, segment.id
                )));
            }
            if !def.instance_ids.contains(&segment.id) {
                return Err(StoreError::invariant(format!(
                    "segment definition {} does not list its instance {}",
                    def.id, segment.id
                )));
            }
        }
        for manifold in self.manifold_instances.values() {
            let pipeline = self
                .pipeline_instances
                .get(&manifold.pipeline_instance_id)
                .ok_or_else(|| {
                    StoreError::invariant(format!(
                        "manifold instance {} belongs to missing pipeline instance {}",
                        manifold.id, manifold.pipeline_instance_id
                    ))
                })?;
            if !pipeline.manifold_ids.contains(&manifold.id) {
                return Err(StoreError::invariant(format!(
                    "pipeline instance {} does not list its manifold instance {}",
                    pipeline.id, manifold.id
                )));
            }
            for segment_id in manifold
                .requested_input
                .iter()
                .chain(&manifold.requested_output)
                .chain(&manifold.actual_input)
                .chain(&manifold.actual_output)
            {
                if !self.segment_instances.contains_key(segment_id) {
                    return Err(StoreError::invariant(format!(
                        "manifold instance {} refers to missing segment instance {segment_id}",
                        manifold.id
                    )));
                }
            }
        }

        // Back-reference lists resolve forward (invariant 4).
        for conn in self.connections.values() {
            for worker_id in &conn.worker_ids {
                if !self.workers.contains_key(worker_id) {
                    return Err(StoreError::invariant(format!(
                        "connection {} lists missing worker {worker_id}",
                        conn.id
                    )));
                }
            }
            for pipeline_id in &conn.assigned_pipeline_ids {
                if !self.pipeline_instances.contains_key(pipeline_id) {
                    return Err(StoreError::invariant(format!(
                        "connection {} lists missing pipeline instance {pipeline_id}",
                        conn.id
                    )));
                }
            }
        }
        for def in self.pipeline_definitions.values() {
            for segment_id in &def.segment_ids {
                let segment = self.segment_definitions.get(segment_id).ok_or_else(|| {
                    StoreError::invariant(format!(
                        "pipeline definition {} lists missing segment definition {segment_id}",
                        def.id
                    ))
                })?;
                if segment.parent_pipeline_id != def.id {
                    return Err(StoreError::invariant(format!(
                        "segment definition {} has parent {} but is listed by pipeline definition {}",
                        segment.id, segment.parent_pipeline_id, def.id
                    )));
                }
            }
            for instance_id in &def.instance_ids {
                if !self.pipeline_instances.contains_key(instance_id) {
                    return Err(StoreError::invariant(format!(
                        "pipeline definition {} lists missing instance {instance_id}",
                        def.id
                    )));
                }
            }
        }
        for def in self.segment_definitions.values() {
            for instance_id in &def.instance_ids {
                if !self.segment_instances.contains_key(instance_id) {
                    return Err(StoreError::invariant(format!(
                        "segment definition {} lists missing instance {instance_id}",
                        def.id
                    )));
                }
            }
        }

        // Ids never reused (invariant 6): every allocator sits past the ids
        // in its slice.
        check_allocator(&self.connection_ids, self.connections.keys().copied())?;
        check_allocator(&self.worker_ids, self.workers.keys().copied())?;
        check_allocator(
            &self.pipeline_def_ids,
            self.pipeline_definitions.keys().copied(),
        )?;
        check_allocator(
            &self.segment_def_ids,
            self.segment_definitions.keys().copied(),
        )?;
        check_allocator(
            &self.pipeline_instance_ids,
            self.pipeline_instances.keys().copied(),
        )?;
        check_allocator(
            &self.segment_instance_ids,
            self.segment_instances.keys().copied(),
        )?;
        check_allocator(
            &self.manifold_instance_ids,
            self.manifold_instances.keys().copied(),
        )?;
        check_allocator(
            &self.subscription_service_ids,
            self.subscription_services.keys().copied(),
        )?;

        Ok(())
    }
}

/// Applies a monotonic status transition or reports why it is rejected.
pub(crate) fn advance(
    state: &mut ResourceState,
    kind: ResourceKind,
    id: u64,
    to: ResourceStatus,
) -> Result<()> {
    if !state.status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            kind,
            id,
            from: state.status,
            to,
        });
    }
    state.status = to;
    Ok(())
}

fn sorted_by_id<'a, T>(values: impl Iterator<Item = &'a T>, key: impl Fn(&T) -> u64) -> Vec<&'a T> {
    let mut out: Vec<&T> = values.collect();
    out.sort_by_key(|v| key(v));
    out
}

fn check_allocator<T: TypedId>(
    allocator: &IdAllocator<T>,
    ids: impl Iterator<Item = T>,
) -> Result<()> {
    let next = allocator.peek().raw();
    if let Some(max) = ids.map(TypedId::raw).max() {
        if next <= max {
            return Err(StoreError::invariant(format!(
                "{} allocator would reuse id {next} (max live id is {max})",
                T::KIND
            )));
        }
    }
    Ok(())
}
