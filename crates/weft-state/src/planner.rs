//! The pipeline-assignment planner.
//!
//! Materializes a pipeline description plus a segment-to-worker mapping into
//! concrete store entities:
//!
//! 1. validate the definition's port topology,
//! 2. intern the definition (content-addressed: structurally identical
//!    definitions collapse to one id),
//! 3. create a pipeline instance for the requesting connection,
//! 4. create one segment instance per (mapping, worker),
//! 5. create one manifold instance per distinct port.
//!
//! Within a single request, segment instances are emitted in (mapping order,
//! ascending worker id) order, so the assigned ids are deterministic given
//! the request.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use weft_core::{
    ConnectionId, ManifoldInstanceId, PipelineDefId, PipelineInstanceId, SegmentDefId,
    SegmentInstanceId, WorkerId,
};

use crate::error::StoreError;
use crate::objects::{ManifoldInstance, PipelineDefinition, ResourceState, SegmentDefinition};
use crate::store::StateStore;

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
    pub worker_ids: Vec<WorkerId>,
}

/// A full assignment request: the pipeline and its placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRequest {
    /// The pipeline's segments.
    pub segments: Vec<SegmentSpec>,
    /// Placement of segments onto workers.
    pub mappings: Vec<SegmentMapping>,
}

/// Ids produced by an assignment.
///
/// Definition ids may be reused (interning); instance ids are fresh unless
/// the connection already held an instance of the same definition, in which
/// case the existing materialization is returned unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentOutcome {
    /// The interned pipeline definition.
    pub pipeline_definition_id: PipelineDefId,
    /// Segment definitions, in request segment order.
    pub segment_definition_ids: Vec<SegmentDefId>,
    /// The pipeline materialization for the requesting connection.
    pub pipeline_instance_id: PipelineInstanceId,
    /// Segment materializations, in (mapping, ascending worker) order.
    pub segment_instance_ids: Vec<SegmentInstanceId>,
    /// Manifolds, one per distinct port, in port-name order.
    pub manifold_instance_ids: Vec<ManifoldInstanceId>,
}

/// Errors rejecting an assignment request.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    /// The pipeline lists no segments.
    #[error("pipeline has no segments")]
    EmptyPipeline,

    /// Two segments share a name.
    #[error("duplicate segment name '{name}'")]
    DuplicateSegmentName {
        /// The colliding name.
        name: String,
    },

    /// A port is consumed but never produced.
    #[error("port '{port}' has no producer")]
    PortWithoutProducer {
        /// The unproduced port.
        port: String,
    },

    /// A port is produced but never consumed.
    #[error("port '{port}' has no consumer")]
    PortWithoutConsumer {
        /// The unconsumed port.
        port: String,
    },

    /// More than one segment produces a port. The only supported manifold
    /// is the load-balancer; heterogeneous producers require an explicit
    /// manifold type that does not exist yet.
    #[error("port '{port}' has {count} producers; only one is supported")]
    MultipleProducers {
        /// The over-produced port.
        port: String,
        /// How many segments produce it.
        count: usize,
    },

    /// More than one segment consumes a port.
    #[error("port '{port}' has {count} consumers; only one is supported")]
    MultipleConsumers {
        /// The over-consumed port.
        port: String,
        /// How many segments consume it.
        count: usize,
    },

    /// A mapping names a segment the pipeline does not define.
    #[error("mapping references unknown segment '{name}'")]
    UnknownSegment {
        /// The unmatched name.
        name: String,
    },

    /// A segment appears in more than one mapping.
    #[error("segment '{name}' is mapped more than once")]
    DuplicateMapping {
        /// The repeated name.
        name: String,
    },

    /// A mapping references a worker that is not registered.
    #[error("unknown worker {id}")]
    UnknownWorker {
        /// The missing worker.
        id: WorkerId,
    },

    /// A mapping references a worker owned by another connection.
    #[error("worker {id} is registered to connection {owner}")]
    ForeignWorker {
        /// The foreign worker.
        id: WorkerId,
        /// Its actual owner.
        owner: ConnectionId,
    },

    /// The store rejected the materialization.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates a pipeline description's port topology.
///
/// Every named port must have exactly one producing segment and exactly one
/// consuming segment.
fn validate_definition(segments: &[SegmentSpec]) -> Result<(), PlannerError> {
    if segments.is_empty() {
        return Err(PlannerError::EmptyPipeline);
    }

    let mut names = BTreeSet::new();
    for segment in segments {
        if !names.insert(segment.name.as_str()) {
            return Err(PlannerError::DuplicateSegmentName {
                name: segment.name.clone(),
            });
        }
    }

    let mut producers: BTreeMap<&str, usize> = BTreeMap::new();
    let mut consumers: BTreeMap<&str, usize> = BTreeMap::new();
    for segment in segments {
        for port in &segment.egress_ports {
            *producers.entry(port).or_default() += 1;
        }
        for port in &segment.ingress_ports {
            *consumers.entry(port).or_default() += 1;
        }
    }

    let ports: BTreeSet<&str> = producers.keys().chain(consumers.keys()).copied().collect();
    for port in ports {
        let produced = producers.get(port).copied().unwrap_or(0);
        let consumed = consumers.get(port).copied().unwrap_or(0);
        if produced == 0 {
            return Err(PlannerError::PortWithoutProducer { port: port.into() });
        }
        if consumed == 0 {
            return Err(PlannerError::PortWithoutConsumer { port: port.into() });
        }
        if produced > 1 {
            return Err(PlannerError::MultipleProducers {
                port: port.into(),
                count: produced,
            });
        }
        if consumed > 1 {
            return Err(PlannerError::MultipleConsumers {
                port: port.into(),
                count: consumed,
            });
        }
    }

    Ok(())
}

/// Hashes the structural content of a pipeline description.
///
/// Segment order and port order do not affect the digest; names and the
/// port edge sets do. The hex digest is the interning key.
#[must_use]
pub fn structural_hash(segments: &[SegmentSpec]) -> String {
    let mut lines: Vec<String> = segments
        .iter()
        .map(|segment| {
            let mut ingress = segment.ingress_ports.clone();
            ingress.sort_unstable();
            let mut egress = segment.egress_ports.clone();
            egress.sort_unstable();
            format!(
                "{}|in:{}|out:{}",
                segment.name,
                ingress.join(","),
                egress.join(",")
            )
        })
        .collect();
    lines.sort_unstable();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

impl StateStore {
    /// Interns a pipeline definition, inserting it on first sight.
    ///
    /// Adding a definition with the same structural content as an existing
    /// one returns the existing id and inserts nothing.
    ///
    /// # Errors
    ///
    /// Returns a [`PlannerError`] if the description's port topology is
    /// invalid, or a wrapped [`StoreError`] on id exhaustion.
    pub fn pipeline_definitions_add(
        &mut self,
        segments: &[SegmentSpec],
    ) -> Result<(PipelineDefId, Vec<SegmentDefId>), PlannerError> {
        validate_definition(segments)?;
        if let Some(found) = self.lookup_interned(segments) {
            return Ok(found);
        }
        let outcome = self.commit(|store| store.intern_definition_in(segments))?;
        Ok(outcome)
    }

    /// Returns the interned (definition, segment definitions) for a
    /// description that already exists, with segment ids in request order.
    fn lookup_interned(
        &self,
        segments: &[SegmentSpec],
    ) -> Option<(PipelineDefId, Vec<SegmentDefId>)> {
        let hash = structural_hash(segments);
        let def_id = *self.definitions_by_hash.get(&hash)?;
        let def = self.pipeline_definitions.get(&def_id)?;
        let by_name: BTreeMap<&str, SegmentDefId> = def
            .segment_ids
            .iter()
            .filter_map(|sid| {
                self.segment_definitions
                    .get(sid)
                    .map(|sd| (sd.name.as_str(), *sid))
            })
            .collect();
        let ordered = segments
            .iter()
            .map(|segment| by_name.get(segment.name.as_str()).copied())
            .collect::<Option<Vec<_>>>()?;
        Some((def_id, ordered))
    }

    pub(crate) fn intern_definition_in(
        &mut self,
        segments: &[SegmentSpec],
    ) -> crate::error::Result<(PipelineDefId, Vec<SegmentDefId>)> {
        let hash = structural_hash(segments);
        let def_id = self.pipeline_def_ids.next_id()?;

        let mut segment_ids = Vec::with_capacity(segments.len());
        for spec in segments {
            let segment_id = self.segment_def_ids.next_id()?;
            self.segment_definitions.insert(
                segment_id,
                SegmentDefinition {
                    id: segment_id,
                    parent_pipeline_id: def_id,
                    name: spec.name.clone(),
                    ingress_ports: spec.ingress_ports.clone(),
                    egress_ports: spec.egress_ports.clone(),
                    instance_ids: Vec::new(),
                },
            );
            segment_ids.push(segment_id);
        }

        let port_names: BTreeSet<String> = segments
            .iter()
            .flat_map(|s| s.ingress_ports.iter().chain(&s.egress_ports))
            .cloned()
            .collect();

        self.pipeline_definitions.insert(
            def_id,
            PipelineDefinition {
                id: def_id,
                structural_hash: hash.clone(),
                segment_ids: segment_ids.clone(),
                port_names: port_names.into_iter().collect(),
                instance_ids: Vec::new(),
            },
        );
        self.definitions_by_hash.insert(hash, def_id);
        Ok((def_id, segment_ids))
    }

    /// Materializes a pipeline onto the requesting connection's workers.
    ///
    /// Re-requesting a definition the connection already holds an instance
    /// of returns the existing materialization unchanged.
    ///
    /// # Errors
    ///
    /// Returns a [`PlannerError`] if the description or mapping is invalid;
    /// the store is left untouched. Store-level failures (id exhaustion)
    /// are wrapped.
    pub fn assign_pipeline(
        &mut self,
        machine_id: ConnectionId,
        request: &AssignmentRequest,
    ) -> Result<AssignmentOutcome, PlannerError> {
        validate_definition(&request.segments)?;

        if !self.connections.contains_key(&machine_id) {
            return Err(StoreError::missing_prerequisite(format!(
                "connection {machine_id} does not exist"
            ))
            .into());
        }

        let segment_names: BTreeSet<&str> =
            request.segments.iter().map(|s| s.name.as_str()).collect();
        let mut mapped = BTreeSet::new();
        for mapping in &request.mappings {
            if !segment_names.contains(mapping.segment_name.as_str()) {
                return Err(PlannerError::UnknownSegment {
                    name: mapping.segment_name.clone(),
                });
            }
            if !mapped.insert(mapping.segment_name.as_str()) {
                return Err(PlannerError::DuplicateMapping {
                    name: mapping.segment_name.clone(),
                });
            }
            for worker_id in &mapping.worker_ids {
                match self.workers.get(worker_id) {
                    None => return Err(PlannerError::UnknownWorker { id: *worker_id }),
                    Some(worker) if worker.machine_id != machine_id => {
                        return Err(PlannerError::ForeignWorker {
                            id: *worker_id,
                            owner: worker.machine_id,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        // Idempotent re-request: the (definition, connection) pair already
        // has a live materialization.
        if let Some((def_id, segment_def_ids)) = self.lookup_interned(&request.segments) {
            if let Some(instance) = self.find_pipeline_instance(def_id, machine_id) {
                return Ok(AssignmentOutcome {
                    pipeline_definition_id: def_id,
                    segment_definition_ids: segment_def_ids,
                    pipeline_instance_id: instance.id,
                    segment_instance_ids: instance.segment_ids.clone(),
                    manifold_instance_ids: instance.manifold_ids.clone(),
                });
            }
        }

        let segments = request.segments.clone();
        let mappings = request.mappings.clone();
        let outcome = self.commit(move |store| {
            let (def_id, segment_def_ids) = match store.lookup_interned(&segments) {
                Some(found) => found,
                None => store.intern_definition_in(&segments)?,
            };
            let by_name: BTreeMap<&str, SegmentDefId> = segments
                .iter()
                .zip(&segment_def_ids)
                .map(|(spec, id)| (spec.name.as_str(), *id))
                .collect();

            let instance_id = store.pipeline_instances_add_in(def_id, machine_id)?;

            let mut segment_instance_ids = Vec::new();
            let mut instances_by_segment: BTreeMap<String, Vec<SegmentInstanceId>> =
                BTreeMap::new();
            for mapping in &mappings {
                let segment_def_id = by_name
                    .get(mapping.segment_name.as_str())
                    .copied()
                    .ok_or_else(|| {
                        StoreError::invariant(format!(
                            "mapping '{}' survived validation without a definition",
                            mapping.segment_name
                        ))
                    })?;
                let mut worker_ids = mapping.worker_ids.clone();
                worker_ids.sort_unstable();
                worker_ids.dedup();
                for (rank, worker_id) in worker_ids.iter().enumerate() {
                    #[allow(clippy::cast_possible_truncation)]
                    let segment_id = store.segment_instances_add_in(
                        segment_def_id,
                        instance_id,
                        *worker_id,
                        rank as u32,
                    )?;
                    segment_instance_ids.push(segment_id);
                    instances_by_segment
                        .entry(mapping.segment_name.clone())
                        .or_default()
                        .push(segment_id);
                }
            }

            let mut manifold_instance_ids = Vec::new();
            let port_names = store
                .pipeline_definitions
                .get(&def_id)
                .map(|def| def.port_names.clone())
                .unwrap_or_default();
            for port in port_names {
                let producer = segments
                    .iter()
                    .find(|s| s.egress_ports.contains(&port))
                    .map(|s| s.name.clone())
                    .ok_or_else(|| {
                        StoreError::invariant(format!("port '{port}' lost its producer"))
                    })?;
                let consumer = segments
                    .iter()
                    .find(|s| s.ingress_ports.contains(&port))
                    .map(|s| s.name.clone())
                    .ok_or_else(|| {
                        StoreError::invariant(format!("port '{port}' lost its consumer"))
                    })?;

                let manifold_id = store.manifold_instance_ids.next_id()?;
                store.manifold_instances.insert(
                    manifold_id,
                    ManifoldInstance {
                        id: manifold_id,
                        port_name: port,
                        pipeline_instance_id: instance_id,
                        requested_input: instances_by_segment
                            .get(&producer)
                            .cloned()
                            .unwrap_or_default(),
                        requested_output: instances_by_segment
                            .get(&consumer)
                            .cloned()
                            .unwrap_or_default(),
                        actual_input: Vec::new(),
                        actual_output: Vec::new(),
                        state: ResourceState::registered(),
                        registered_at: chrono::Utc::now(),
                    },
                );
                if let Some(instance) = store.pipeline_instances.get_mut(&instance_id) {
                    instance.manifold_ids.push(manifold_id);
                }
                manifold_instance_ids.push(manifold_id);
            }

            Ok(AssignmentOutcome {
                pipeline_definition_id: def_id,
                segment_definition_ids: segment_def_ids,
                pipeline_instance_id: instance_id,
                segment_instance_ids,
                manifold_instance_ids,
            })
        })?;

        Ok(outcome)
    }
}
