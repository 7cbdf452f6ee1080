//! First pass: decide create-vs-update for projects, experiments, samples
//! and materials, and fold structural connections into entity attributes.
//!
//! ```text
//!   ResourceList ──► propagate connections ──► decide per kind ──► OperationBatch
//!                    project → experiment       project
//!                    experiment → sample/ds     experiment (via id mapping)
//!                    sample → sample/ds         sample (deferred updates)
//!                                               material
//! ```
//!
//! Only candidates strictly newer than the watermark get a decision; older
//! ones stay in the list because their connections still feed newer
//! entities. Data sets never enter this batch.

use crate::error::{HarvestError, Result};
use crate::graph::LocalGraph;
use crate::mapping::PermIdMapping;
use crate::service::{
    EntityService, ExperimentUpdate, MaterialUpdate, NewSpace, OperationBatch, ProjectUpdate,
    SampleUpdate,
};
use chrono::{DateTime, Utc};
use harvester_manifest::{ConnectionKind, EntityKind, ResourceList};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlanAction {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanDecision {
    pub kind: EntityKind,
    pub identifier: String,
    pub action: PlanAction,
}

#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub batch: OperationBatch,
    pub decisions: Vec<PlanDecision>,
}

impl SyncPlan {
    pub fn decisions_for(&self, identifier: &str) -> Vec<&PlanDecision> {
        self.decisions
            .iter()
            .filter(|d| d.identifier == identifier)
            .collect()
    }

    pub fn count(&self, kind: EntityKind, action: PlanAction) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.kind == kind && d.action == action)
            .count()
    }
}

pub struct SyncPlanner<'a> {
    entities: &'a dyn EntityService,
    session: &'a str,
    graph: &'a LocalGraph,
    experiment_mapping: &'a PermIdMapping,
    watermark: DateTime<Utc>,
    space_description: Option<String>,
    verbose: bool,
}

impl<'a> SyncPlanner<'a> {
    pub fn new(
        entities: &'a dyn EntityService,
        session: &'a str,
        graph: &'a LocalGraph,
        experiment_mapping: &'a PermIdMapping,
        watermark: DateTime<Utc>,
    ) -> Self {
        Self {
            entities,
            session,
            graph,
            experiment_mapping,
            watermark,
            space_description: None,
            verbose: false,
        }
    }

    /// Description given to the namespace if this run has to create it.
    pub fn space_description(mut self, description: impl Into<String>) -> Self {
        self.space_description = Some(description.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Mutates `list` (connection propagation) and returns the first batch.
    pub async fn plan(&self, list: &mut ResourceList) -> Result<SyncPlan> {
        propagate_connections(list, self.graph);

        let mut plan = SyncPlan::default();
        if !self.graph.space_exists() {
            tracing::info!(space = %list.local_space, "space will be registered");
            plan.batch.space_registrations.push(NewSpace {
                code: list.local_space.clone(),
                description: self.space_description.clone(),
            });
        }
        self.plan_projects(list, &mut plan).await?;
        self.plan_experiments(list, &mut plan).await?;
        self.plan_samples(list, &mut plan).await?;
        self.plan_materials(list, &mut plan).await?;

        tracing::info!(
            registrations = plan.batch.registration_count(),
            updates = plan.batch.update_count(),
            "entity plan ready"
        );
        Ok(plan)
    }

    fn decide(&self, plan: &mut SyncPlan, kind: EntityKind, identifier: &str, action: PlanAction) {
        if self.verbose {
            let verb = match action {
                PlanAction::Create => "registered",
                PlanAction::Update => "updated",
            };
            tracing::info!(kind = %kind, identifier, "will be {verb}");
        }
        plan.decisions.push(PlanDecision {
            kind,
            identifier: identifier.to_string(),
            action,
        });
    }

    async fn plan_projects(&self, list: &ResourceList, plan: &mut SyncPlan) -> Result<()> {
        for incoming in list.projects.values() {
            if !incoming.is_modified_since(self.watermark) {
                continue;
            }
            let project = &incoming.entity;
            if !self.graph.contains_entity(&project.identifier) {
                self.decide(plan, EntityKind::Project, &project.identifier, PlanAction::Create);
                plan.batch.project_registrations.push(project.clone());
                continue;
            }
            let local = self
                .entities
                .try_get_project(self.session, &project.identifier)
                .await?
                .ok_or_else(|| vanished(EntityKind::Project, &project.identifier))?;
            self.decide(plan, EntityKind::Project, &project.identifier, PlanAction::Update);
            plan.batch.project_updates.push(ProjectUpdate {
                identifier: project.identifier.clone(),
                version: local.version,
                description: project.description.clone(),
            });
        }
        Ok(())
    }

    async fn plan_experiments(&self, list: &ResourceList, plan: &mut SyncPlan) -> Result<()> {
        for incoming in list.experiments.values() {
            if !incoming.is_modified_since(self.watermark) {
                continue;
            }
            let experiment = &incoming.entity;
            let local_perm_id = self.experiment_mapping.resolve(&incoming.perm_id);
            let known = self
                .graph
                .node_for_perm_id(local_perm_id)
                .is_some_and(|node| node.kind == EntityKind::Experiment);
            if !known {
                self.decide(plan, EntityKind::Experiment, &experiment.identifier, PlanAction::Create);
                plan.batch.experiment_registrations.push(experiment.clone());
                continue;
            }
            let local = self
                .entities
                .try_get_experiment_by_perm_id(self.session, local_perm_id)
                .await?
                .ok_or_else(|| vanished(EntityKind::Experiment, &experiment.identifier))?;
            self.decide(plan, EntityKind::Experiment, &experiment.identifier, PlanAction::Update);
            plan.batch.experiment_updates.push(ExperimentUpdate {
                perm_id: local.perm_id,
                identifier: experiment.identifier.clone(),
                project_identifier: experiment.project_identifier().to_string(),
                version: local.version,
                properties: experiment.properties.clone(),
            });
        }
        Ok(())
    }

    async fn plan_samples(&self, list: &ResourceList, plan: &mut SyncPlan) -> Result<()> {
        let incoming_identifiers: HashSet<&str> = list
            .samples
            .values()
            .map(|s| s.entity.identifier.as_str())
            .collect();
        let mut deferred = Vec::new();
        let mut parents_updated: HashSet<String> = HashSet::new();

        for incoming in list.samples.values() {
            if !incoming.is_modified_since(self.watermark) {
                continue;
            }
            let sample = &incoming.entity;
            if !self.graph.contains_entity(&sample.identifier) {
                self.decide(plan, EntityKind::Sample, &sample.identifier, PlanAction::Create);
                plan.batch.sample_registrations.push(sample.clone());
                continue;
            }
            // Local children that are still described remotely get an explicit
            // parent list, so parents dropped on the remote side go away here.
            for pair in self
                .graph
                .neighbours(&sample.identifier, Some(ConnectionKind::Child))
            {
                if incoming_identifiers.contains(pair.node.identifier.as_str()) {
                    parents_updated.insert(pair.node.identifier.clone());
                } else {
                    tracing::debug!(
                        parent = %sample.identifier,
                        child = %pair.node.identifier,
                        "local child not in resource list, left untouched"
                    );
                }
            }
            deferred.push(sample);
        }

        for sample in deferred {
            let local = self
                .entities
                .try_get_sample(self.session, &sample.identifier)
                .await?
                .ok_or_else(|| vanished(EntityKind::Sample, &sample.identifier))?;
            let parent_identifiers = match &sample.parent_identifiers {
                Some(parents) => Some(parents.clone()),
                None if parents_updated.contains(&sample.identifier) => Some(Vec::new()),
                None => None,
            };
            self.decide(plan, EntityKind::Sample, &sample.identifier, PlanAction::Update);
            plan.batch.sample_updates.push(SampleUpdate {
                identifier: sample.identifier.clone(),
                version: local.version,
                properties: sample.properties.clone(),
                experiment_identifier: sample.experiment_identifier.clone(),
                container_identifier: sample.container_identifier.clone(),
                parent_identifiers,
            });
        }
        Ok(())
    }

    async fn plan_materials(&self, list: &ResourceList, plan: &mut SyncPlan) -> Result<()> {
        for incoming in &list.materials {
            if !incoming.is_modified_since(self.watermark) {
                continue;
            }
            let material = &incoming.material;
            let identifier = material.identifier();
            let local = self
                .entities
                .try_get_material(self.session, &material.code, &material.material_type)
                .await?;
            match local {
                None => {
                    self.decide(plan, EntityKind::Material, &identifier, PlanAction::Create);
                    plan.batch.material_registrations.push(material.clone());
                }
                Some(local) => {
                    self.decide(plan, EntityKind::Material, &identifier, PlanAction::Update);
                    plan.batch.material_updates.push(MaterialUpdate {
                        code: material.code.clone(),
                        material_type: material.material_type.clone(),
                        version: local.version,
                        properties: material.properties.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn vanished(kind: EntityKind, identifier: &str) -> HarvestError {
    HarvestError::Planning(format!(
        "{kind} {identifier} is in the local graph but could not be loaded"
    ))
}

// ============================================================================
// Connection propagation
// ============================================================================

/// Folds `Connection`, `Child` and `Component` edges of projects,
/// experiments and samples into the payloads of their targets. Data set
/// edges are left to the reconciler.
pub fn propagate_connections(list: &mut ResourceList, graph: &LocalGraph) {
    // project → experiment: re-parent under the local project path unless the
    // local graph already holds the experiment.
    let mut reparent: BTreeMap<String, String> = BTreeMap::new();
    for project in list.projects.values() {
        for conn in &project.connections {
            match list.kind_of(&conn.to) {
                Some(EntityKind::Experiment) => {
                    reparent.insert(conn.to.clone(), project.entity.identifier.clone());
                }
                Some(other) => tracing::debug!(
                    from = %conn.from,
                    to = %conn.to,
                    kind = %other,
                    "project connection ignored"
                ),
                None => missing_target(&conn.from, &conn.to, conn.kind),
            }
        }
    }
    for (perm_id, project_identifier) in reparent {
        if let Some(experiment) = list.experiments.get_mut(&perm_id) {
            let exp = &mut experiment.entity;
            if !graph.contains_entity(&exp.identifier) {
                exp.identifier = format!("{project_identifier}/{}", exp.code);
            }
        }
    }

    // experiment → sample / data set, whatever the edge kind
    let mut experiment_links: Vec<(String, String, ConnectionKind, String)> = Vec::new();
    for experiment in list.experiments.values() {
        for conn in &experiment.connections {
            experiment_links.push((
                conn.from.clone(),
                conn.to.clone(),
                conn.kind,
                experiment.entity.identifier.clone(),
            ));
        }
    }
    for (from, to, kind, experiment_identifier) in experiment_links {
        if let Some(sample) = list.samples.get_mut(&to) {
            sample.entity.experiment_identifier = Some(experiment_identifier);
        } else if let Some(data_set) = list.data_sets.get_mut(&to) {
            data_set.entity.experiment_identifier = Some(experiment_identifier);
        } else if !list.contains_perm_id(&to) {
            missing_target(&from, &to, kind);
        }
    }

    // sample → sample (Child, Component) / data set (Connection)
    let mut sample_links: Vec<(String, String, ConnectionKind)> = Vec::new();
    for sample in list.samples.values() {
        for conn in &sample.connections {
            sample_links.push((conn.to.clone(), sample.entity.identifier.clone(), conn.kind));
        }
    }
    for (to, from_identifier, kind) in sample_links {
        match kind {
            ConnectionKind::Child => match list.samples.get_mut(&to) {
                Some(child) => child
                    .entity
                    .parent_identifiers
                    .get_or_insert_with(Vec::new)
                    .push(from_identifier),
                None => missing_target(&from_identifier, &to, kind),
            },
            ConnectionKind::Component => match list.samples.get_mut(&to) {
                Some(component) => component.entity.container_identifier = Some(from_identifier),
                None => missing_target(&from_identifier, &to, kind),
            },
            ConnectionKind::Connection => match list.data_sets.get_mut(&to) {
                Some(data_set) => data_set.entity.sample_identifier = Some(from_identifier),
                None => missing_target(&from_identifier, &to, kind),
            },
        }
    }
}

fn missing_target(from: &str, to: &str, kind: ConnectionKind) {
    tracing::warn!(from, to, kind = %kind, "connected entity is missing from the resource list, edge skipped");
}
