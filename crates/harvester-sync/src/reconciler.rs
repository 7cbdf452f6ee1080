//! Second pass: data set parent/child and container/component edges.
//!
//! Runs after content registration, so edges may point at data sets that
//! did not exist locally before this run. Edge sets are recomputed from the
//! resource list every time; an unchanged data set yields an update equal
//! to its current state.

use crate::error::Result;
use crate::service::{DataSetUpdate, EntityService, OperationBatch};
use chrono::{DateTime, Utc};
use harvester_manifest::{ConnectionKind, DataSetKind, IncomingDataSet, ResourceList};
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Default)]
pub struct ReconciliationPlan {
    pub batch: OperationBatch,
    /// New container data sets registered by this batch.
    pub registered: Vec<String>,
    pub updated: Vec<String>,
    /// Selected but left out: not present locally, or an owner lookup failed.
    pub skipped: Vec<String>,
}

/// Parent and contained codes contributed by the resource list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSetEdges {
    pub parents: BTreeMap<String, BTreeSet<String>>,
    pub contained: BTreeMap<String, BTreeSet<String>>,
}

impl DataSetEdges {
    /// Data sets in `skipped` contribute no edges: a failed or black-listed
    /// parent is not attached to its children, and a failed or black-listed
    /// component is not attached to its container.
    pub fn collect(list: &ResourceList, skipped: &HashSet<String>) -> Self {
        let mut edges = Self::default();
        for ds in list.data_sets.values() {
            for conn in &ds.connections {
                let target = match list.data_sets.get(&conn.to) {
                    Some(target) => target,
                    None if conn.kind == ConnectionKind::Connection => continue,
                    None => {
                        tracing::warn!(from = %conn.from, to = %conn.to, kind = %conn.kind, "data set edge target missing, skipped");
                        continue;
                    }
                };
                match conn.kind {
                    ConnectionKind::Child => {
                        if !skipped.contains(&ds.entity.code) {
                            edges
                                .parents
                                .entry(target.entity.code.clone())
                                .or_default()
                                .insert(ds.entity.code.clone());
                        }
                    }
                    ConnectionKind::Component => {
                        if !ds.entity.is_container() {
                            tracing::warn!(code = %ds.entity.code, "component edge on a physical data set ignored");
                            continue;
                        }
                        if !skipped.contains(&target.entity.code) {
                            edges
                                .contained
                                .entry(ds.entity.code.clone())
                                .or_default()
                                .insert(target.entity.code.clone());
                        }
                    }
                    ConnectionKind::Connection => {}
                }
            }
        }
        edges
    }

    pub fn parents_of(&self, code: &str) -> Vec<String> {
        self.parents
            .get(code)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contained_in(&self, code: &str) -> Vec<String> {
        self.contained
            .get(code)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct RelationshipReconciler<'a> {
    entities: &'a dyn EntityService,
    session: &'a str,
    watermark: DateTime<Utc>,
    retry: &'a HashSet<String>,
    black_listed: &'a HashSet<String>,
    verbose: bool,
}

impl<'a> RelationshipReconciler<'a> {
    pub fn new(
        entities: &'a dyn EntityService,
        session: &'a str,
        watermark: DateTime<Utc>,
        retry: &'a HashSet<String>,
        black_listed: &'a HashSet<String>,
    ) -> Self {
        Self {
            entities,
            session,
            watermark,
            retry,
            black_listed,
            verbose: false,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// A data set is reconsidered when it is newer than the watermark, is
    /// being retried, or has a parent being retried; never when black-listed.
    fn is_selected(&self, ds: &IncomingDataSet, edges: &DataSetEdges) -> bool {
        let code = &ds.entity.code;
        if self.black_listed.contains(code) {
            return false;
        }
        ds.is_modified_since(self.watermark)
            || self.retry.contains(code)
            || edges
                .parents
                .get(code)
                .is_some_and(|parents| parents.iter().any(|p| self.retry.contains(p)))
    }

    /// `content_codes`: physical data sets handed to the content registrar
    /// this run. `skipped`: failed or black-listed codes.
    pub async fn plan(
        &self,
        list: &ResourceList,
        content_codes: &HashSet<String>,
        skipped: &HashSet<String>,
    ) -> Result<ReconciliationPlan> {
        let edges = DataSetEdges::collect(list, skipped);
        let mut plan = ReconciliationPlan::default();

        for ds in list.data_sets.values() {
            if !self.is_selected(ds, &edges) {
                continue;
            }
            let code = &ds.entity.code;
            let local = self.entities.try_get_data_set(self.session, code).await?;

            let Some(local) = local else {
                if ds.entity.is_physical() || content_codes.contains(code) {
                    // Content registration failed or never ran for it.
                    tracing::debug!(code = %code, "data set not registered locally, edges skipped");
                    plan.skipped.push(code.clone());
                    continue;
                }
                let mut new_ds = ds.entity.clone();
                new_ds.parent_codes = edges.parents_of(code);
                if let DataSetKind::Container { contained_codes } = &mut new_ds.kind {
                    *contained_codes = edges.contained_in(code);
                }
                if self.verbose {
                    tracing::info!(code = %code, parents = ?new_ds.parent_codes, "container data set will be registered");
                }
                plan.batch.data_set_registrations.push(new_ds);
                plan.registered.push(code.clone());
                continue;
            };

            let sample_identifier = match &ds.entity.sample_identifier {
                Some(identifier) => match self.entities.try_get_sample(self.session, identifier).await? {
                    Some(sample) => Some(sample.identifier),
                    None => {
                        tracing::warn!(code = %code, sample = %identifier, "owning sample not found, data set left out of the relationship batch");
                        plan.skipped.push(code.clone());
                        continue;
                    }
                },
                None => None,
            };
            let experiment_identifier = match &ds.entity.experiment_identifier {
                Some(identifier) => match self.entities.try_get_experiment(self.session, identifier).await? {
                    Some(experiment) => Some(experiment.identifier),
                    None => {
                        tracing::warn!(code = %code, experiment = %identifier, "owning experiment not found, data set left out of the relationship batch");
                        plan.skipped.push(code.clone());
                        continue;
                    }
                },
                None => None,
            };

            let update = DataSetUpdate {
                code: code.clone(),
                version: local.version,
                properties: ds.entity.properties.clone(),
                sample_identifier,
                experiment_identifier,
                modified_parent_codes: edges.parents_of(code),
                modified_contained_codes: ds.entity.is_container().then(|| edges.contained_in(code)),
            };
            if self.verbose {
                tracing::info!(
                    code = %code,
                    parents = ?update.modified_parent_codes,
                    contained = ?update.modified_contained_codes,
                    "data set relationships will be updated"
                );
            }
            plan.batch.data_set_updates.push(update);
            plan.updated.push(code.clone());
        }

        plan.registered.sort();
        plan.updated.sort();
        plan.skipped.sort();
        tracing::info!(
            registrations = plan.registered.len(),
            updates = plan.updated.len(),
            skipped = plan.skipped.len(),
            "relationship plan ready"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use harvester_manifest::*;

    fn ds(perm: &str, code: &str, kind: DataSetKind) -> IncomingDataSet {
        Incoming::new(
            perm,
            Utc.with_ymd_and_hms(2016, 6, 30, 10, 0, 0).unwrap(),
            NewDataSet {
                perm_id: perm.into(),
                code: code.into(),
                data_set_type: "T".into(),
                kind,
                properties: Properties::new(),
                sample_identifier: None,
                experiment_identifier: None,
                parent_codes: Vec::new(),
            },
        )
    }

    fn container() -> DataSetKind {
        DataSetKind::Container {
            contained_codes: Vec::new(),
        }
    }

    fn list() -> ResourceList {
        let mut list = ResourceList::new("DST", epoch());
        list.data_sets.insert(
            "1".into(),
            ds("1", "A", DataSetKind::Physical)
                .with_connection("2", ConnectionKind::Child)
                .with_connection("3", ConnectionKind::Child),
        );
        list.data_sets.insert(
            "2".into(),
            ds("2", "B", DataSetKind::Physical).with_connection("3", ConnectionKind::Child),
        );
        list.data_sets.insert("3".into(), ds("3", "C", DataSetKind::Physical));
        list.data_sets.insert(
            "4".into(),
            ds("4", "BOX", container())
                .with_connection("1", ConnectionKind::Component)
                .with_connection("2", ConnectionKind::Component)
                .with_connection("404", ConnectionKind::Component),
        );
        list
    }

    #[test]
    fn edges_are_unions_of_incoming_connections() {
        let edges = DataSetEdges::collect(&list(), &HashSet::new());
        assert_eq!(edges.parents_of("C"), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(edges.parents_of("B"), vec!["A".to_string()]);
        assert!(edges.parents_of("A").is_empty());
        assert_eq!(edges.contained_in("BOX"), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn skipped_data_sets_contribute_no_edges() {
        let skipped: HashSet<String> = ["A".to_string()].into();
        let edges = DataSetEdges::collect(&list(), &skipped);
        assert_eq!(edges.parents_of("C"), vec!["B".to_string()]);
        assert!(edges.parents_of("B").is_empty());
        assert_eq!(edges.contained_in("BOX"), vec!["B".to_string()]);
    }

    fn seed_all(service: &crate::testing::InMemoryEntityService, list: &ResourceList) {
        let mut batch = OperationBatch::default();
        for ds in list.data_sets.values() {
            batch.data_set_registrations.push(ds.entity.clone());
        }
        service.seed(&batch);
    }

    #[tokio::test]
    async fn second_reconciliation_is_a_no_op() {
        let service = crate::testing::InMemoryEntityService::new();
        let list = list();
        seed_all(&service, &list);
        let none = HashSet::new();

        let reconciler = RelationshipReconciler::new(&service, "s", epoch(), &none, &none);
        let first = reconciler.plan(&list, &none, &none).await.unwrap();
        assert_eq!(first.updated, vec!["A", "B", "BOX", "C"]);
        assert!(first.registered.is_empty());
        service
            .perform_entity_operations("s", first.batch.clone())
            .await
            .unwrap();

        let second = reconciler.plan(&list, &none, &none).await.unwrap();
        for update in &second.batch.data_set_updates {
            let current = service.data_set(&update.code).unwrap();
            assert_eq!(update.modified_parent_codes, current.parent_codes);
            if let Some(contained) = &update.modified_contained_codes {
                assert_eq!(contained, &current.contained_codes);
            }
        }
        service
            .perform_entity_operations("s", second.batch)
            .await
            .unwrap();
        assert_eq!(service.data_set("C").unwrap().parent_codes, vec!["A", "B"]);
        assert_eq!(service.data_set("BOX").unwrap().contained_codes, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn retried_parent_pulls_in_its_children() {
        let service = crate::testing::InMemoryEntityService::new();
        let list = list();
        seed_all(&service, &list);
        let watermark = Utc.with_ymd_and_hms(2016, 7, 1, 0, 0, 0).unwrap();
        let retry: HashSet<String> = ["A".to_string()].into();
        let none = HashSet::new();

        let plan = RelationshipReconciler::new(&service, "s", watermark, &retry, &none)
            .plan(&list, &none, &none)
            .await
            .unwrap();
        assert_eq!(plan.updated, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn black_listed_and_unregistered_data_sets_are_left_out() {
        let service = crate::testing::InMemoryEntityService::new();
        let list = list();
        let mut seed = OperationBatch::default();
        seed.data_set_registrations
            .push(list.data_sets["2"].entity.clone());
        service.seed(&seed);

        let black: HashSet<String> = ["C".to_string()].into();
        let none = HashSet::new();
        let content: HashSet<String> = ["A".to_string()].into();
        let skipped: HashSet<String> = ["A".to_string(), "C".to_string()].into();
        let plan = RelationshipReconciler::new(&service, "s", epoch(), &none, &black)
            .plan(&list, &content, &skipped)
            .await
            .unwrap();

        assert_eq!(plan.updated, vec!["B"]);
        assert_eq!(plan.registered, vec!["BOX"]);
        assert_eq!(plan.skipped, vec!["A"]);
        let registered = &plan.batch.data_set_registrations[0];
        assert_eq!(
            registered.kind,
            DataSetKind::Container {
                contained_codes: vec!["B".to_string()]
            }
        );
        assert!(plan.batch.data_set_updates[0].modified_parent_codes.is_empty());
    }
}
