//! One organization's canvas: the graph plus the data it was built from,
//! and the operations the interaction surface calls.
//!
//! Collaborators are passed into each call rather than owned, so the
//! session holds no handles to the outside world.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

use crate::catalog::{CatalogEntry, EntityCatalog, EntityRecord};
use crate::error::{CanvasError, ValidationError};
use crate::graph::{CanvasGraph, DerivedSummary, Edge, EdgeOrigin, GraphEvent, NeighborSide, Node, SyncSummary};
use crate::persist::{self, CanvasState, ExportDocument, MergePhase, MergeSummary, SaveReport, SaveScheduler, Viewport};
use crate::policy::{PolicyBinding, PolicyResolver, PolicyRule};
use crate::rules::{self, EdgeKind, EntityPatch};
use crate::source::{CatalogSource, EntityPatcher, PolicySource, SnapshotStore};
use crate::{CanvasSettings, EntityKind, NodeStatus, Position};

/// Which nodes and edges the surface wants to see.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CanvasFilter {
    /// Only these kinds. All kinds when absent.
    pub kinds: Option<Vec<EntityKind>>,
    /// Case-insensitive substring of the node label.
    pub search: Option<String>,
    pub include_disabled: bool,
    pub include_derived: bool,
}

impl Default for CanvasFilter {
    fn default() -> Self {
        Self {
            kinds: None,
            search: None,
            include_disabled: true,
            include_derived: true,
        }
    }
}

impl CanvasFilter {
    pub fn accepts_node(&self, node: &Node) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&node.kind) {
                return false;
            }
        }
        if !self.include_disabled && node.status == NodeStatus::Disabled {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => node.label.to_lowercase().contains(&q.to_lowercase()),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    Primary,
    Fallback,
    /// Nothing stored (or nothing readable): the initial layout stands.
    Fresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub source: LoadSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeSummary>,
    /// Primary (and fallback) errors that were recovered from.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Events held for a surface that is not draining them. Oldest go first.
pub const MAX_PENDING_EVENTS: usize = 1024;

pub struct CanvasSession {
    org_id: String,
    graph: CanvasGraph,
    catalog: EntityCatalog,
    catalog_loaded: bool,
    rules: Vec<PolicyRule>,
    bindings: Vec<PolicyBinding>,
    settings: CanvasSettings,
    phase: MergePhase,
    viewport: Viewport,
    scheduler: SaveScheduler,
    events: Vec<GraphEvent>,
}

impl CanvasSession {
    pub fn new(org_id: impl Into<String>, settings: CanvasSettings) -> Self {
        Self {
            org_id: org_id.into(),
            graph: CanvasGraph::new(settings.layout),
            catalog: EntityCatalog::new(),
            catalog_loaded: false,
            rules: Vec::new(),
            bindings: Vec::new(),
            scheduler: SaveScheduler::new(Duration::from_millis(settings.debounce_ms)),
            settings,
            phase: MergePhase::Initial,
            viewport: Viewport::default(),
            events: Vec::new(),
        }
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn graph(&self) -> &CanvasGraph {
        &self.graph
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &CanvasSettings {
        &self.settings
    }

    pub fn phase(&self) -> MergePhase {
        self.phase
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport.sanitize();
        self.scheduler.schedule(Instant::now());
    }

    /// When the pending debounced save fires, if one is pending.
    pub fn save_deadline(&self) -> Option<Instant> {
        self.scheduler.deadline()
    }

    // --- Queries ---

    pub fn visible_nodes(&self, filter: &CanvasFilter) -> Vec<&Node> {
        self.graph.nodes().filter(|n| filter.accepts_node(n)).collect()
    }

    /// Edges whose endpoints are both visible.
    pub fn visible_edges(&self, filter: &CanvasFilter) -> Vec<&Edge> {
        let visible = |id: &str| self.graph.node(id).is_some_and(|n| filter.accepts_node(n));
        self.graph
            .edges()
            .filter(|e| filter.include_derived || e.origin == EdgeOrigin::Explicit)
            .filter(|e| visible(&e.source) && visible(&e.target))
            .collect()
    }

    /// Events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<GraphEvent> {
        self.collect_events();
        std::mem::take(&mut self.events)
    }

    // --- Mutations ---

    /// Connect two nodes. A new explicit edge also writes the foreign key
    /// it implies back to the owning entity; a failed write is logged and
    /// leaves the edge in place.
    pub fn connect(
        &mut self,
        source: &str,
        target: &str,
        kind: Option<EdgeKind>,
        patcher: &dyn EntityPatcher,
    ) -> Result<Edge, ValidationError> {
        let existed = self
            .graph
            .edge(&crate::graph::edge_id(source, target))
            .is_some();
        let edge = self.graph.insert_edge(source, target, kind)?;
        if !existed {
            if let Err(e) = self.apply_side_effect(&edge, patcher) {
                tracing::warn!(edge = %edge.id, error = %e, "could not update entity for new edge");
            }
        }
        self.after_mutation();
        Ok(edge)
    }

    pub fn node_moved(&mut self, id: &str, position: Position) -> Result<Position, CanvasError> {
        let position = self.graph.move_node(id, position)?;
        self.after_mutation();
        Ok(position)
    }

    pub fn auto_arrange(&mut self) {
        self.graph.arrange_lanes();
        self.after_mutation();
    }

    pub fn delete_node(&mut self, id: &str) -> Result<Node, CanvasError> {
        let node = self.graph.delete_node(id)?;
        self.after_mutation();
        Ok(node)
    }

    /// Remove an edge. Deleting an explicit edge also clears the foreign key
    /// it implied, so a catalog refresh does not mirror it back.
    pub fn delete_edge(&mut self, id: &str, patcher: &dyn EntityPatcher) -> Result<Edge, CanvasError> {
        let edge = self.graph.delete_edge(id)?;
        if let Err(e) = self.release_side_effect(&edge, patcher) {
            tracing::warn!(edge = %edge.id, error = %e, "could not clear entity for deleted edge");
        }
        self.after_mutation();
        Ok(edge)
    }

    /// Point an edge at a new pair. The result is always explicit; foreign
    /// keys move with it.
    pub fn retarget_edge(
        &mut self,
        id: &str,
        source: &str,
        target: &str,
        patcher: &dyn EntityPatcher,
    ) -> Result<Edge, CanvasError> {
        let old = self
            .graph
            .edge(id)
            .cloned()
            .ok_or_else(|| CanvasError::EdgeNotFound(id.to_string()))?;
        let edge = self.graph.retarget_edge(id, source, target)?;
        if let Err(e) = self.release_side_effect(&old, patcher) {
            tracing::warn!(edge = %old.id, error = %e, "could not clear entity for retargeted edge");
        }
        if let Err(e) = self.apply_side_effect(&edge, patcher) {
            tracing::warn!(edge = %edge.id, error = %e, "could not update entity for retargeted edge");
        }
        self.after_mutation();
        Ok(edge)
    }

    /// Create a placeholder neighbor of `anchor` joined to it by an edge.
    pub fn create_neighbor(
        &mut self,
        anchor: &str,
        kind: EntityKind,
        side: NeighborSide,
    ) -> Result<(String, Edge), CanvasError> {
        let created = self
            .graph
            .create_neighbor(anchor, kind, side, Utc::now().timestamp_millis())?;
        self.after_mutation();
        Ok(created)
    }

    pub fn cancel_placeholder(&mut self, id: &str) -> Result<(), CanvasError> {
        self.graph.cancel_placeholder(id)?;
        self.after_mutation();
        Ok(())
    }

    /// Swap a placeholder for the entity the platform created for it. The
    /// catalog is refetched if the entity is not known yet; rewired edges
    /// apply their foreign-key side effects.
    pub fn promote_placeholder(
        &mut self,
        placeholder: &str,
        entity_id: &str,
        source: &dyn CatalogSource,
        patcher: &dyn EntityPatcher,
    ) -> Result<String, CanvasError> {
        let kind = self
            .graph
            .kind_of(placeholder)
            .ok_or_else(|| CanvasError::NodeNotFound(placeholder.to_string()))?;
        if self.catalog.get(kind, entity_id).is_none() {
            self.refresh_catalog(source)?;
        }
        let entry = self
            .catalog
            .get(kind, entity_id)
            .cloned()
            .ok_or_else(|| CanvasError::Catalog(format!("{} '{}' not found", kind, entity_id)))?;

        let node_id = self.graph.promote_placeholder(placeholder, &entry)?;
        let incident: Vec<Edge> = self
            .graph
            .edges()
            .filter(|e| e.touches(&node_id) && e.origin == EdgeOrigin::Explicit)
            .cloned()
            .collect();
        for edge in incident {
            if let Err(e) = self.apply_side_effect(&edge, patcher) {
                tracing::warn!(edge = %edge.id, error = %e, "could not update entity for promoted edge");
            }
        }
        self.recompute_derived();
        self.after_mutation();
        Ok(node_id)
    }

    /// Change a node's label locally. The entity keeps its name until
    /// [`save_label`](Self::save_label).
    pub fn rename_node(&mut self, id: &str, label: &str) -> Result<(), CanvasError> {
        self.graph.rename_node(id, label)?;
        self.after_mutation();
        Ok(())
    }

    /// Write a pending label back to the entity.
    pub fn save_label(&mut self, id: &str, patcher: &dyn EntityPatcher) -> Result<EntityRecord, CanvasError> {
        let node = self
            .graph
            .node(id)
            .ok_or_else(|| CanvasError::NodeNotFound(id.to_string()))?;
        let entity_id = node
            .entity_id()
            .ok_or_else(|| CanvasError::Patch(format!("node '{}' has no backing entity", id)))?;
        let mut fields = Map::new();
        fields.insert("name".to_string(), Value::String(node.label.clone()));
        let patch = EntityPatch {
            kind: node.kind,
            id: entity_id.to_string(),
            fields,
        };
        let record = self.apply_patch(patch, patcher)?;
        self.graph.commit_label(id)?;
        self.after_mutation();
        Ok(record)
    }

    // --- Refresh ---

    /// Refetch every entity list and bring the graph in line with it.
    pub fn refresh_catalog(&mut self, source: &dyn CatalogSource) -> Result<SyncSummary, CanvasError> {
        self.catalog = source.fetch_catalog(&self.org_id)?;
        self.catalog_loaded = true;
        let summary = self.graph.sync_catalog(&self.catalog);
        self.graph.mirror_bindings(&self.bindings);
        self.recompute_derived();
        self.after_mutation();
        tracing::info!(org = %self.org_id, entities = self.catalog.len(), "catalog refreshed");
        Ok(summary)
    }

    /// Refetch policy rules and bindings and recompute every derived edge.
    pub fn refresh_policies(&mut self, source: &dyn PolicySource) -> Result<DerivedSummary, CanvasError> {
        self.rules = source.list_policy_rules(&self.org_id)?;
        self.bindings = source.list_policy_bindings(&self.org_id)?;
        self.graph.mirror_bindings(&self.bindings);
        let summary = self.recompute_derived();
        self.after_mutation();
        Ok(summary)
    }

    fn recompute_derived(&mut self) -> DerivedSummary {
        let derived = PolicyResolver::new(
            &self.catalog,
            &self.rules,
            &self.bindings,
            self.settings.resolver_options(),
        )
        .resolve();
        self.graph.replace_derived_edges(&derived)
    }

    // --- Persistence ---

    /// Load the stored snapshot: primary store, then the fallback store on a
    /// primary error, then the current (initial) layout. Never fails.
    pub fn load(&mut self, primary: &dyn SnapshotStore, fallback: &dyn SnapshotStore) -> LoadReport {
        let mut errors = Vec::new();
        let found = match primary.load(&self.org_id) {
            Ok(Some(state)) => Some((LoadSource::Primary, state)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(org = %self.org_id, error = %e, "primary snapshot load failed, trying fallback");
                errors.push(e.to_string());
                match fallback.load(&self.org_id) {
                    Ok(found) => found.map(|state| (LoadSource::Fallback, state)),
                    Err(e) => {
                        tracing::warn!(org = %self.org_id, error = %e, "fallback snapshot load failed");
                        errors.push(e.to_string());
                        None
                    }
                }
            }
        };

        let report = match found {
            Some((source, state)) => {
                let summary = self.merge(&state);
                LoadReport {
                    source,
                    merge: Some(summary),
                    errors,
                }
            }
            None => LoadReport {
                source: LoadSource::Fresh,
                merge: None,
                errors,
            },
        };
        self.phase = MergePhase::Ongoing;
        report
    }

    /// Merge a snapshot that arrived from elsewhere (initial or background fetch).
    pub fn merge(&mut self, state: &CanvasState) -> MergeSummary {
        let summary = persist::reconcile(&mut self.graph, state, self.phase);
        if self.phase == MergePhase::Initial {
            self.viewport = state.viewport.clone().sanitize();
        }
        if self.catalog_loaded {
            // Drops adopted nodes whose entities no longer exist.
            self.graph.sync_catalog(&self.catalog);
            self.graph.mirror_bindings(&self.bindings);
            self.recompute_derived();
        }
        self.phase = MergePhase::Ongoing;
        self.collect_events();
        summary
    }

    pub fn snapshot(&self, saved_at: DateTime<Utc>) -> CanvasState {
        CanvasState::from_graph(&self.graph, &self.viewport, saved_at)
    }

    /// Write the snapshot now. A primary failure is recovered by writing the
    /// same snapshot to `fallback`; only both failing is an error.
    pub fn save_now(
        &mut self,
        primary: &dyn SnapshotStore,
        fallback: &dyn SnapshotStore,
    ) -> Result<SaveReport, CanvasError> {
        self.scheduler.cancel();
        let state = self.snapshot(Utc::now());
        match primary.save(&self.org_id, &state) {
            Ok(()) => {
                if let Err(e) = fallback.clear(&self.org_id) {
                    tracing::warn!(org = %self.org_id, error = %e, "could not clear fallback snapshot");
                }
                tracing::debug!(org = %self.org_id, nodes = state.nodes.len(), "saved canvas");
                Ok(SaveReport::Remote)
            }
            Err(primary_err) => {
                tracing::warn!(org = %self.org_id, error = %primary_err, "save failed, writing fallback copy");
                match fallback.save(&self.org_id, &state) {
                    Ok(()) => {
                        let error = primary_err.to_string();
                        self.push_events(vec![GraphEvent::SavedToFallback { error: error.clone() }]);
                        Ok(SaveReport::Fallback { error })
                    }
                    Err(fallback_err) => {
                        let error = format!("primary: {}; fallback: {}", primary_err, fallback_err);
                        self.push_events(vec![GraphEvent::SaveFailed { error: error.clone() }]);
                        Err(CanvasError::Store(error))
                    }
                }
            }
        }
    }

    /// Run the debounced save if its deadline has passed.
    pub fn flush_due(
        &mut self,
        now: Instant,
        primary: &dyn SnapshotStore,
        fallback: &dyn SnapshotStore,
    ) -> Result<Option<SaveReport>, CanvasError> {
        if !self.scheduler.take_due(now) {
            return Ok(None);
        }
        self.save_now(primary, fallback).map(Some)
    }

    pub fn export_document(&self) -> ExportDocument {
        let now = Utc::now();
        ExportDocument::new(&self.org_id, self.snapshot(now), now)
    }

    /// The downloadable `{version, exportedAt, orgId, canvas}` JSON.
    pub fn export(&self) -> Result<String, CanvasError> {
        Ok(serde_json::to_string_pretty(&self.export_document())?)
    }

    // --- Internals ---

    fn apply_side_effect(&mut self, edge: &Edge, patcher: &dyn EntityPatcher) -> Result<(), CanvasError> {
        let entity = |id: &str| self.graph.node(id).and_then(|n| n.entity_id().map(str::to_string));
        let (Some(source), Some(target)) = (entity(&edge.source), entity(&edge.target)) else {
            return Ok(());
        };
        match rules::entity_patch(edge.kind, &source, &target) {
            Some(patch) => {
                self.apply_patch(patch, patcher)?;
                self.recompute_derived();
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Clear the foreign key an explicit edge implied, if the entity still
    /// points at the edge's other end.
    fn release_side_effect(&mut self, edge: &Edge, patcher: &dyn EntityPatcher) -> Result<(), CanvasError> {
        if edge.origin != EdgeOrigin::Explicit {
            return Ok(());
        }
        let entity = |id: &str| self.graph.node(id).and_then(|n| n.entity_id().map(str::to_string));
        let (Some(source), Some(target)) = (entity(&edge.source), entity(&edge.target)) else {
            return Ok(());
        };
        let Some(patch) = rules::entity_patch(edge.kind, &source, &target) else {
            return Ok(());
        };
        let holds = self.catalog.get(patch.kind, &patch.id).is_some_and(|entry| {
            match serde_json::to_value(&entry.raw) {
                Ok(Value::Object(current)) => patch.fields.iter().all(|(k, v)| current.get(k) == Some(v)),
                _ => false,
            }
        });
        if holds {
            self.apply_patch(patch.cleared(), patcher)?;
            self.recompute_derived();
        }
        Ok(())
    }

    fn apply_patch(&mut self, patch: EntityPatch, patcher: &dyn EntityPatcher) -> Result<EntityRecord, CanvasError> {
        let record = patcher.patch_entity(&self.org_id, patch.kind, &patch.id, &patch.fields)?;
        let entry = CatalogEntry::from_record(patch.kind, record.clone());
        self.graph.refresh_node(&entry);
        self.catalog.upsert(entry);
        tracing::debug!(kind = %patch.kind, id = %patch.id, "patched entity");
        Ok(record)
    }

    fn collect_events(&mut self) {
        let fresh = self.graph.drain_events();
        self.push_events(fresh);
    }

    fn push_events(&mut self, fresh: Vec<GraphEvent>) {
        self.events.extend(fresh);
        if self.events.len() > MAX_PENDING_EVENTS {
            let excess = self.events.len() - MAX_PENDING_EVENTS;
            self.events.drain(..excess);
            tracing::debug!(org = %self.org_id, dropped = excess, "event outbox full, dropped oldest events");
        }
    }

    /// Move fresh graph events to the outbox and restart the save debounce
    /// if anything changed.
    fn after_mutation(&mut self) {
        let fresh = self.graph.drain_events();
        if !fresh.is_empty() {
            self.scheduler.schedule(Instant::now());
            self.push_events(fresh);
        }
    }
}
