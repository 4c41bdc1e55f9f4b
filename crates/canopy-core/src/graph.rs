//! The in-memory canvas graph.
//!
//! All edge construction goes through [`CanvasGraph::validate_edge`], which
//! consults the compatibility matrix. Every mutation records a
//! [`GraphEvent`] that the interaction surface drains.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::catalog::{CatalogEntry, EntityCatalog, EntityRecord};
use crate::error::{CanvasError, ValidationError};
use crate::layout::{self, ArrangeItem, LayoutConfig, PlacementItem};
use crate::policy::{DerivedEdge, PolicyBinding, RuleEffect};
use crate::rules::{self, EdgeKind};
use crate::{EntityKind, NodeStatus, Position};

pub const PLACEHOLDER_PREFIX: &str = "new-";

/// Node id of an entity-backed node.
pub fn entity_node_id(kind: EntityKind, entity_id: &str) -> String {
    format!("{}-{}", kind, entity_id)
}

pub fn placeholder_node_id(kind: EntityKind, timestamp_ms: i64) -> String {
    format!("{}{}-{}", PLACEHOLDER_PREFIX, kind, timestamp_ms)
}

/// Edge ids double as the de-duplication key for a (source, target) pair.
pub fn edge_id(source: &str, target: &str) -> String {
    format!("{}-{}", source, target)
}

// --- Nodes ---

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub kind: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityRecord>,
    pub label: String,
    pub status: NodeStatus,
    position: Position,
    /// Position was changed locally since the last merge that could overwrite it.
    pub dirty: bool,
    /// Label was edited locally and not yet written back to the entity.
    pub label_pending: bool,
}

impl Node {
    pub fn from_entry(entry: &CatalogEntry, position: Position) -> Self {
        Self {
            id: entry.node_id(),
            kind: entry.kind,
            entity: Some(entry.raw.clone()),
            label: entry.display_name.clone(),
            status: entry.status(),
            position: position.sanitize(Position::ORIGIN),
            dirty: false,
            label_pending: false,
        }
    }

    pub fn placeholder(kind: EntityKind, timestamp_ms: i64, position: Position) -> Self {
        Self {
            id: placeholder_node_id(kind, timestamp_ms),
            kind,
            entity: None,
            label: format!("New {}", kind),
            status: NodeStatus::Unknown,
            position: position.sanitize(Position::ORIGIN),
            dirty: false,
            label_pending: false,
        }
    }

    /// A node known only from a stored snapshot; the catalog fills it in later.
    pub fn adopted(id: impl Into<String>, kind: EntityKind, position: Position) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            entity: None,
            status: NodeStatus::Unknown,
            position: position.sanitize(Position::ORIGIN),
            dirty: false,
            label_pending: false,
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn is_placeholder(&self) -> bool {
        self.id.starts_with(PLACEHOLDER_PREFIX)
    }

    /// Id of the backing entity, taken from the record or the node id.
    pub fn entity_id(&self) -> Option<&str> {
        if let Some(entity) = &self.entity {
            return Some(entity.id.as_str());
        }
        if self.is_placeholder() {
            return None;
        }
        self.id
            .strip_prefix(self.kind.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
    }

    fn set_position(&mut self, position: Position) {
        self.position = position.sanitize(Position::ORIGIN);
    }

    fn refresh_from(&mut self, entry: &CatalogEntry) -> bool {
        let before = (self.label.clone(), self.status, self.entity.clone());
        if !self.label_pending {
            self.label = entry.display_name.clone();
        }
        self.status = entry.status();
        self.entity = Some(entry.raw.clone());
        before != (self.label.clone(), self.status, self.entity.clone())
    }
}

// --- Edges ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeOrigin {
    #[default]
    Explicit,
    Derived,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeConfig {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<RuleEffect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            allowed: true,
            effect: None,
            permissions: None,
            rule_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EdgeMetadata {
    pub policy_governed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    pub origin: EdgeOrigin,
    pub config: EdgeConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub metadata: EdgeMetadata,
}

impl Edge {
    fn explicit(source: &str, target: &str, kind: EdgeKind, config: EdgeConfig) -> Self {
        Self {
            id: edge_id(source, target),
            source: source.to_string(),
            target: target.to_string(),
            kind,
            origin: EdgeOrigin::Explicit,
            config,
            label: None,
            metadata: EdgeMetadata::default(),
        }
    }

    fn derived(derived: &DerivedEdge, kind: EdgeKind) -> Self {
        let grant = &derived.grant;
        Self {
            id: edge_id(&derived.source, &derived.target),
            source: derived.source.clone(),
            target: derived.target.clone(),
            kind,
            origin: EdgeOrigin::Derived,
            config: EdgeConfig {
                allowed: true,
                effect: Some(RuleEffect::Allow),
                permissions: Some(grant.action.split(',').map(str::to_string).collect()),
                rule_id: grant.rule_ids.first().cloned(),
            },
            label: Some(grant.policy_name.clone()),
            metadata: EdgeMetadata {
                policy_governed: true,
                policy_id: Some(grant.policy_id.clone()),
            },
        }
    }

    pub fn touches(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }
}

// --- Events ---

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum GraphEvent {
    NodeAdded { id: String },
    NodeUpdated { id: String },
    NodeMoved { id: String, position: Position },
    NodeRemoved { id: String },
    EdgeAdded { id: String },
    EdgeUpdated { id: String },
    EdgeRemoved { id: String },
    Arranged,
    /// The primary store rejected a save; the snapshot went to the fallback.
    SavedToFallback { error: String },
    /// Neither store accepted the snapshot.
    SaveFailed { error: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NeighborSide {
    /// Right-hand neighbor: the anchor is the edge source.
    Child,
    /// Left-hand neighbor: the anchor is the edge target.
    Parent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Listed entities left off the canvas because they were deleted locally.
    pub suppressed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DerivedSummary {
    pub applied: usize,
    pub removed: usize,
    pub skipped: usize,
}

// --- Graph ---

#[derive(Debug, Clone, Default)]
pub struct CanvasGraph {
    nodes: BTreeMap<String, Node>,
    edges: BTreeMap<String, Edge>,
    /// Ids removed locally; a stale snapshot or a catalog refresh must not
    /// bring them back.
    tombstones: HashSet<String>,
    /// Tombstoned ids seen missing from the catalog. Such an entity may come
    /// back if the catalog lists it again.
    departed: HashSet<String>,
    /// Explicit edges deleted locally. Mirroring skips them while the key
    /// that implied them is still present.
    severed: HashMap<String, EdgeKind>,
    events: Vec<GraphEvent>,
    layout: LayoutConfig,
}

impl CanvasGraph {
    pub fn new(layout: LayoutConfig) -> Self {
        Self {
            layout,
            ..Self::default()
        }
    }

    pub fn layout(&self) -> &LayoutConfig {
        &self.layout
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn kind_of(&self, id: &str) -> Option<EntityKind> {
        self.nodes.get(id).map(|n| n.kind)
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    pub fn is_severed(&self, edge_id: &str) -> bool {
        self.severed.contains_key(edge_id)
    }

    /// Local deletions that the catalog would otherwise undo: node ids of
    /// entities still listed, and severed edge ids. Both sorted.
    pub fn local_removals(&self) -> (Vec<String>, Vec<String>) {
        let mut nodes: Vec<String> = self
            .tombstones
            .iter()
            .filter(|id| !self.departed.contains(*id))
            .cloned()
            .collect();
        nodes.sort();
        let mut edges: Vec<String> = self.severed.keys().cloned().collect();
        edges.sort();
        (nodes, edges)
    }

    /// Tombstone an id that is not on the canvas right now.
    pub(crate) fn tombstone(&mut self, id: &str) {
        if !id.starts_with(PLACEHOLDER_PREFIX) {
            self.tombstones.insert(id.to_string());
        }
    }

    pub fn positions(&self) -> HashMap<String, Position> {
        self.nodes
            .values()
            .map(|n| (n.id.clone(), n.position))
            .collect()
    }

    /// Take every event recorded since the last drain.
    pub fn drain_events(&mut self) -> Vec<GraphEvent> {
        std::mem::take(&mut self.events)
    }

    // --- Node mutations ---

    pub fn insert_node(&mut self, mut node: Node) -> Result<(), CanvasError> {
        if self.nodes.contains_key(&node.id) {
            return Err(CanvasError::DuplicateNode(node.id));
        }
        node.set_position(node.position);
        self.tombstones.remove(&node.id);
        self.departed.remove(&node.id);
        self.events.push(GraphEvent::NodeAdded {
            id: node.id.clone(),
        });
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// User-driven move: sanitizes the position and marks the node dirty.
    pub fn move_node(&mut self, id: &str, position: Position) -> Result<Position, CanvasError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| CanvasError::NodeNotFound(id.to_string()))?;
        node.set_position(position);
        node.dirty = true;
        let position = node.position;
        self.events.push(GraphEvent::NodeMoved {
            id: id.to_string(),
            position,
        });
        Ok(position)
    }

    /// Position write that is not a user edit (remote merge). Leaves `dirty` alone.
    pub(crate) fn adopt_position(&mut self, id: &str, position: Position) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        let before = node.position;
        node.set_position(position);
        if node.position != before {
            self.events.push(GraphEvent::NodeMoved {
                id: id.to_string(),
                position: node.position,
            });
        }
        true
    }

    /// Remove a node and, in the same step, every edge touching it.
    pub fn delete_node(&mut self, id: &str) -> Result<Node, CanvasError> {
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| CanvasError::NodeNotFound(id.to_string()))?;
        let incident: Vec<String> = self
            .edges
            .values()
            .filter(|e| e.touches(id))
            .map(|e| e.id.clone())
            .collect();
        for edge_id in incident {
            self.edges.remove(&edge_id);
            self.events.push(GraphEvent::EdgeRemoved { id: edge_id });
        }
        if !node.is_placeholder() {
            self.tombstones.insert(node.id.clone());
        }
        self.events.push(GraphEvent::NodeRemoved {
            id: id.to_string(),
        });
        tracing::debug!(node = id, "deleted node");
        Ok(node)
    }

    pub fn rename_node(&mut self, id: &str, label: &str) -> Result<(), CanvasError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| CanvasError::NodeNotFound(id.to_string()))?;
        node.label = label.to_string();
        node.label_pending = true;
        self.events.push(GraphEvent::NodeUpdated { id: id.to_string() });
        Ok(())
    }

    /// Mark a pending label as saved. Returns the node's kind, entity id
    /// and label for the write-back.
    pub fn commit_label(&mut self, id: &str) -> Result<(EntityKind, String, String), CanvasError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| CanvasError::NodeNotFound(id.to_string()))?;
        let entity_id = node
            .entity_id()
            .map(str::to_string)
            .ok_or_else(|| CanvasError::NodeNotFound(id.to_string()))?;
        node.label_pending = false;
        if let Some(entity) = node.entity.as_mut() {
            entity.name = node.label.clone();
        }
        Ok((node.kind, entity_id, node.label.clone()))
    }

    // --- Edge construction ---

    /// Resolve the edge kind for a proposed connection, or reject it.
    pub fn validate_edge(
        &self,
        source: &str,
        target: &str,
        requested: Option<EdgeKind>,
    ) -> Result<EdgeKind, ValidationError> {
        let source_kind = self
            .kind_of(source)
            .ok_or_else(|| ValidationError::UnknownNode(source.to_string()))?;
        let target_kind = self
            .kind_of(target)
            .ok_or_else(|| ValidationError::UnknownNode(target.to_string()))?;
        match requested {
            Some(kind) if rules::is_legal(kind, source_kind, target_kind) => Ok(kind),
            Some(kind) => Err(ValidationError::InvalidEdgeKind {
                kind,
                source_kind,
                target_kind,
            }),
            None => rules::default_kind(source_kind, target_kind).ok_or(
                ValidationError::NoLegalEdgeKind {
                    source_kind,
                    target_kind,
                },
            ),
        }
    }

    /// Insert an explicit edge. Re-inserting an existing pair is a no-op that
    /// returns the edge already present.
    pub fn insert_edge(
        &mut self,
        source: &str,
        target: &str,
        requested: Option<EdgeKind>,
    ) -> Result<Edge, ValidationError> {
        self.insert_explicit(source, target, requested, EdgeConfig::default())
    }

    /// [`insert_edge`](Self::insert_edge) carrying a stored config.
    pub(crate) fn insert_explicit(
        &mut self,
        source: &str,
        target: &str,
        requested: Option<EdgeKind>,
        config: EdgeConfig,
    ) -> Result<Edge, ValidationError> {
        let kind = self.validate_edge(source, target, requested)?;
        let id = edge_id(source, target);
        if let Some(existing) = self.edges.get(&id) {
            return Ok(existing.clone());
        }
        let edge = Edge::explicit(source, target, kind, config);
        self.severed.remove(&id);
        self.events.push(GraphEvent::EdgeAdded { id: id.clone() });
        self.edges.insert(id, edge.clone());
        Ok(edge)
    }

    /// Insert or refresh a policy-derived edge. Derived edges replace earlier
    /// derived edges for the same pair; an explicit edge is left untouched.
    pub fn insert_derived_edge(&mut self, derived: &DerivedEdge) -> Result<Edge, ValidationError> {
        let kind = self.validate_edge(&derived.source, &derived.target, Some(derived.kind))?;
        let edge = Edge::derived(derived, kind);
        match self.edges.get_mut(&edge.id) {
            Some(existing) if existing.origin == EdgeOrigin::Explicit => Ok(existing.clone()),
            Some(existing) => {
                if *existing != edge {
                    *existing = edge.clone();
                    self.events.push(GraphEvent::EdgeUpdated {
                        id: edge.id.clone(),
                    });
                }
                Ok(edge)
            }
            None => {
                self.events.push(GraphEvent::EdgeAdded {
                    id: edge.id.clone(),
                });
                self.edges.insert(edge.id.clone(), edge.clone());
                Ok(edge)
            }
        }
    }

    /// Replace the whole derived edge set. Derived edges not in `derived`
    /// are removed.
    pub fn replace_derived_edges(&mut self, derived: &[DerivedEdge]) -> DerivedSummary {
        let wanted: HashSet<String> = derived
            .iter()
            .map(|d| edge_id(&d.source, &d.target))
            .collect();
        let stale: Vec<String> = self
            .edges
            .values()
            .filter(|e| e.origin == EdgeOrigin::Derived && !wanted.contains(&e.id))
            .map(|e| e.id.clone())
            .collect();
        for id in &stale {
            self.edges.remove(id);
            self.events.push(GraphEvent::EdgeRemoved { id: id.clone() });
        }

        let mut summary = DerivedSummary {
            removed: stale.len(),
            ..DerivedSummary::default()
        };
        for d in derived {
            match self.insert_derived_edge(d) {
                Ok(_) => summary.applied += 1,
                Err(e) => {
                    summary.skipped += 1;
                    tracing::debug!(source = %d.source, target = %d.target, error = %e, "skipped derived edge");
                }
            }
        }
        summary
    }

    /// Remove one edge. A deleted explicit edge is not mirrored back from
    /// the catalog until it is connected again.
    pub fn delete_edge(&mut self, id: &str) -> Result<Edge, CanvasError> {
        let edge = self
            .edges
            .remove(id)
            .ok_or_else(|| CanvasError::EdgeNotFound(id.to_string()))?;
        if edge.origin == EdgeOrigin::Explicit {
            self.severed.insert(edge.id.clone(), edge.kind);
        }
        self.events.push(GraphEvent::EdgeRemoved { id: id.to_string() });
        Ok(edge)
    }

    /// Insert an edge implied by catalog data unless the user removed it
    /// or one of its ends.
    fn insert_mirrored(&mut self, source: &str, target: &str, kind: EdgeKind) -> bool {
        if self.severed.contains_key(&edge_id(source, target))
            || self.tombstones.contains(source)
            || self.tombstones.contains(target)
        {
            return false;
        }
        self.insert_edge(source, target, Some(kind)).is_ok()
    }

    /// Point an edge at a new source/target pair. A policy-governed edge
    /// becomes an explicit, user-owned edge in the process.
    pub fn retarget_edge(
        &mut self,
        id: &str,
        source: &str,
        target: &str,
    ) -> Result<Edge, CanvasError> {
        let old = self
            .edges
            .get(id)
            .cloned()
            .ok_or_else(|| CanvasError::EdgeNotFound(id.to_string()))?;
        let kind = self.validate_edge(source, target, None)?;
        let config = match old.origin {
            EdgeOrigin::Explicit => old.config.clone(),
            EdgeOrigin::Derived => EdgeConfig::default(),
        };
        self.delete_edge(id)?;
        Ok(self.insert_explicit(source, target, Some(kind), config)?)
    }

    // --- Placeholders ---

    /// Add a transient node awaiting entity creation. Returns its id.
    pub fn create_placeholder(
        &mut self,
        kind: EntityKind,
        position: Position,
        timestamp_ms: i64,
    ) -> String {
        let mut ts = timestamp_ms;
        while self.nodes.contains_key(&placeholder_node_id(kind, ts)) {
            ts += 1;
        }
        let node = Node::placeholder(kind, ts, position);
        let id = node.id.clone();
        self.events.push(GraphEvent::NodeAdded { id: id.clone() });
        self.nodes.insert(id.clone(), node);
        id
    }

    /// Create a placeholder next to `anchor` together with the edge joining
    /// them. Either both exist afterwards or neither does.
    pub fn create_neighbor(
        &mut self,
        anchor: &str,
        kind: EntityKind,
        side: NeighborSide,
        timestamp_ms: i64,
    ) -> Result<(String, Edge), CanvasError> {
        let anchor_node = self
            .nodes
            .get(anchor)
            .ok_or_else(|| CanvasError::NodeNotFound(anchor.to_string()))?;
        let anchor_kind = anchor_node.kind;
        let allowed = match side {
            NeighborSide::Child => rules::allowed_child_kinds(anchor_kind),
            NeighborSide::Parent => rules::allowed_parent_kinds(anchor_kind),
        };
        if !allowed.contains(&kind) {
            return Err(ValidationError::NotCreatable {
                anchor: anchor_kind,
                kind,
            }
            .into());
        }

        let siblings = self
            .edges
            .values()
            .filter(|e| match side {
                NeighborSide::Child => e.source == anchor,
                NeighborSide::Parent => e.target == anchor,
            })
            .count();
        let (w, h) = layout::node_size(kind);
        let dx = self.layout.tool_offset_x.max(w + self.layout.spacing);
        let dy = siblings as f64 * (h + self.layout.spacing);
        let position = match side {
            NeighborSide::Child => anchor_node.position.offset(dx, dy),
            NeighborSide::Parent => anchor_node.position.offset(-dx, dy),
        };

        let id = self.create_placeholder(kind, position, timestamp_ms);
        let (source, target) = match side {
            NeighborSide::Child => (anchor, id.as_str()),
            NeighborSide::Parent => (id.as_str(), anchor),
        };
        match self.insert_edge(source, target, None) {
            Ok(edge) => Ok((id, edge)),
            Err(e) => {
                self.nodes.remove(&id);
                self.events.push(GraphEvent::NodeRemoved { id });
                Err(e.into())
            }
        }
    }

    /// Discard a placeholder and its would-be edges.
    pub fn cancel_placeholder(&mut self, id: &str) -> Result<(), CanvasError> {
        match self.nodes.get(id) {
            Some(n) if n.is_placeholder() => {}
            Some(_) => return Err(CanvasError::NotPlaceholder(id.to_string())),
            None => return Err(CanvasError::NodeNotFound(id.to_string())),
        }
        self.delete_node(id)?;
        Ok(())
    }

    /// Replace a placeholder with the entity-backed node created for it,
    /// moving its position and edges over. Returns the new node id.
    pub fn promote_placeholder(
        &mut self,
        placeholder: &str,
        entry: &CatalogEntry,
    ) -> Result<String, CanvasError> {
        let node = match self.nodes.get(placeholder) {
            Some(n) if n.is_placeholder() => n.clone(),
            Some(_) => return Err(CanvasError::NotPlaceholder(placeholder.to_string())),
            None => return Err(CanvasError::NodeNotFound(placeholder.to_string())),
        };
        if node.kind != entry.kind {
            return Err(CanvasError::Catalog(format!(
                "placeholder '{}' is a {} but the created entity is a {}",
                placeholder, node.kind, entry.kind
            )));
        }

        let incident: Vec<Edge> = self
            .edges
            .values()
            .filter(|e| e.touches(placeholder))
            .cloned()
            .collect();
        self.delete_node(placeholder)?;

        let new_id = entry.node_id();
        match self.nodes.get_mut(&new_id) {
            Some(existing) => {
                existing.refresh_from(entry);
                existing.set_position(node.position);
                existing.dirty = true;
                self.events.push(GraphEvent::NodeUpdated { id: new_id.clone() });
            }
            None => {
                let mut promoted = Node::from_entry(entry, node.position);
                promoted.dirty = true;
                self.insert_node(promoted)?;
            }
        }

        for edge in incident {
            let swap = |end: &str| {
                if end == placeholder {
                    new_id.clone()
                } else {
                    end.to_string()
                }
            };
            let (source, target) = (swap(&edge.source), swap(&edge.target));
            if let Err(e) = self.insert_explicit(&source, &target, Some(edge.kind), edge.config) {
                tracing::warn!(edge = %edge.id, error = %e, "dropped edge while promoting placeholder");
            }
        }
        tracing::debug!(placeholder, node = %new_id, "promoted placeholder");
        Ok(new_id)
    }

    // --- Catalog lifecycle ---

    /// Bring the node set in line with the catalog: create nodes for new
    /// entities, refresh existing ones in place, drop vanished ones, and
    /// mirror foreign keys as explicit edges.
    ///
    /// Entities deleted on the canvas stay off it while the catalog keeps
    /// listing them; they return only after leaving the catalog and being
    /// listed again.
    pub fn sync_catalog(&mut self, catalog: &EntityCatalog) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let mut fresh: Vec<&CatalogEntry> = Vec::new();
        let known: HashSet<String> = catalog.entries().iter().map(|e| e.node_id()).collect();

        for id in &self.tombstones {
            if !known.contains(id) {
                self.departed.insert(id.clone());
            }
        }

        for entry in catalog.entries() {
            let id = entry.node_id();
            match self.nodes.get_mut(&id) {
                Some(node) => {
                    if node.refresh_from(entry) {
                        summary.updated += 1;
                        self.events.push(GraphEvent::NodeUpdated { id });
                    }
                }
                None if self.tombstones.contains(&id) && !self.departed.contains(&id) => {
                    summary.suppressed += 1;
                }
                None => fresh.push(entry),
            }
        }

        let items: Vec<PlacementItem> = fresh
            .iter()
            .map(|entry| PlacementItem {
                node_id: entry.node_id(),
                kind: entry.kind,
                connection_node_id: match entry.kind {
                    EntityKind::Tool => entry
                        .raw
                        .connection_id
                        .as_deref()
                        .map(|c| entity_node_id(EntityKind::Server, c)),
                    _ => None,
                },
            })
            .collect();
        let placed: HashMap<String, Position> =
            layout::initial_positions(&items, &self.positions(), &self.layout)
                .into_iter()
                .collect();
        for entry in fresh {
            let position = placed
                .get(&entry.node_id())
                .copied()
                .unwrap_or(Position::ORIGIN);
            if self.insert_node(Node::from_entry(entry, position)).is_ok() {
                summary.added += 1;
            }
        }

        let vanished: Vec<String> = self
            .nodes
            .values()
            .filter(|n| !n.is_placeholder() && !known.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        for id in vanished {
            if self.delete_node(&id).is_ok() {
                self.departed.insert(id);
                summary.removed += 1;
            }
        }

        let mut implied = HashSet::new();
        for entry in catalog.entries() {
            for (source, target, kind) in mirrored_links(entry) {
                implied.insert(edge_id(&source, &target));
                // Links to entities outside the canvas are expected; skip them.
                self.insert_mirrored(&source, &target, kind);
            }
        }
        self.severed
            .retain(|id, kind| *kind == EdgeKind::PolicyAgent || implied.contains(id));

        tracing::debug!(
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            suppressed = summary.suppressed,
            "synced catalog"
        );
        summary
    }

    /// Refresh one entity-backed node after its record changed.
    pub fn refresh_node(&mut self, entry: &CatalogEntry) -> bool {
        let id = entry.node_id();
        let changed = self
            .nodes
            .get_mut(&id)
            .is_some_and(|node| node.refresh_from(entry));
        if changed {
            self.events.push(GraphEvent::NodeUpdated { id });
        }
        changed
    }

    /// Mirror agent-scoped policy bindings as policy → agent edges.
    pub fn mirror_bindings(&mut self, bindings: &[PolicyBinding]) -> usize {
        let mut inserted = 0;
        let mut implied = HashSet::new();
        for binding in bindings {
            let Some(agent_id) = binding.agent_id.as_deref() else {
                continue;
            };
            let source = entity_node_id(EntityKind::Policy, &binding.policy_id);
            let target = entity_node_id(EntityKind::Agent, agent_id);
            implied.insert(edge_id(&source, &target));
            if self.insert_mirrored(&source, &target, EdgeKind::PolicyAgent) {
                inserted += 1;
            }
        }
        self.severed
            .retain(|id, kind| *kind != EdgeKind::PolicyAgent || implied.contains(id));
        inserted
    }

    // --- Layout ---

    /// Lane auto-arrange over every node. Arranged nodes count as locally moved.
    pub fn arrange_lanes(&mut self) {
        let placed = {
            let items: Vec<ArrangeItem<'_>> = self
                .nodes
                .values()
                .map(|n| ArrangeItem {
                    id: &n.id,
                    kind: n.kind,
                    label: &n.label,
                })
                .collect();
            layout::arrange_lanes(&items, &self.layout)
        };
        for (id, position) in placed {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.set_position(position);
                node.dirty = true;
            }
        }
        self.events.push(GraphEvent::Arranged);
    }
}

/// Explicit edges implied by an entity's foreign keys, as node ids.
fn mirrored_links(entry: &CatalogEntry) -> Vec<(String, String, EdgeKind)> {
    let me = entry.node_id();
    let raw = &entry.raw;
    let env = |id: &String| entity_node_id(EntityKind::Environment, id);
    let mut links = Vec::new();
    match entry.kind {
        EntityKind::Agent => {
            if let Some(c) = &raw.connection_id {
                links.push((me.clone(), entity_node_id(EntityKind::Server, c), EdgeKind::AgentServer));
            }
            if let Some(e) = &raw.environment_id {
                links.push((me.clone(), env(e), EdgeKind::AgentEnvironment));
            }
        }
        EntityKind::Tool => {
            if let Some(c) = &raw.connection_id {
                links.push((entity_node_id(EntityKind::Server, c), me.clone(), EdgeKind::ServerTool));
            }
        }
        EntityKind::Server => {
            if let Some(e) = &raw.environment_id {
                links.push((env(e), me.clone(), EdgeKind::EnvironmentServer));
            }
        }
        EntityKind::Policy => {
            if let Some(e) = &raw.environment_id {
                links.push((env(e), me.clone(), EdgeKind::EnvironmentPolicy));
            }
        }
        EntityKind::Resource => {
            if let Some(e) = &raw.environment_id {
                links.push((env(e), me.clone(), EdgeKind::EnvironmentResource));
            }
        }
        EntityKind::Prompt => {
            if let Some(e) = &raw.environment_id {
                links.push((env(e), me.clone(), EdgeKind::EnvironmentPrompt));
            }
            for r in &raw.resource_ids {
                links.push((me.clone(), entity_node_id(EntityKind::Resource, r), EdgeKind::PromptResource));
            }
        }
        EntityKind::Environment => {
            if let Some(o) = &raw.organization_id {
                links.push((entity_node_id(EntityKind::Organization, o), me.clone(), EdgeKind::OrganizationEnvironment));
            }
        }
        EntityKind::Organization => {}
    }
    links
}
