//! Snapshot schema, merge of stored snapshots into the live graph, and the
//! debounce that decides when the next save happens.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::graph::{CanvasGraph, EdgeConfig, EdgeOrigin, Node};
use crate::layout::lenient_position;
use crate::rules::EdgeKind;
use crate::{EntityKind, Position};

pub const EXPORT_VERSION: u32 = 1;

// --- Snapshot schema ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Viewport {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "default_zoom")]
    pub zoom: f64,
}

fn default_zoom() -> f64 {
    1.0
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            zoom: 1.0,
        }
    }
}

impl Viewport {
    pub fn sanitize(self) -> Viewport {
        let zoom = if self.zoom.is_finite() && self.zoom > 0.0 {
            self.zoom
        } else {
            1.0
        };
        let pan = Position::new(self.x, self.y).sanitize(Position::ORIGIN);
        Viewport {
            x: pan.x,
            y: pan.y,
            zoom,
        }
    }
}

/// Node reference data: the kind plus the one id field matching it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredNodeData {
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
}

impl StoredNodeData {
    pub fn new(kind: EntityKind, entity_id: Option<&str>) -> Self {
        let mut data = Self {
            kind,
            agent_id: None,
            tool_id: None,
            resource_id: None,
            policy_id: None,
            prompt_id: None,
            connection_id: None,
            environment_id: None,
            organization_id: None,
        };
        if let Some(id) = entity_id {
            *data.slot_mut() = Some(id.to_string());
        }
        data
    }

    fn slot_mut(&mut self) -> &mut Option<String> {
        match self.kind {
            EntityKind::Agent => &mut self.agent_id,
            EntityKind::Tool => &mut self.tool_id,
            EntityKind::Resource => &mut self.resource_id,
            EntityKind::Policy => &mut self.policy_id,
            EntityKind::Prompt => &mut self.prompt_id,
            EntityKind::Server => &mut self.connection_id,
            EntityKind::Environment => &mut self.environment_id,
            EntityKind::Organization => &mut self.organization_id,
        }
    }

    pub fn entity_id(&self) -> Option<&str> {
        let slot = match self.kind {
            EntityKind::Agent => &self.agent_id,
            EntityKind::Tool => &self.tool_id,
            EntityKind::Resource => &self.resource_id,
            EntityKind::Policy => &self.policy_id,
            EntityKind::Prompt => &self.prompt_id,
            EntityKind::Server => &self.connection_id,
            EntityKind::Environment => &self.environment_id,
            EntityKind::Organization => &self.organization_id,
        };
        slot.as_deref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredNode {
    pub id: String,
    #[serde(default, deserialize_with = "lenient_position")]
    pub position: Position,
    pub data: StoredNodeData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredEdgeData {
    #[serde(default)]
    pub config: EdgeConfig,
    #[serde(default)]
    pub origin: EdgeOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
    #[serde(default)]
    pub data: StoredEdgeData,
}

/// Read a list one entry at a time. Entries that do not parse (an edge
/// kind or node kind this build does not know) are dropped, not fatal.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let items = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(other) => {
            tracing::warn!(found = %other, "snapshot list is not an array, ignoring it");
            return Ok(Vec::new());
        }
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(error = %e, "dropped unreadable snapshot entry");
                None
            }
        })
        .collect())
}

/// The persisted unit: positions and topology, never entity payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanvasState {
    #[serde(default, deserialize_with = "lenient_list")]
    pub nodes: Vec<StoredNode>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub edges: Vec<StoredEdge>,
    #[serde(default)]
    pub viewport: Viewport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    /// Nodes deleted on the canvas whose entities the catalog still lists.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_nodes: Vec<String>,
    /// Explicit edges deleted on the canvas.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_edges: Vec<String>,
}

impl CanvasState {
    /// Snapshot the graph. Placeholders and edges touching them are left out.
    pub fn from_graph(graph: &CanvasGraph, viewport: &Viewport, saved_at: DateTime<Utc>) -> Self {
        let nodes: Vec<StoredNode> = graph
            .nodes()
            .filter(|n| !n.is_placeholder())
            .map(|n| StoredNode {
                id: n.id.clone(),
                position: n.position(),
                data: StoredNodeData::new(n.kind, n.entity_id()),
            })
            .collect();
        let edges = graph
            .edges()
            .filter(|e| {
                let persisted = |id: &str| graph.node(id).is_some_and(|n| !n.is_placeholder());
                persisted(&e.source) && persisted(&e.target)
            })
            .map(|e| StoredEdge {
                id: e.id.clone(),
                source: e.source.clone(),
                target: e.target.clone(),
                kind: e.kind,
                data: StoredEdgeData {
                    config: e.config.clone(),
                    origin: e.origin,
                    label: e.label.clone(),
                },
            })
            .collect();
        let (removed_nodes, removed_edges) = graph.local_removals();
        Self {
            nodes,
            edges,
            viewport: viewport.clone().sanitize(),
            saved_at: Some(saved_at),
            removed_nodes,
            removed_edges,
        }
    }
}

/// The downloadable export document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub org_id: String,
    pub canvas: CanvasState,
}

impl ExportDocument {
    pub fn new(org_id: &str, canvas: CanvasState, exported_at: DateTime<Utc>) -> Self {
        Self {
            version: EXPORT_VERSION,
            exported_at,
            org_id: org_id.to_string(),
            canvas,
        }
    }
}

// --- Merge ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePhase {
    /// First merge since the session started.
    Initial,
    Ongoing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSummary {
    pub adopted: usize,
    pub repositioned: usize,
    pub preserved: usize,
    pub skipped: usize,
    pub edges_adopted: usize,
    /// Local deletions replayed from the snapshot.
    pub removed: usize,
}

/// Merge a stored snapshot into the live graph.
///
/// - Unknown ids are adopted with `dirty = false`.
/// - Known ids take the stored position only during the initial merge and
///   only while the local node is clean.
/// - During an ongoing merge known nodes keep their local position.
/// - Tombstoned and placeholder ids are never adopted.
/// - Stored explicit edges are adopted during the initial merge only;
///   derived edges are always recomputed from policy instead.
/// - Stored deletions are replayed during the initial merge only.
pub fn reconcile(graph: &mut CanvasGraph, state: &CanvasState, phase: MergePhase) -> MergeSummary {
    let mut summary = MergeSummary::default();

    if phase == MergePhase::Initial {
        for id in &state.removed_edges {
            if graph.edge(id).is_some_and(|e| e.origin == EdgeOrigin::Explicit) && graph.delete_edge(id).is_ok() {
                summary.removed += 1;
            }
        }
        for id in &state.removed_nodes {
            if graph.node(id).is_some() {
                if graph.delete_node(id).is_ok() {
                    summary.removed += 1;
                }
            } else {
                graph.tombstone(id);
            }
        }
    }

    for stored in &state.nodes {
        let id = stored.id.as_str();
        if id.starts_with(crate::graph::PLACEHOLDER_PREFIX) || graph.is_tombstoned(id) {
            summary.skipped += 1;
            continue;
        }
        let local_dirty = graph.node(id).map(|n| n.dirty);
        match (local_dirty, phase) {
            (None, _) => {
                let node = Node::adopted(id, stored.data.kind, stored.position);
                if graph.insert_node(node).is_ok() {
                    summary.adopted += 1;
                }
            }
            (Some(false), MergePhase::Initial) => {
                graph.adopt_position(id, stored.position);
                summary.repositioned += 1;
            }
            (Some(_), _) => summary.preserved += 1,
        }
    }

    if phase == MergePhase::Initial {
        for edge in state.edges.iter().filter(|e| e.data.origin == EdgeOrigin::Explicit) {
            match graph.insert_explicit(&edge.source, &edge.target, Some(edge.kind), edge.data.config.clone()) {
                Ok(_) => summary.edges_adopted += 1,
                Err(e) => tracing::debug!(edge = %edge.id, error = %e, "skipped stored edge"),
            }
        }
    }

    tracing::debug!(
        ?phase,
        adopted = summary.adopted,
        repositioned = summary.repositioned,
        preserved = summary.preserved,
        skipped = summary.skipped,
        removed = summary.removed,
        "merged snapshot"
    );
    summary
}

// --- Save scheduling ---

/// Trailing-edge debounce: every mutation pushes the deadline out by the
/// full window, so a burst produces exactly one save after it ends.
#[derive(Debug, Clone)]
pub struct SaveScheduler {
    window: Duration,
    deadline: Option<Instant>,
}

impl SaveScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a mutation at `now`, replacing any pending deadline.
    pub fn schedule(&mut self, now: Instant) -> Instant {
        let deadline = now + self.window;
        self.deadline = Some(deadline);
        deadline
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Clear and report the deadline if it has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}

/// Where a save ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "target", rename_all = "camelCase")]
pub enum SaveReport {
    Remote,
    /// The primary store failed; the snapshot is held by the fallback store.
    Fallback { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogEntry, EntityRecord};
    use crate::layout::LayoutConfig;
    use chrono::TimeZone;

    fn graph_with(ids: &[(EntityKind, &str)]) -> CanvasGraph {
        let mut g = CanvasGraph::new(LayoutConfig::default());
        for (kind, id) in ids {
            let entry = CatalogEntry::from_record(*kind, EntityRecord::new(*id, *id));
            g.insert_node(Node::from_entry(&entry, Position::new(10.0, 10.0)))
                .unwrap();
        }
        g
    }

    fn stored(id: &str, kind: EntityKind, x: f64, y: f64) -> StoredNode {
        let entity = id.split_once('-').map(|(_, rest)| rest);
        StoredNode {
            id: id.into(),
            position: Position::new(x, y),
            data: StoredNodeData::new(kind, entity),
        }
    }

    fn snapshot(nodes: Vec<StoredNode>) -> CanvasState {
        CanvasState {
            nodes,
            ..CanvasState::default()
        }
    }

    #[test]
    fn snapshot_schema_uses_kind_specific_id_fields() {
        let g = graph_with(&[(EntityKind::Server, "c1"), (EntityKind::Agent, "a1")]);
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let state = CanvasState::from_graph(&g, &Viewport::default(), at);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["nodes"][0]["data"]["kind"], "agent");
        assert_eq!(json["nodes"][0]["data"]["agentId"], "a1");
        assert_eq!(json["nodes"][1]["data"]["connectionId"], "c1");
        assert_eq!(json["viewport"]["zoom"], 1.0);
        assert_eq!(json["savedAt"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn placeholders_are_not_persisted() {
        let mut g = graph_with(&[(EntityKind::Environment, "e")]);
        g.create_neighbor("environment-e", EntityKind::Server, crate::graph::NeighborSide::Child, 1)
            .unwrap();
        let state = CanvasState::from_graph(&g, &Viewport::default(), Utc::now());
        assert_eq!(state.nodes.len(), 1);
        assert!(state.edges.is_empty());
    }

    #[test]
    fn corrupt_positions_load_as_origin() {
        let raw = r#"{
            "nodes": [
                {"id": "agent-a", "position": {"x": "oops", "y": 5}, "data": {"kind": "agent", "agentId": "a"}},
                {"id": "tool-t", "data": {"kind": "tool", "toolId": "t"}}
            ],
            "edges": [],
            "viewport": {"x": 1, "y": 2, "zoom": 0}
        }"#;
        let state: CanvasState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.nodes[0].position, Position::ORIGIN);
        assert_eq!(state.nodes[1].position, Position::ORIGIN);
        assert_eq!(state.viewport.clone().sanitize().zoom, 1.0);
        assert_eq!(state.nodes[1].data.entity_id(), Some("t"));
    }

    #[test]
    fn unreadable_entries_are_dropped_not_fatal() {
        let raw = r#"{
            "nodes": [
                {"id": "agent-a", "position": {"x": 3, "y": 4}, "data": {"kind": "agent", "agentId": "a"}},
                {"id": "widget-w", "position": {"x": 1, "y": 1}, "data": {"kind": "widget"}}
            ],
            "edges": [
                {"id": "agent-a-tool-t", "source": "agent-a", "target": "tool-t", "type": "default"},
                {"id": "agent-a-tool-u", "source": "agent-a", "target": "tool-u", "type": "agent-tool"}
            ],
            "viewport": {"x": 0, "y": 0, "zoom": 1}
        }"#;
        let state: CanvasState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(state.nodes[0].position, Position::new(3.0, 4.0));
        assert_eq!(state.edges.len(), 1);
        assert_eq!(state.edges[0].kind, EdgeKind::AgentTool);

        let state: CanvasState = serde_json::from_str(r#"{"nodes": {"oops": 1}, "edges": null}"#).unwrap();
        assert!(state.nodes.is_empty());
        assert!(state.edges.is_empty());
    }

    #[test]
    fn local_deletions_are_saved_and_replayed_on_initial_merge() {
        let mut g = graph_with(&[(EntityKind::Agent, "a"), (EntityKind::Server, "c")]);
        g.insert_edge("agent-a", "server-c", None).unwrap();
        g.delete_edge("agent-a-server-c").unwrap();
        g.delete_node("agent-a").unwrap();
        let state = CanvasState::from_graph(&g, &Viewport::default(), Utc::now());
        assert_eq!(state.removed_nodes, vec!["agent-a".to_string()]);
        assert_eq!(state.removed_edges, vec!["agent-a-server-c".to_string()]);

        let mut reopened = graph_with(&[(EntityKind::Agent, "a"), (EntityKind::Server, "c")]);
        reopened.insert_edge("agent-a", "server-c", None).unwrap();
        let summary = reconcile(&mut reopened, &state, MergePhase::Initial);
        assert_eq!(summary.removed, 2);
        assert!(reopened.node("agent-a").is_none());
        assert!(reopened.is_tombstoned("agent-a"));
        assert!(reopened.is_severed("agent-a-server-c"));

        let mut later = graph_with(&[(EntityKind::Agent, "a")]);
        assert_eq!(reconcile(&mut later, &state, MergePhase::Ongoing).removed, 0);
        assert!(later.node("agent-a").is_some());
    }

    #[test]
    fn initial_merge_overwrites_clean_nodes_only() {
        let mut g = graph_with(&[(EntityKind::Agent, "a"), (EntityKind::Agent, "b")]);
        g.move_node("agent-b", Position::new(50.0, 50.0)).unwrap();
        let state = snapshot(vec![
            stored("agent-a", EntityKind::Agent, 300.0, 300.0),
            stored("agent-b", EntityKind::Agent, 400.0, 400.0),
            stored("agent-c", EntityKind::Agent, 500.0, 500.0),
        ]);
        let summary = reconcile(&mut g, &state, MergePhase::Initial);
        assert_eq!(summary.repositioned, 1);
        assert_eq!(summary.preserved, 1);
        assert_eq!(summary.adopted, 1);
        assert_eq!(g.node("agent-a").unwrap().position(), Position::new(300.0, 300.0));
        assert!(!g.node("agent-a").unwrap().dirty);
        assert_eq!(g.node("agent-b").unwrap().position(), Position::new(50.0, 50.0));
        let adopted = g.node("agent-c").unwrap();
        assert!(!adopted.dirty);
        assert_eq!(adopted.entity_id(), Some("c"));
    }

    #[test]
    fn ongoing_merge_never_moves_existing_nodes() {
        let mut g = graph_with(&[(EntityKind::Agent, "a"), (EntityKind::Agent, "b")]);
        g.move_node("agent-a", Position::new(7.0, 7.0)).unwrap();
        let state = snapshot(vec![
            stored("agent-a", EntityKind::Agent, 300.0, 300.0),
            stored("agent-b", EntityKind::Agent, 300.0, 300.0),
        ]);
        let summary = reconcile(&mut g, &state, MergePhase::Ongoing);
        assert_eq!(summary.preserved, 2);
        assert_eq!(g.node("agent-a").unwrap().position(), Position::new(7.0, 7.0));
        assert_eq!(g.node("agent-b").unwrap().position(), Position::new(10.0, 10.0));
    }

    #[test]
    fn tombstoned_and_placeholder_ids_are_not_adopted() {
        let mut g = graph_with(&[(EntityKind::Agent, "gone")]);
        g.delete_node("agent-gone").unwrap();
        let state = snapshot(vec![
            stored("agent-gone", EntityKind::Agent, 1.0, 1.0),
            stored("new-tool-5", EntityKind::Tool, 1.0, 1.0),
        ]);
        let summary = reconcile(&mut g, &state, MergePhase::Ongoing);
        assert_eq!(summary.skipped, 2);
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn stored_edges_are_validated_and_adopted_once() {
        let mut g = graph_with(&[(EntityKind::Agent, "a"), (EntityKind::Tool, "t")]);
        let mut state = snapshot(vec![]);
        state.edges = vec![
            StoredEdge {
                id: "agent-a-tool-t".into(),
                source: "agent-a".into(),
                target: "tool-t".into(),
                kind: EdgeKind::AgentTool,
                data: StoredEdgeData::default(),
            },
            StoredEdge {
                id: "tool-t-agent-a".into(),
                source: "tool-t".into(),
                target: "agent-a".into(),
                kind: EdgeKind::AgentTool,
                data: StoredEdgeData::default(),
            },
            StoredEdge {
                id: "agent-a-tool-x".into(),
                source: "agent-a".into(),
                target: "tool-x".into(),
                kind: EdgeKind::AgentTool,
                data: StoredEdgeData {
                    origin: EdgeOrigin::Derived,
                    ..StoredEdgeData::default()
                },
            },
        ];
        assert_eq!(reconcile(&mut g, &state, MergePhase::Ongoing).edges_adopted, 0);
        assert_eq!(g.edge_count(), 0);
        assert_eq!(reconcile(&mut g, &state, MergePhase::Initial).edges_adopted, 1);
        assert!(g.edge("agent-a-tool-t").is_some());
    }

    #[test]
    fn scheduler_resets_on_every_mutation() {
        let start = Instant::now();
        let mut s = SaveScheduler::new(Duration::from_millis(1000));
        s.schedule(start);
        s.schedule(start + Duration::from_millis(600));
        assert!(!s.is_due(start + Duration::from_millis(1200)));
        assert!(s.take_due(start + Duration::from_millis(1600)));
        assert!(!s.is_pending());
        assert!(!s.take_due(start + Duration::from_millis(5000)));

        s.schedule(start);
        s.cancel();
        assert!(!s.is_due(start + Duration::from_secs(10)));
    }

    #[test]
    fn export_document_shape() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let doc = ExportDocument::new("org-1", CanvasState::default(), at);
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["orgId"], "org-1");
        assert_eq!(json["exportedAt"], "2024-01-02T03:04:05Z");
        assert!(json["canvas"]["nodes"].as_array().unwrap().is_empty());
    }
}
