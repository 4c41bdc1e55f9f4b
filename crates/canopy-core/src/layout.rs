//! Node placement.
//!
//! Two algorithms live here:
//! - initial placement: one square-ish grid per entity kind, groups stacked
//!   vertically so they never overlap;
//! - lane auto-arrange: every kind belongs to one lane (a disjoint vertical
//!   band), nodes are sorted and packed inside their lane.
//!
//! Both run their output through [`Position::sanitize`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::{EntityKind, Position};

/// Kind order for initial placement.
pub const PLACEMENT_ORDER: [EntityKind; 8] = [
    EntityKind::Environment,
    EntityKind::Agent,
    EntityKind::Resource,
    EntityKind::Tool,
    EntityKind::Policy,
    EntityKind::Prompt,
    EntityKind::Server,
    EntityKind::Organization,
];

pub const MAX_NODE_WIDTH: f64 = 280.0;
pub const MAX_NODE_HEIGHT: f64 = 140.0;

/// Rendered footprint of a node of `kind` (width, height).
pub fn node_size(kind: EntityKind) -> (f64, f64) {
    match kind {
        EntityKind::Environment | EntityKind::Organization => (MAX_NODE_WIDTH, MAX_NODE_HEIGHT),
        EntityKind::Agent | EntityKind::Server => (240.0, 110.0),
        EntityKind::Policy | EntityKind::Prompt => (220.0, 100.0),
        EntityKind::Tool | EntityKind::Resource => (200.0, 80.0),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutConfig {
    pub origin: Position,
    /// Gap between grid cells.
    pub spacing: f64,
    /// Vertical gap between kind groups.
    pub section_gap: f64,
    /// Horizontal offset of a tool from its connection node.
    pub tool_offset_x: f64,
    pub lane_top: f64,
    pub lane_left: f64,
    pub lane_gap: f64,
    pub lane_columns: usize,
    pub lane_max_rows: usize,
    pub row_gap: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            origin: Position::new(100.0, 100.0),
            spacing: 40.0,
            section_gap: 120.0,
            tool_offset_x: 250.0,
            lane_top: 100.0,
            lane_left: 100.0,
            lane_gap: 120.0,
            lane_columns: 2,
            lane_max_rows: 8,
            row_gap: 30.0,
        }
    }
}

// --- Initial placement ---

/// A node that needs a first position.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementItem {
    pub node_id: String,
    pub kind: EntityKind,
    /// Node id of the owning connection, for tools.
    pub connection_node_id: Option<String>,
}

/// Place `items` in kind groups. `existing` holds positions of nodes already
/// on the canvas; new groups start below them and tools may snap next to
/// an existing connection node.
pub fn initial_positions(
    items: &[PlacementItem],
    existing: &HashMap<String, Position>,
    config: &LayoutConfig,
) -> Vec<(String, Position)> {
    let origin = config.origin.sanitize(Position::ORIGIN);
    let mut cursor_y = existing
        .values()
        .filter(|p| p.is_finite())
        .map(|p| p.y + MAX_NODE_HEIGHT + config.section_gap)
        .fold(origin.y, f64::max);

    let mut placed: Vec<(String, Position)> = Vec::with_capacity(items.len());
    let mut tools_per_connection: HashMap<&str, usize> = HashMap::new();

    for kind in PLACEMENT_ORDER {
        let group: Vec<&PlacementItem> = items.iter().filter(|i| i.kind == kind).collect();
        if group.is_empty() {
            continue;
        }
        let (w, h) = node_size(kind);
        let columns = (group.len() as f64).sqrt().ceil().max(1.0) as usize;
        let rows = group.len().div_ceil(columns);

        for (index, item) in group.iter().enumerate() {
            let row = index / columns;
            let col = index % columns;
            let grid = Position::new(
                origin.x + col as f64 * (w + config.spacing),
                cursor_y + row as f64 * (h + config.spacing),
            );

            let preferred = match (&item.kind, item.connection_node_id.as_deref()) {
                (EntityKind::Tool, Some(conn)) => existing.get(conn).map(|conn_pos| {
                    let idx = tools_per_connection.entry(conn).or_insert(0);
                    let pos = conn_pos.offset(config.tool_offset_x, *idx as f64 * (h + config.spacing));
                    *idx += 1;
                    pos
                }),
                _ => None,
            };
            let position = match preferred {
                Some(p) if p.is_finite() => p,
                _ => grid,
            };
            placed.push((item.node_id.clone(), position.sanitize(grid)));
        }

        cursor_y += rows as f64 * (h + config.spacing) + config.section_gap;
    }
    placed
}

// --- Lanes ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    Scope,
    Governance,
    Agents,
    Connections,
    Capabilities,
}

impl Lane {
    pub const ORDER: [Lane; 5] = [
        Lane::Scope,
        Lane::Governance,
        Lane::Agents,
        Lane::Connections,
        Lane::Capabilities,
    ];

    pub fn of(kind: EntityKind) -> Lane {
        match kind {
            EntityKind::Organization | EntityKind::Environment => Lane::Scope,
            EntityKind::Policy => Lane::Governance,
            EntityKind::Agent | EntityKind::Prompt => Lane::Agents,
            EntityKind::Server => Lane::Connections,
            EntityKind::Tool | EntityKind::Resource => Lane::Capabilities,
        }
    }

    fn index(&self) -> usize {
        Lane::ORDER.iter().position(|l| l == self).unwrap_or(0)
    }
}

fn column_width(config: &LayoutConfig) -> f64 {
    MAX_NODE_WIDTH + config.spacing
}

fn row_height(config: &LayoutConfig) -> f64 {
    MAX_NODE_HEIGHT + config.row_gap
}

/// Horizontal extent `[x, x + width)` of a lane.
pub fn lane_bounds(lane: Lane, config: &LayoutConfig) -> (f64, f64) {
    let width = config.lane_columns.max(1) as f64 * column_width(config);
    let x = config.lane_left + lane.index() as f64 * (width + config.lane_gap);
    (x, width)
}

/// Position of the `index`-th node inside `lane`.
pub fn lane_slot(lane: Lane, index: usize, config: &LayoutConfig) -> Position {
    let columns = config.lane_columns.max(1);
    let max_rows = config.lane_max_rows.max(1);
    let capacity = columns * max_rows;
    let (col, row) = if index < capacity {
        (index / max_rows, index % max_rows)
    } else {
        // Lane is full: keep growing downwards rather than sideways.
        let over = index - capacity;
        (over % columns, max_rows + over / columns)
    };
    let (x, _) = lane_bounds(lane, config);
    Position::new(
        x + col as f64 * column_width(config),
        config.lane_top + row as f64 * row_height(config),
    )
}

/// Item fed to [`arrange_lanes`].
#[derive(Debug, Clone, Copy)]
pub struct ArrangeItem<'a> {
    pub id: &'a str,
    pub kind: EntityKind,
    pub label: &'a str,
}

/// Lane auto-arrange. Deterministic for a given node set.
pub fn arrange_lanes(items: &[ArrangeItem<'_>], config: &LayoutConfig) -> BTreeMap<String, Position> {
    let mut buckets: BTreeMap<Lane, Vec<&ArrangeItem<'_>>> = BTreeMap::new();
    for item in items {
        buckets.entry(Lane::of(item.kind)).or_default().push(item);
    }

    let mut out = BTreeMap::new();
    for (lane, mut bucket) in buckets {
        bucket.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| a.label.cmp(b.label))
                .then_with(|| a.id.cmp(b.id))
        });
        for (index, item) in bucket.iter().enumerate() {
            let slot = lane_slot(lane, index, config).sanitize(Position::ORIGIN);
            out.insert(item.id.to_string(), slot);
        }
    }
    out
}

// --- Position guard for stored data ---

/// Deserialize a position that may be missing, null, or hold non-numeric
/// coordinates. Anything unusable becomes the origin.
pub fn lenient_position<'de, D>(deserializer: D) -> Result<Position, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let coord = |v: Option<&Value>| v.and_then(Value::as_f64).unwrap_or(f64::NAN);
    let pos = match value {
        Some(Value::Object(map)) => Position::new(coord(map.get("x")), coord(map.get("y"))),
        _ => Position::new(f64::NAN, f64::NAN),
    };
    Ok(pos.sanitize(Position::ORIGIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, kind: EntityKind) -> PlacementItem {
        PlacementItem {
            node_id: id.to_string(),
            kind,
            connection_node_id: None,
        }
    }

    fn bbox(kind: EntityKind, p: Position) -> (f64, f64, f64, f64) {
        let (w, h) = node_size(kind);
        (p.x, p.y, p.x + w, p.y + h)
    }

    fn intersects(a: (f64, f64, f64, f64), b: (f64, f64, f64, f64)) -> bool {
        a.0 < b.2 && b.0 < a.2 && a.1 < b.3 && b.1 < a.3
    }

    #[test]
    fn grid_is_square_ish_per_group() {
        let items: Vec<PlacementItem> =
            (0..5).map(|i| item(&format!("agent-{i}"), EntityKind::Agent)).collect();
        let config = LayoutConfig::default();
        let placed = initial_positions(&items, &HashMap::new(), &config);
        let (w, h) = node_size(EntityKind::Agent);
        // 5 nodes -> 3 columns
        assert_eq!(placed[0].1, Position::new(100.0, 100.0));
        assert_eq!(placed[2].1, Position::new(100.0 + 2.0 * (w + 40.0), 100.0));
        assert_eq!(placed[3].1, Position::new(100.0, 100.0 + h + 40.0));
    }

    #[test]
    fn groups_never_overlap() {
        let mut items = Vec::new();
        for i in 0..7 {
            items.push(item(&format!("environment-{i}"), EntityKind::Environment));
            items.push(item(&format!("tool-{i}"), EntityKind::Tool));
            items.push(item(&format!("agent-{i}"), EntityKind::Agent));
        }
        let kinds: HashMap<String, EntityKind> =
            items.iter().map(|i| (i.node_id.clone(), i.kind)).collect();
        let placed = initial_positions(&items, &HashMap::new(), &LayoutConfig::default());
        for (i, (a, pa)) in placed.iter().enumerate() {
            for (b, pb) in placed.iter().skip(i + 1) {
                assert!(
                    !intersects(bbox(kinds[a], *pa), bbox(kinds[b], *pb)),
                    "{a} overlaps {b}"
                );
            }
        }
    }

    #[test]
    fn tools_sit_next_to_their_connection() {
        let mut existing = HashMap::new();
        existing.insert("server-c1".to_string(), Position::new(500.0, 300.0));
        let items = vec![
            PlacementItem {
                node_id: "tool-a".into(),
                kind: EntityKind::Tool,
                connection_node_id: Some("server-c1".into()),
            },
            PlacementItem {
                node_id: "tool-b".into(),
                kind: EntityKind::Tool,
                connection_node_id: Some("server-c1".into()),
            },
        ];
        let placed = initial_positions(&items, &existing, &LayoutConfig::default());
        let (_, h) = node_size(EntityKind::Tool);
        assert_eq!(placed[0].1, Position::new(750.0, 300.0));
        assert_eq!(placed[1].1, Position::new(750.0, 300.0 + h + 40.0));
    }

    #[test]
    fn corrupt_connection_position_falls_back_to_grid() {
        let mut existing = HashMap::new();
        existing.insert("server-c1".to_string(), Position::new(f64::NAN, 5.0));
        let items = vec![PlacementItem {
            node_id: "tool-a".into(),
            kind: EntityKind::Tool,
            connection_node_id: Some("server-c1".into()),
        }];
        let placed = initial_positions(&items, &existing, &LayoutConfig::default());
        assert!(placed[0].1.is_finite());
        assert_eq!(placed[0].1, Position::new(100.0, 100.0));
    }

    #[test]
    fn new_groups_start_below_existing_nodes() {
        let mut existing = HashMap::new();
        existing.insert("agent-old".to_string(), Position::new(100.0, 400.0));
        let placed = initial_positions(
            &[item("agent-new", EntityKind::Agent)],
            &existing,
            &LayoutConfig::default(),
        );
        assert!(placed[0].1.y >= 400.0 + MAX_NODE_HEIGHT);
    }

    #[test]
    fn lanes_are_disjoint_and_arrange_is_idempotent() {
        let mut owned = Vec::new();
        for (i, kind) in EntityKind::ALL.iter().cycle().take(60).enumerate() {
            owned.push((format!("{}-{}", kind, i), *kind, format!("label {}", 60 - i)));
        }
        let items: Vec<ArrangeItem<'_>> = owned
            .iter()
            .map(|(id, kind, label)| ArrangeItem { id, kind: *kind, label })
            .collect();
        let config = LayoutConfig {
            lane_max_rows: 3,
            ..LayoutConfig::default()
        };
        let first = arrange_lanes(&items, &config);
        let second = arrange_lanes(&items, &config);
        assert_eq!(first, second);

        for (ia, a) in items.iter().enumerate() {
            for b in items.iter().skip(ia + 1) {
                let (pa, pb) = (first[a.id], first[b.id]);
                assert!(
                    !intersects(bbox(a.kind, pa), bbox(b.kind, pb)),
                    "{} overlaps {}",
                    a.id,
                    b.id
                );
            }
            let (x, width) = lane_bounds(Lane::of(a.kind), &config);
            let p = first[a.id];
            assert!(p.x >= x && p.x + node_size(a.kind).0 <= x + width);
        }
    }

    #[test]
    fn lane_sort_uses_kind_then_label() {
        let items = [
            ArrangeItem { id: "prompt-1", kind: EntityKind::Prompt, label: "a" },
            ArrangeItem { id: "agent-2", kind: EntityKind::Agent, label: "zeta" },
            ArrangeItem { id: "agent-1", kind: EntityKind::Agent, label: "alpha" },
        ];
        let config = LayoutConfig::default();
        let out = arrange_lanes(&items, &config);
        assert_eq!(out["agent-1"], lane_slot(Lane::Agents, 0, &config));
        assert_eq!(out["agent-2"], lane_slot(Lane::Agents, 1, &config));
        assert_eq!(out["prompt-1"], lane_slot(Lane::Agents, 2, &config));
    }

    #[test]
    fn lenient_positions_normalize_garbage() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(default, deserialize_with = "lenient_position")]
            position: Position,
        }
        let parse = |s: &str| serde_json::from_str::<Wrapper>(s).unwrap().position;
        assert_eq!(parse(r#"{"position":{"x":3,"y":4.5}}"#), Position::new(3.0, 4.5));
        assert_eq!(parse(r#"{"position":{"x":"NaN","y":5}}"#), Position::ORIGIN);
        assert_eq!(parse(r#"{"position":null}"#), Position::ORIGIN);
        assert_eq!(parse(r#"{"position":{"y":5}}"#), Position::ORIGIN);
        assert_eq!(parse(r#"{}"#), Position::ORIGIN);
    }
}
