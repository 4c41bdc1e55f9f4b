use std::time::{Duration, Instant};

use canopy_core::catalog::EntityRecord;
use canopy_core::persist::{StoredNode, StoredNodeData};
use canopy_core::source::{CatalogData, CatalogDocument, FileStore, MemoryStore};
use canopy_core::{
    CanvasFilter, CanvasSession, CanvasSettings, CanvasState, EdgeKind, EdgeOrigin, EntityKind, LoadSource,
    NeighborSide, PolicyBinding, PolicyRule, Position, RuleEffect, SaveReport, SnapshotStore,
};

fn record(id: &str, name: &str) -> EntityRecord {
    EntityRecord::new(id, name)
}

fn tool(id: &str, namespace: &str, name: &str) -> EntityRecord {
    let mut r = EntityRecord::new(id, name);
    r.namespace = Some(namespace.into());
    r
}

fn open(data: CatalogData) -> (CanvasSession, CatalogDocument) {
    let doc = CatalogDocument::new(data);
    let mut session = CanvasSession::new("acme", CanvasSettings::default());
    session.refresh_catalog(&doc).unwrap();
    session.refresh_policies(&doc).unwrap();
    (session, doc)
}

fn derived_targets(session: &CanvasSession) -> Vec<String> {
    session
        .graph()
        .edges()
        .filter(|e| e.origin == EdgeOrigin::Derived)
        .map(|e| e.target.clone())
        .collect()
}

fn stored(id: &str, kind: EntityKind, entity: &str, x: f64, y: f64) -> StoredNode {
    StoredNode {
        id: id.into(),
        position: Position::new(x, y),
        data: StoredNodeData::new(kind, Some(entity)),
    }
}

fn later() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[test]
fn child_connection_survives_environment_delete() {
    let (mut session, doc) = open(CatalogData {
        environments: vec![record("E", "Production")],
        ..CatalogData::default()
    });

    let (placeholder, edge) = session
        .create_neighbor("environment-E", EntityKind::Server, NeighborSide::Child)
        .unwrap();
    assert_eq!(edge.kind, EdgeKind::EnvironmentServer);

    // The platform creates the connection the placeholder stood for.
    doc.update(|d| d.connections.push(record("C", "Gateway")));
    let node_id = session
        .promote_placeholder(&placeholder, "C", &doc, &doc)
        .unwrap();
    assert_eq!(node_id, "server-C");
    assert!(session.graph().node(&placeholder).is_none());

    let edges: Vec<_> = session.graph().edges().collect();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].id, "environment-E-server-C");
    assert_eq!(doc.snapshot().connections[0].environment_id.as_deref(), Some("E"));

    session.delete_node("environment-E").unwrap();
    assert_eq!(session.graph().edge_count(), 0);
    assert!(session.graph().node("server-C").is_some());

    // A routine refetch still lists E; the deletion stands.
    let summary = session.refresh_catalog(&doc).unwrap();
    assert_eq!(summary.suppressed, 1);
    assert!(session.graph().node("environment-E").is_none());
    assert_eq!(session.graph().edge_count(), 0);
    assert!(session.graph().node("server-C").is_some());
}

#[test]
fn deleted_connection_edge_stays_deleted_after_refresh() {
    let mut connection = record("C", "Gateway");
    connection.environment_id = Some("E".into());
    let (mut session, doc) = open(CatalogData {
        environments: vec![record("E", "Production")],
        connections: vec![connection],
        ..CatalogData::default()
    });
    assert!(session.graph().edge("environment-E-server-C").is_some());

    session.delete_edge("environment-E-server-C", &doc).unwrap();
    assert_eq!(doc.snapshot().connections[0].environment_id, None);
    session.refresh_catalog(&doc).unwrap();
    assert!(session.graph().edge("environment-E-server-C").is_none());
    assert!(session.graph().node("environment-E").is_some());
}

#[test]
fn deletions_survive_a_reopen() {
    let primary = MemoryStore::new();
    let fallback = MemoryStore::new();
    let data = CatalogData {
        agents: vec![record("a", "A"), record("b", "B")],
        ..CatalogData::default()
    };

    let (mut first, _) = open(data.clone());
    first.load(&primary, &fallback);
    first.delete_node("agent-b").unwrap();
    first.save_now(&primary, &fallback).unwrap();
    assert_eq!(primary.get("acme").unwrap().removed_nodes, vec!["agent-b".to_string()]);

    let (mut second, doc) = open(data);
    assert!(second.graph().node("agent-b").is_some());
    let report = second.load(&primary, &fallback);
    assert_eq!(report.merge.unwrap().removed, 1);
    assert!(second.graph().node("agent-b").is_none());
    second.refresh_catalog(&doc).unwrap();
    assert!(second.graph().node("agent-b").is_none());
    assert!(second.graph().node("agent-a").is_some());
}

#[test]
fn namespace_rule_derives_a_single_edge() {
    let (session, _) = open(CatalogData {
        agents: vec![record("A", "Support agent")],
        policies: vec![record("P", "Support tooling")],
        tools: vec![tool("foo", "ns", "foo"), tool("bar", "other", "bar")],
        policy_rules: vec![PolicyRule {
            id: "r1".into(),
            policy_id: "P".into(),
            effect: RuleEffect::Allow,
            action: "tool.invoke".into(),
            target: "tool:ns/*".into(),
        }],
        policy_bindings: vec![PolicyBinding {
            id: "b1".into(),
            policy_id: "P".into(),
            agent_id: Some("A".into()),
        }],
        ..CatalogData::default()
    });

    let derived: Vec<_> = session
        .graph()
        .edges()
        .filter(|e| e.origin == EdgeOrigin::Derived)
        .collect();
    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].source, "agent-A");
    assert_eq!(derived[0].target, "tool-foo");
    assert_eq!(derived[0].label.as_deref(), Some("Support tooling"));
    assert!(derived[0].metadata.policy_governed);

    // The binding itself shows up as an explicit policy -> agent edge.
    let binding = session.graph().edge("policy-P-agent-A").unwrap();
    assert_eq!(binding.kind, EdgeKind::PolicyAgent);

    let explicit_only = CanvasFilter {
        include_derived: false,
        ..CanvasFilter::default()
    };
    assert_eq!(session.visible_edges(&explicit_only).len(), 1);
}

#[test]
fn derived_edges_follow_rule_changes() {
    let rule = |target: &str| PolicyRule {
        id: "r1".into(),
        policy_id: "P".into(),
        effect: RuleEffect::Allow,
        action: "tool.invoke".into(),
        target: target.into(),
    };
    let (mut session, doc) = open(CatalogData {
        agents: vec![record("A", "A")],
        policies: vec![record("P", "P")],
        tools: vec![tool("foo", "ns", "foo"), tool("bar", "other", "bar")],
        policy_rules: vec![rule("tool:*")],
        ..CatalogData::default()
    });
    assert_eq!(derived_targets(&session), vec!["tool-bar", "tool-foo"]);

    doc.update(|d| d.policy_rules = vec![rule("tool:other/*")]);
    session.refresh_policies(&doc).unwrap();
    assert_eq!(derived_targets(&session), vec!["tool-bar"]);

    doc.update(|d| d.policy_rules.clear());
    session.refresh_policies(&doc).unwrap();
    assert!(derived_targets(&session).is_empty());
}

#[test]
fn dragged_node_is_not_snapped_back_by_a_later_merge() {
    let (mut session, _) = open(CatalogData {
        agents: vec![record("a", "A")],
        ..CatalogData::default()
    });
    let primary = MemoryStore::new();
    primary.put(
        "acme",
        CanvasState {
            nodes: vec![stored("agent-a", EntityKind::Agent, "a", 500.0, 500.0)],
            ..CanvasState::default()
        },
    );
    let report = session.load(&primary, &MemoryStore::new());
    assert_eq!(report.source, LoadSource::Primary);
    assert_eq!(
        session.graph().node("agent-a").unwrap().position(),
        Position::new(500.0, 500.0)
    );

    session.node_moved("agent-a", Position::new(20.0, 30.0)).unwrap();
    let stale = CanvasState {
        nodes: vec![stored("agent-a", EntityKind::Agent, "a", 500.0, 500.0)],
        ..CanvasState::default()
    };
    session.merge(&stale);
    let node = session.graph().node("agent-a").unwrap();
    assert_eq!(node.position(), Position::new(20.0, 30.0));
    assert!(node.dirty);
}

#[test]
fn deleted_nodes_stay_deleted_after_merge() {
    let (mut session, _) = open(CatalogData {
        agents: vec![record("a", "A"), record("b", "B")],
        ..CatalogData::default()
    });
    session.load(&MemoryStore::new(), &MemoryStore::new());
    session.delete_node("agent-b").unwrap();
    session.merge(&CanvasState {
        nodes: vec![stored("agent-b", EntityKind::Agent, "b", 1.0, 1.0)],
        ..CanvasState::default()
    });
    assert!(session.graph().node("agent-b").is_none());
}

#[test]
fn save_falls_back_when_primary_fails() {
    let (mut session, _) = open(CatalogData {
        agents: vec![record("a", "A")],
        ..CatalogData::default()
    });
    let primary = MemoryStore::new();
    let fallback = MemoryStore::new();
    primary.set_fail_saves(true);

    match session.save_now(&primary, &fallback).unwrap() {
        SaveReport::Fallback { error } => assert!(error.contains("unavailable")),
        other => panic!("expected fallback, got {other:?}"),
    }
    assert_eq!(fallback.get("acme").unwrap().nodes.len(), 1);
    assert!(primary.get("acme").is_none());

    primary.set_fail_saves(false);
    assert_eq!(session.save_now(&primary, &fallback).unwrap(), SaveReport::Remote);
    assert!(fallback.get("acme").is_none());

    primary.set_fail_saves(true);
    fallback.set_fail_saves(true);
    assert!(session.save_now(&primary, &fallback).is_err());
}

#[test]
fn load_degrades_to_fallback_then_fresh() {
    let (mut session, _) = open(CatalogData {
        agents: vec![record("a", "A")],
        ..CatalogData::default()
    });
    let primary = MemoryStore::new();
    let fallback = MemoryStore::new();
    primary.set_fail_loads(true);
    fallback.put(
        "acme",
        CanvasState {
            nodes: vec![stored("agent-a", EntityKind::Agent, "a", 42.0, 24.0)],
            ..CanvasState::default()
        },
    );
    let report = session.load(&primary, &fallback);
    assert_eq!(report.source, LoadSource::Fallback);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(
        session.graph().node("agent-a").unwrap().position(),
        Position::new(42.0, 24.0)
    );

    let (mut fresh, _) = open(CatalogData {
        agents: vec![record("a", "A")],
        ..CatalogData::default()
    });
    let initial = fresh.graph().node("agent-a").unwrap().position();
    fallback.set_fail_loads(true);
    let report = fresh.load(&primary, &fallback);
    assert_eq!(report.source, LoadSource::Fresh);
    assert_eq!(report.errors.len(), 2);
    assert_eq!(fresh.graph().node("agent-a").unwrap().position(), initial);
}

#[test]
fn burst_of_moves_saves_once() {
    let (mut session, _) = open(CatalogData {
        agents: vec![record("a", "A")],
        ..CatalogData::default()
    });
    let primary = MemoryStore::new();
    let fallback = MemoryStore::new();
    for i in 0..10 {
        session
            .node_moved("agent-a", Position::new(i as f64, 0.0))
            .unwrap();
    }
    assert_eq!(session.flush_due(Instant::now(), &primary, &fallback).unwrap(), None);
    assert_eq!(
        session.flush_due(later(), &primary, &fallback).unwrap(),
        Some(SaveReport::Remote)
    );
    assert_eq!(session.flush_due(later(), &primary, &fallback).unwrap(), None);
    assert_eq!(primary.save_count(), 1);
    assert_eq!(
        primary.get("acme").unwrap().nodes[0].position,
        Position::new(9.0, 0.0)
    );
}

#[test]
fn cancelled_placeholder_leaves_nothing_behind() {
    let (mut session, _) = open(CatalogData {
        agents: vec![record("a", "A")],
        ..CatalogData::default()
    });
    let before = session.graph().edge_count();
    let (placeholder, _) = session
        .create_neighbor("agent-a", EntityKind::Tool, NeighborSide::Child)
        .unwrap();
    assert_eq!(session.graph().edge_count(), before + 1);
    assert!(session.snapshot(chrono::Utc::now()).nodes.iter().all(|n| n.id != placeholder));

    session.cancel_placeholder(&placeholder).unwrap();
    assert_eq!(session.graph().edge_count(), before);
    assert!(session.graph().node(&placeholder).is_none());
    assert!(session.cancel_placeholder("agent-a").is_err());
}

#[test]
fn positions_survive_a_restart_through_the_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let primary = FileStore::new(dir.path().join("canvases"));
    let fallback = FileStore::new(dir.path().join("fallback"));
    let data = CatalogData {
        agents: vec![record("a", "A")],
        tools: vec![tool("t", "ns", "t")],
        ..CatalogData::default()
    };

    let (mut first, doc) = open(data.clone());
    first.load(&primary, &fallback);
    first.connect("agent-a", "tool-t", None, &doc).unwrap();
    first.node_moved("tool-t", Position::new(640.0, 320.0)).unwrap();
    assert_eq!(first.save_now(&primary, &fallback).unwrap(), SaveReport::Remote);

    let (mut second, _) = open(data);
    let report = second.load(&primary, &fallback);
    assert_eq!(report.source, LoadSource::Primary);
    let node = second.graph().node("tool-t").unwrap();
    assert_eq!(node.position(), Position::new(640.0, 320.0));
    assert!(!node.dirty);
    assert!(second.graph().edge("agent-a-tool-t").is_some());
    assert!(primary.load("acme").unwrap().is_some());
}

#[test]
fn auto_arrange_is_stable_and_schedules_a_save() {
    let (mut session, _) = open(CatalogData {
        agents: vec![record("a", "A"), record("b", "B")],
        tools: vec![tool("t", "ns", "t")],
        policies: vec![record("p", "P")],
        environments: vec![record("e", "E")],
        ..CatalogData::default()
    });
    session.take_events();
    session.auto_arrange();
    let first = session.graph().positions();
    session.auto_arrange();
    assert_eq!(first, session.graph().positions());
    assert!(session.save_deadline().is_some());
    assert!(!session.take_events().is_empty());
}
