use canopy_core::graph::NeighborSide;
use canopy_core::source::{FileCatalog, FileStore};
use canopy_core::{
    canopy_dir, read_settings, rules, CanvasFilter, CanvasSession, CanvasSettings, EdgeKind, EntityKind, Position,
    SaveReport,
};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

// --- Request types ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct OrgRequest {
    /// Organization id. Defaults to `defaultOrg` from ~/.canopy/settings.json.
    org: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct QueryRequest {
    /// Organization id. Defaults to `defaultOrg` from settings.
    org: Option<String>,
    /// Optional filter: {kinds?: ["agent", ...], search?: "text", includeDisabled?: bool, includeDerived?: bool}
    filter: Option<CanvasFilter>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ConnectRequest {
    org: Option<String>,
    /// Source node id, e.g. "agent-a1"
    source: String,
    /// Target node id, e.g. "server-c1"
    target: String,
    /// Edge kind such as "agent-server". Omit to use the default kind for the pair.
    kind: Option<EdgeKind>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct MoveNodeRequest {
    org: Option<String>,
    node_id: String,
    x: f64,
    y: f64,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct NodeRequest {
    org: Option<String>,
    node_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct EdgeRequest {
    org: Option<String>,
    /// Edge id, "{source}-{target}"
    edge_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct RetargetRequest {
    org: Option<String>,
    /// Edge id, "{source}-{target}"
    edge_id: String,
    /// New source node id
    source: String,
    /// New target node id
    target: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct CreateNeighborRequest {
    org: Option<String>,
    /// Node the new placeholder attaches to
    anchor_id: String,
    /// Kind of the new node: "agent", "tool", "resource", "policy", "server", "environment" or "prompt"
    kind: EntityKind,
    /// "child" (anchor is the edge source) or "parent" (anchor is the edge target)
    side: NeighborSide,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct PromoteRequest {
    org: Option<String>,
    /// Placeholder node id, e.g. "new-server-1717171717171"
    node_id: String,
    /// Id of the entity created on the platform for this placeholder
    entity_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct RenameRequest {
    org: Option<String>,
    node_id: String,
    label: String,
}

// --- Server ---

/// Open canvases and their pending save timers, keyed by organization.
#[derive(Default)]
struct Sessions {
    canvases: HashMap<String, CanvasSession>,
    timers: HashMap<String, JoinHandle<()>>,
}

#[derive(Clone)]
pub struct CanopyServer {
    tool_router: ToolRouter<Self>,
    sessions: Arc<Mutex<Sessions>>,
    settings: CanvasSettings,
    catalogs: FileCatalog,
    primary: FileStore,
    fallback: FileStore,
}

#[tool_router]
impl CanopyServer {
    pub fn new(settings: CanvasSettings) -> Self {
        let home = canopy_dir();
        Self {
            tool_router: Self::tool_router(),
            sessions: Arc::new(Mutex::new(Sessions::default())),
            settings,
            catalogs: FileCatalog::default_location(),
            primary: FileStore::new(home.join("canvases")),
            fallback: FileStore::new(home.join("fallback")),
        }
    }

    #[tool(description = "List organizations that have a saved canvas")]
    fn list_canvases(&self) -> Result<CallToolResult, McpError> {
        match self.primary.list() {
            Ok(orgs) if orgs.is_empty() => ok_text("No saved canvases. Use open_canvas to start one.".into()),
            Ok(orgs) => ok_text(orgs.join("\n")),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(
        description = "Open (or reopen) an organization's canvas: loads the catalog from ~/.canopy/catalogs/{org}.json, resolves policy edges, and merges the saved snapshot. Returns {source: primary|fallback|fresh, merge?, errors?}."
    )]
    fn open_canvas(&self, Parameters(req): Parameters<OrgRequest>) -> Result<CallToolResult, McpError> {
        let org = match self.org(req.org) {
            Ok(org) => org,
            Err(e) => return err_text(e),
        };
        self.cancel_timer(&org);
        let previous = self.sessions.lock().unwrap().canvases.remove(&org);
        if let Some(mut previous) = previous.filter(|s| s.save_deadline().is_some()) {
            if let Err(e) = previous.save_now(&self.primary, &self.fallback) {
                tracing::warn!(org = %org, error = %e, "could not save canvas before reopening");
            }
        }
        let mut session = CanvasSession::new(org.clone(), self.settings.clone());
        let report = session
            .refresh_catalog(&self.catalogs)
            .and_then(|_| session.refresh_policies(&self.catalogs))
            .map(|_| session.load(&self.primary, &self.fallback));
        match report {
            Ok(report) => {
                session.take_events();
                self.sessions.lock().unwrap().canvases.insert(org.clone(), session);
                tracing::info!(org = %org, source = ?report.source, "opened canvas");
                respond_json(&report)
            }
            Err(e) => err_text(format!("Failed to open canvas '{}': {}", org, e)),
        }
    }

    #[tool(
        description = "List visible nodes. Each node: {id, kind, label, status, position: {x, y}, dirty, labelPending, entity?}. Placeholder ids start with \"new-\"."
    )]
    fn get_nodes(&self, Parameters(req): Parameters<QueryRequest>) -> Result<CallToolResult, McpError> {
        let filter = req.filter.unwrap_or_default();
        self.read(req.org, |s| to_json(&s.visible_nodes(&filter)))
    }

    #[tool(
        description = "List visible edges (both endpoints visible). Each edge: {id, source, target, kind, origin: explicit|derived, config, label?, metadata: {policyGoverned, policyId?}}."
    )]
    fn get_edges(&self, Parameters(req): Parameters<QueryRequest>) -> Result<CallToolResult, McpError> {
        let filter = req.filter.unwrap_or_default();
        self.read(req.org, |s| to_json(&s.visible_edges(&filter)))
    }

    #[tool(
        description = "Connect two nodes. The pair must be allowed by the connection rules (see get_connection_rules). Connecting an existing pair is a no-op. Foreign keys implied by the edge (e.g. agent -> server sets the agent's connectionId) are written back to the catalog."
    )]
    fn connect(&self, Parameters(req): Parameters<ConnectRequest>) -> Result<CallToolResult, McpError> {
        let catalogs = self.catalogs.clone();
        self.mutate(req.org, |s| {
            let edge = s
                .connect(&req.source, &req.target, req.kind, &catalogs)
                .map_err(|e| e.to_string())?;
            to_json(&edge)
        })
    }

    #[tool(description = "Move a node. Non-finite coordinates are replaced with {0, 0}.")]
    fn move_node(&self, Parameters(req): Parameters<MoveNodeRequest>) -> Result<CallToolResult, McpError> {
        self.mutate(req.org, |s| {
            let p = s
                .node_moved(&req.node_id, Position::new(req.x, req.y))
                .map_err(|e| e.to_string())?;
            Ok(format!("Moved {} to ({}, {})", req.node_id, p.x, p.y))
        })
    }

    #[tool(description = "Delete a node and every edge touching it")]
    fn delete_node(&self, Parameters(req): Parameters<NodeRequest>) -> Result<CallToolResult, McpError> {
        self.mutate(req.org, |s| {
            s.delete_node(&req.node_id).map_err(|e| e.to_string())?;
            Ok(format!("Deleted {}", req.node_id))
        })
    }

    #[tool(
        description = "Delete a single edge by id. Deleting an explicit edge clears the foreign key it implied (e.g. the agent's connectionId), so a refresh does not bring it back."
    )]
    fn delete_edge(&self, Parameters(req): Parameters<EdgeRequest>) -> Result<CallToolResult, McpError> {
        let catalogs = self.catalogs.clone();
        self.mutate(req.org, |s| {
            s.delete_edge(&req.edge_id, &catalogs).map_err(|e| e.to_string())?;
            Ok(format!("Deleted {}", req.edge_id))
        })
    }

    #[tool(
        description = "Move an edge onto a new source/target pair, using the default kind for the new pair. The result is always explicit; a policy-derived edge becomes user-owned."
    )]
    fn retarget_edge(&self, Parameters(req): Parameters<RetargetRequest>) -> Result<CallToolResult, McpError> {
        let catalogs = self.catalogs.clone();
        self.mutate(req.org, |s| {
            let edge = s
                .retarget_edge(&req.edge_id, &req.source, &req.target, &catalogs)
                .map_err(|e| e.to_string())?;
            to_json(&edge)
        })
    }

    #[tool(
        description = "Create a placeholder node next to an anchor, joined by the default edge for the pair. Returns {nodeId, edge}. Create the entity on the platform, then call promote_placeholder; or call cancel_placeholder to discard it."
    )]
    fn create_neighbor(
        &self,
        Parameters(req): Parameters<CreateNeighborRequest>,
    ) -> Result<CallToolResult, McpError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Created {
            node_id: String,
            edge: canopy_core::Edge,
        }
        self.mutate(req.org, |s| {
            let (node_id, edge) = s
                .create_neighbor(&req.anchor_id, req.kind, req.side)
                .map_err(|e| e.to_string())?;
            to_json(&Created { node_id, edge })
        })
    }

    #[tool(description = "Discard a placeholder node and its edges")]
    fn cancel_placeholder(&self, Parameters(req): Parameters<NodeRequest>) -> Result<CallToolResult, McpError> {
        self.mutate(req.org, |s| {
            s.cancel_placeholder(&req.node_id).map_err(|e| e.to_string())?;
            Ok(format!("Cancelled {}", req.node_id))
        })
    }

    #[tool(
        description = "Replace a placeholder with the entity created for it. The placeholder's position and edges move to the entity's node."
    )]
    fn promote_placeholder(&self, Parameters(req): Parameters<PromoteRequest>) -> Result<CallToolResult, McpError> {
        let catalogs = self.catalogs.clone();
        self.mutate(req.org, |s| {
            let id = s
                .promote_placeholder(&req.node_id, &req.entity_id, &catalogs, &catalogs)
                .map_err(|e| e.to_string())?;
            Ok(format!("Promoted {} to {}", req.node_id, id))
        })
    }

    #[tool(description = "Change a node's label locally. Use save_label to write it to the entity.")]
    fn rename_node(&self, Parameters(req): Parameters<RenameRequest>) -> Result<CallToolResult, McpError> {
        self.mutate(req.org, |s| {
            s.rename_node(&req.node_id, &req.label).map_err(|e| e.to_string())?;
            Ok(format!("Renamed {} to '{}' (pending)", req.node_id, req.label))
        })
    }

    #[tool(description = "Write a node's pending label back to its entity's name")]
    fn save_label(&self, Parameters(req): Parameters<NodeRequest>) -> Result<CallToolResult, McpError> {
        let catalogs = self.catalogs.clone();
        self.mutate(req.org, |s| {
            let record = s.save_label(&req.node_id, &catalogs).map_err(|e| e.to_string())?;
            Ok(format!("Saved name '{}' for {}", record.name, req.node_id))
        })
    }

    #[tool(description = "Arrange every node into kind lanes (scope, governance, agents, connections, capabilities)")]
    fn auto_arrange(&self, Parameters(req): Parameters<OrgRequest>) -> Result<CallToolResult, McpError> {
        self.mutate(req.org, |s| {
            s.auto_arrange();
            Ok(format!("Arranged {} nodes", s.graph().node_count()))
        })
    }

    #[tool(description = "Reload the catalog and policy data and recompute policy-derived edges")]
    fn refresh(&self, Parameters(req): Parameters<OrgRequest>) -> Result<CallToolResult, McpError> {
        let catalogs = self.catalogs.clone();
        self.mutate(req.org, |s| {
            let sync = s.refresh_catalog(&catalogs).map_err(|e| e.to_string())?;
            let derived = s.refresh_policies(&catalogs).map_err(|e| e.to_string())?;
            Ok(format!(
                "Nodes: {} added, {} updated, {} removed, {} kept deleted. Derived edges: {} applied, {} removed.",
                sync.added, sync.updated, sync.removed, sync.suppressed, derived.applied, derived.removed
            ))
        })
    }

    #[tool(
        description = "Drain the change events recorded since the last call, including savedToFallback / saveFailed entries from background saves. Only the most recent 1024 events are kept."
    )]
    fn get_events(&self, Parameters(req): Parameters<OrgRequest>) -> Result<CallToolResult, McpError> {
        self.read(req.org, |s| to_json(&s.take_events()))
    }

    #[tool(
        description = "Export the canvas as the downloadable document {version: 1, exportedAt, orgId, canvas: {nodes, edges, viewport, savedAt}}"
    )]
    fn export(&self, Parameters(req): Parameters<OrgRequest>) -> Result<CallToolResult, McpError> {
        self.read(req.org, |s| s.export().map_err(|e| e.to_string()))
    }

    #[tool(description = "Save the canvas now instead of waiting for the debounce")]
    fn save(&self, Parameters(req): Parameters<OrgRequest>) -> Result<CallToolResult, McpError> {
        let org = match self.org(req.org) {
            Ok(org) => org,
            Err(e) => return err_text(e),
        };
        self.cancel_timer(&org);
        match self.save_org(&org) {
            Ok(SaveReport::Remote) => ok_text(format!("Saved canvas '{}'", org)),
            Ok(SaveReport::Fallback { error }) => ok_text(format!(
                "Primary save failed ({}); canvas '{}' kept in the local fallback store",
                error, org
            )),
            Err(e) => err_text(e),
        }
    }

    #[tool(description = "Describe which entity kinds can connect and which neighbors can be created from each kind")]
    fn get_connection_rules(&self) -> Result<CallToolResult, McpError> {
        ok_text(rules::describe_matrix())
    }
}

impl CanopyServer {
    fn org(&self, requested: Option<String>) -> Result<String, String> {
        requested
            .filter(|o| !o.trim().is_empty())
            .or_else(|| self.settings.default_org.clone())
            .ok_or_else(|| "No org given and no defaultOrg in ~/.canopy/settings.json".to_string())
    }

    /// Run `f` on the org's session, opening it first if needed.
    fn with_session<T>(
        &self,
        org: &str,
        f: impl FnOnce(&mut CanvasSession) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut sessions = self.sessions.lock().unwrap();
        if !sessions.canvases.contains_key(org) {
            let mut session = CanvasSession::new(org, self.settings.clone());
            session
                .refresh_catalog(&self.catalogs)
                .and_then(|_| session.refresh_policies(&self.catalogs))
                .map_err(|e| format!("Failed to open canvas '{}': {}", org, e))?;
            session.load(&self.primary, &self.fallback);
            session.take_events();
            sessions.canvases.insert(org.to_string(), session);
        }
        match sessions.canvases.get_mut(org) {
            Some(session) => f(session),
            None => Err(format!("Canvas '{}' is not open", org)),
        }
    }

    fn read(
        &self,
        org: Option<String>,
        f: impl FnOnce(&mut CanvasSession) -> Result<String, String>,
    ) -> Result<CallToolResult, McpError> {
        let result = self.org(org).and_then(|org| self.with_session(&org, f));
        respond(result)
    }

    /// Like `read`, then restart the org's save timer.
    fn mutate(
        &self,
        org: Option<String>,
        f: impl FnOnce(&mut CanvasSession) -> Result<String, String>,
    ) -> Result<CallToolResult, McpError> {
        let org = match self.org(org) {
            Ok(org) => org,
            Err(e) => return err_text(e),
        };
        let result = self.with_session(&org, f);
        if result.is_ok() {
            self.schedule_save(&org);
        }
        respond(result)
    }

    /// Abort the org's pending timer and start a fresh one.
    fn schedule_save(&self, org: &str) {
        let window = Duration::from_millis(self.settings.debounce_ms);
        let server = self.clone();
        let key = org.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            server.flush(&key);
        });
        if let Some(previous) = self.sessions.lock().unwrap().timers.insert(org.to_string(), handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&self, org: &str) {
        if let Some(handle) = self.sessions.lock().unwrap().timers.remove(org) {
            handle.abort();
        }
    }

    fn flush(&self, org: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.timers.remove(org);
        let Some(session) = sessions.canvases.get_mut(org) else {
            return;
        };
        match session.flush_due(Instant::now(), &self.primary, &self.fallback) {
            Ok(Some(SaveReport::Remote)) => tracing::debug!(org, "debounced save"),
            Ok(Some(SaveReport::Fallback { error })) => {
                tracing::warn!(org, error = %error, "saved to fallback store")
            }
            Ok(None) => {}
            Err(e) => tracing::error!(org, error = %e, "canvas save failed"),
        }
    }

    fn save_org(&self, org: &str) -> Result<SaveReport, String> {
        self.with_session(org, |s| {
            s.save_now(&self.primary, &self.fallback).map_err(|e| e.to_string())
        })
    }
}

#[tool_handler]
impl ServerHandler for CanopyServer {
    fn get_info(&self) -> ServerInfo {
        let instructions = format!(
            "{}\n\n## Connection rules\n{}",
            INSTRUCTIONS,
            rules::describe_matrix()
        );
        ServerInfo {
            instructions: Some(instructions.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

// --- Helpers ---

fn ok_text(text: String) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn err_text(text: String) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(text)]))
}

fn respond(result: Result<String, String>) -> Result<CallToolResult, McpError> {
    match result {
        Ok(text) => ok_text(text),
        Err(e) => err_text(e),
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("Serialization error: {}", e))
}

fn respond_json<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    respond(to_json(value))
}

const INSTRUCTIONS: &str = r#"canopy is the relationship canvas of an agent orchestration console. Nodes are platform entities (agents, tools, resources, policies, servers/connections, environments, organizations, prompts); edges are typed relationships between them.

## Node ids
- Entity nodes: "{kind}-{entityId}", e.g. "agent-a1", "server-c1".
- Placeholders: "new-{kind}-{timestamp}". They exist only until promoted or cancelled and are never saved.

## Edges
- Explicit edges are created with `connect` or `create_neighbor` and may update the entity's foreign keys.
- Derived edges (origin "derived") come from policy rules and are recomputed on every `refresh`. Do not try to create them by hand.
- Every edge must be allowed by the connection rules below; rejected connections return an error and change nothing.

## Workflow
1. `open_canvas` once per organization.
2. Inspect with `get_nodes` / `get_edges` (both accept a filter).
3. Mutate with `connect`, `move_node`, `create_neighbor`, `delete_node`, ... Changes are saved automatically about a second after the last mutation; call `save` to write immediately."#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the MCP transport; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = read_settings();
    let service = CanopyServer::new(settings)
        .serve(rmcp::transport::io::stdio())
        .await
        .inspect_err(|e| tracing::error!(error = %e, "MCP server error"))?;
    service.waiting().await?;
    Ok(())
}
