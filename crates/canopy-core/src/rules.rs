//! Connection compatibility matrix: the single source of truth for which
//! relationships may exist between two entity kinds.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::EntityKind;
use EntityKind::*;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, schemars::JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    AgentTool,
    AgentResource,
    AgentServer,
    AgentEnvironment,
    ToolServer,
    ServerTool,
    EnvironmentServer,
    EnvironmentPolicy,
    EnvironmentResource,
    EnvironmentPrompt,
    PromptResource,
    PolicyAgent,
    PolicyTool,
    PolicyServer,
    PolicyResource,
    PolicyEnvironment,
    OrganizationEnvironment,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 17] = [
        EdgeKind::AgentTool,
        EdgeKind::AgentResource,
        EdgeKind::AgentServer,
        EdgeKind::AgentEnvironment,
        EdgeKind::ToolServer,
        EdgeKind::ServerTool,
        EdgeKind::EnvironmentServer,
        EdgeKind::EnvironmentPolicy,
        EdgeKind::EnvironmentResource,
        EdgeKind::EnvironmentPrompt,
        EdgeKind::PromptResource,
        EdgeKind::PolicyAgent,
        EdgeKind::PolicyTool,
        EdgeKind::PolicyServer,
        EdgeKind::PolicyResource,
        EdgeKind::PolicyEnvironment,
        EdgeKind::OrganizationEnvironment,
    ];

    /// The (source, target) entity kinds this edge kind connects.
    pub fn endpoints(&self) -> (EntityKind, EntityKind) {
        match self {
            EdgeKind::AgentTool => (Agent, Tool),
            EdgeKind::AgentResource => (Agent, Resource),
            EdgeKind::AgentServer => (Agent, Server),
            EdgeKind::AgentEnvironment => (Agent, Environment),
            EdgeKind::ToolServer => (Tool, Server),
            EdgeKind::ServerTool => (Server, Tool),
            EdgeKind::EnvironmentServer => (Environment, Server),
            EdgeKind::EnvironmentPolicy => (Environment, Policy),
            EdgeKind::EnvironmentResource => (Environment, Resource),
            EdgeKind::EnvironmentPrompt => (Environment, Prompt),
            EdgeKind::PromptResource => (Prompt, Resource),
            EdgeKind::PolicyAgent => (Policy, Agent),
            EdgeKind::PolicyTool => (Policy, Tool),
            EdgeKind::PolicyServer => (Policy, Server),
            EdgeKind::PolicyResource => (Policy, Resource),
            EdgeKind::PolicyEnvironment => (Policy, Environment),
            EdgeKind::OrganizationEnvironment => (Organization, Environment),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::AgentTool => "agent-tool",
            EdgeKind::AgentResource => "agent-resource",
            EdgeKind::AgentServer => "agent-server",
            EdgeKind::AgentEnvironment => "agent-environment",
            EdgeKind::ToolServer => "tool-server",
            EdgeKind::ServerTool => "server-tool",
            EdgeKind::EnvironmentServer => "environment-server",
            EdgeKind::EnvironmentPolicy => "environment-policy",
            EdgeKind::EnvironmentResource => "environment-resource",
            EdgeKind::EnvironmentPrompt => "environment-prompt",
            EdgeKind::PromptResource => "prompt-resource",
            EdgeKind::PolicyAgent => "policy-agent",
            EdgeKind::PolicyTool => "policy-tool",
            EdgeKind::PolicyServer => "policy-server",
            EdgeKind::PolicyResource => "policy-resource",
            EdgeKind::PolicyEnvironment => "policy-environment",
            EdgeKind::OrganizationEnvironment => "organization-environment",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EdgeKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| format!("unknown edge kind: {s}"))
    }
}

// --- Matrix ---

/// Edge kinds legal from `source` to `target`. Empty for unknown pairs.
pub fn legal_kinds(source: EntityKind, target: EntityKind) -> BTreeSet<EdgeKind> {
    EdgeKind::ALL
        .iter()
        .copied()
        .filter(|k| k.endpoints() == (source, target))
        .collect()
}

pub fn is_legal(kind: EdgeKind, source: EntityKind, target: EntityKind) -> bool {
    kind.endpoints() == (source, target)
}

/// The kind used when a connection is made without naming one.
pub fn default_kind(source: EntityKind, target: EntityKind) -> Option<EdgeKind> {
    legal_kinds(source, target).into_iter().next()
}

/// Kinds that may point into `kind`.
pub fn valid_sources(kind: EntityKind) -> BTreeSet<EntityKind> {
    EntityKind::ALL
        .iter()
        .copied()
        .filter(|&s| !legal_kinds(s, kind).is_empty())
        .collect()
}

/// Kinds `kind` may point at.
pub fn valid_targets(kind: EntityKind) -> BTreeSet<EntityKind> {
    EntityKind::ALL
        .iter()
        .copied()
        .filter(|&t| !legal_kinds(kind, t).is_empty())
        .collect()
}

fn child_table(kind: EntityKind) -> &'static [EntityKind] {
    match kind {
        Environment => &[Server, Policy, Resource, Prompt],
        Agent => &[Tool, Resource, Server],
        Server => &[Tool],
        Prompt => &[Resource],
        Policy => &[Agent, Tool, Server, Resource],
        Organization => &[Environment],
        Tool | Resource => &[],
    }
}

/// Kinds that can be created as a right-hand neighbor of `kind`.
pub fn allowed_child_kinds(kind: EntityKind) -> BTreeSet<EntityKind> {
    child_table(kind).iter().copied().collect()
}

/// Kinds that can be created as a left-hand neighbor of `kind`.
/// Organizations are never created from the canvas.
pub fn allowed_parent_kinds(kind: EntityKind) -> BTreeSet<EntityKind> {
    EntityKind::ALL
        .iter()
        .copied()
        .filter(|&p| p != Organization && child_table(p).contains(&kind))
        .collect()
}

// --- Side effects ---

/// A foreign-key update on a backing entity implied by an explicit edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPatch {
    pub kind: EntityKind,
    pub id: String,
    pub fields: Map<String, Value>,
}

impl EntityPatch {
    fn single(kind: EntityKind, id: &str, field: &str, value: &str) -> Self {
        let mut fields = Map::new();
        fields.insert(field.to_string(), Value::String(value.to_string()));
        Self {
            kind,
            id: id.to_string(),
            fields,
        }
    }

    /// The same fields set to null: what disconnecting the edge writes back.
    pub fn cleared(&self) -> Self {
        Self {
            kind: self.kind,
            id: self.id.clone(),
            fields: self.fields.keys().map(|k| (k.clone(), Value::Null)).collect(),
        }
    }
}

/// The patch implied by connecting `source_id` to `target_id` with `kind`.
/// Ids are entity ids, not node ids.
pub fn entity_patch(kind: EdgeKind, source_id: &str, target_id: &str) -> Option<EntityPatch> {
    let patch = match kind {
        EdgeKind::AgentServer => EntityPatch::single(Agent, source_id, "connectionId", target_id),
        EdgeKind::AgentEnvironment => {
            EntityPatch::single(Agent, source_id, "environmentId", target_id)
        }
        EdgeKind::ServerTool => EntityPatch::single(Tool, target_id, "connectionId", source_id),
        EdgeKind::ToolServer => EntityPatch::single(Tool, source_id, "connectionId", target_id),
        EdgeKind::EnvironmentServer => {
            EntityPatch::single(Server, target_id, "environmentId", source_id)
        }
        EdgeKind::EnvironmentPolicy => {
            EntityPatch::single(Policy, target_id, "environmentId", source_id)
        }
        EdgeKind::EnvironmentResource => {
            EntityPatch::single(Resource, target_id, "environmentId", source_id)
        }
        EdgeKind::EnvironmentPrompt => {
            EntityPatch::single(Prompt, target_id, "environmentId", source_id)
        }
        EdgeKind::OrganizationEnvironment => {
            EntityPatch::single(Environment, target_id, "organizationId", source_id)
        }
        _ => return None,
    };
    Some(patch)
}

/// Human-readable dump of the matrix, one source kind per line.
pub fn describe_matrix() -> String {
    let mut out = String::new();
    for source in EntityKind::ALL {
        let targets: Vec<String> = valid_targets(source)
            .into_iter()
            .flat_map(|t| legal_kinds(source, t))
            .map(|k| k.to_string())
            .collect();
        let children: Vec<&str> = allowed_child_kinds(source).iter().map(|k| k.as_str()).collect();
        out.push_str(&format!(
            "{}: connects via [{}]; creatable children [{}]\n",
            source,
            targets.join(", "),
            children.join(", ")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_match_kind_names() {
        for kind in EdgeKind::ALL {
            let (s, t) = kind.endpoints();
            assert_eq!(kind.as_str(), format!("{}-{}", s, t));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<EdgeKind>(), Ok(kind));
        }
    }

    #[test]
    fn unknown_pairs_are_empty() {
        assert!(legal_kinds(Tool, Agent).is_empty());
        assert!(legal_kinds(Agent, Agent).is_empty());
        assert_eq!(default_kind(Resource, Prompt), None);
        assert_eq!(default_kind(Environment, Server), Some(EdgeKind::EnvironmentServer));
    }

    #[test]
    fn tool_and_server_connect_both_ways() {
        assert_eq!(default_kind(Tool, Server), Some(EdgeKind::ToolServer));
        assert_eq!(default_kind(Server, Tool), Some(EdgeKind::ServerTool));
        assert!(valid_sources(Tool).contains(&Server));
        assert!(valid_targets(Tool).contains(&Server));
    }

    #[test]
    fn child_kinds_are_always_connectable() {
        for a in EntityKind::ALL {
            for b in allowed_child_kinds(a) {
                assert!(!legal_kinds(a, b).is_empty(), "{a} -> {b} child without edge kind");
            }
            for p in allowed_parent_kinds(a) {
                assert!(!legal_kinds(p, a).is_empty(), "{p} -> {a} parent without edge kind");
            }
        }
    }

    #[test]
    fn parent_table_inverts_child_table() {
        assert_eq!(
            allowed_parent_kinds(Resource),
            [Agent, Policy, Environment, Prompt].into_iter().collect()
        );
        assert!(allowed_parent_kinds(Environment).is_empty());
        assert!(allowed_child_kinds(Tool).is_empty());
    }

    #[test]
    fn patches_point_at_the_owning_record() {
        let p = entity_patch(EdgeKind::AgentServer, "a1", "c1").unwrap();
        assert_eq!((p.kind, p.id.as_str()), (Agent, "a1"));
        assert_eq!(p.fields.get("connectionId"), Some(&Value::from("c1")));

        let p = entity_patch(EdgeKind::EnvironmentServer, "e1", "c1").unwrap();
        assert_eq!((p.kind, p.id.as_str()), (Server, "c1"));
        assert_eq!(p.fields.get("environmentId"), Some(&Value::from("e1")));
        let undo = p.cleared();
        assert_eq!((undo.kind, undo.id.as_str()), (Server, "c1"));
        assert_eq!(undo.fields.get("environmentId"), Some(&Value::Null));

        assert!(entity_patch(EdgeKind::AgentTool, "a1", "t1").is_none());
    }
}
