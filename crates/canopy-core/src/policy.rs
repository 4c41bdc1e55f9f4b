//! Policy edge resolver.
//!
//! Turns policy rules and bindings into the agent → tool and agent → resource
//! relationships they allow. These become derived edges on the canvas and
//! are recomputed wholesale whenever policy data changes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::catalog::{CatalogEntry, EntityCatalog};
use crate::rules::EdgeKind;
use crate::EntityKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleEffect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub id: String,
    pub policy_id: String,
    pub effect: RuleEffect,
    /// e.g. "tool.invoke", "resource.read"
    pub action: String,
    /// `"{kind}:{pattern}"`, e.g. "tool:ns/*"
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyBinding {
    pub id: String,
    pub policy_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverOptions {
    pub deny_overrides: bool,
}

/// Why an agent may reach a target: the owning policy and the combined verbs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyGrant {
    pub policy_id: String,
    pub policy_name: String,
    /// Deduplicated, sorted, comma-joined verbs ("invoke", "read,write").
    pub action: String,
    pub rule_ids: Vec<String>,
}

/// An agent-scoped relationship implied by policy, keyed by node ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedEdge {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    pub grant: PolicyGrant,
}

// --- Pattern matching ---

#[derive(Debug, Clone)]
enum TargetPattern {
    Any,
    Subtree(String),
    Glob(Regex),
    Exact(String),
    /// A pattern that failed to compile; matches nothing.
    Never,
}

impl TargetPattern {
    fn compile(pattern: &str) -> Self {
        if pattern == "*" {
            return TargetPattern::Any;
        }
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return TargetPattern::Subtree(prefix.to_string());
        }
        if pattern.contains('*') {
            let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
            let source = format!("^{}$", escaped.join(".*"));
            return match Regex::new(&source) {
                Ok(re) => TargetPattern::Glob(re),
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "unusable policy target pattern");
                    TargetPattern::Never
                }
            };
        }
        TargetPattern::Exact(pattern.to_string())
    }

    fn matches(&self, identifier: &str) -> bool {
        match self {
            TargetPattern::Any => true,
            TargetPattern::Subtree(prefix) => {
                identifier == prefix
                    || identifier
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            TargetPattern::Glob(re) => re.is_match(identifier),
            TargetPattern::Exact(s) => s == identifier,
            TargetPattern::Never => false,
        }
    }
}

/// Match a rule's target pattern against an entity identifier.
pub fn matches_pattern(pattern: &str, identifier: &str) -> bool {
    TargetPattern::compile(pattern).matches(identifier)
}

/// Split an action into the entity kind it applies to and its verb.
fn parse_action(action: &str) -> Option<(EntityKind, &'static str)> {
    match action.trim() {
        "tool.invoke" => Some((EntityKind::Tool, "invoke")),
        "resource.read" => Some((EntityKind::Resource, "read")),
        "resource.write" => Some((EntityKind::Resource, "write")),
        _ => None,
    }
}

fn parse_target(target: &str) -> Option<(EntityKind, &str)> {
    let (kind, pattern) = target.split_once(':')?;
    let kind: EntityKind = kind.parse().ok()?;
    Some((kind, pattern))
}

struct CompiledRule<'a> {
    rule: &'a PolicyRule,
    kind: EntityKind,
    verb: &'static str,
    pattern: TargetPattern,
}

// --- Resolver ---

pub struct PolicyResolver<'a> {
    catalog: &'a EntityCatalog,
    bindings: &'a [PolicyBinding],
    rules: Vec<CompiledRule<'a>>,
    options: ResolverOptions,
}

impl<'a> PolicyResolver<'a> {
    pub fn new(
        catalog: &'a EntityCatalog,
        rules: &'a [PolicyRule],
        bindings: &'a [PolicyBinding],
        options: ResolverOptions,
    ) -> Self {
        let rules = rules
            .iter()
            .filter_map(|rule| {
                let (kind, verb) = parse_action(&rule.action)?;
                let (target_kind, pattern) = parse_target(&rule.target)?;
                if target_kind != kind {
                    tracing::debug!(rule = %rule.id, "rule target kind does not match its action");
                    return None;
                }
                Some(CompiledRule {
                    rule,
                    kind,
                    verb,
                    pattern: TargetPattern::compile(pattern),
                })
            })
            .collect();
        Self {
            catalog,
            bindings,
            rules,
            options,
        }
    }

    /// Policies that apply to `agent`: explicitly bound ones plus every
    /// enabled policy that is unrestricted or scoped to the agent's environment.
    pub fn bound_policies(&self, agent: &CatalogEntry) -> Vec<&'a CatalogEntry> {
        let bound: HashSet<&str> = self
            .bindings
            .iter()
            .filter(|b| b.agent_id.as_deref() == Some(agent.id.as_str()))
            .map(|b| b.policy_id.as_str())
            .collect();
        self.catalog
            .of_kind(EntityKind::Policy)
            .filter(|p| p.enabled)
            .filter(|p| {
                bound.contains(p.id.as_str())
                    || match p.raw.environment_id.as_deref() {
                        None => true,
                        Some(env) => agent.raw.environment_id.as_deref() == Some(env),
                    }
            })
            .collect()
    }

    /// Targets `agent` may reach, keyed by target node id.
    pub fn grants_for(&self, agent: &CatalogEntry) -> BTreeMap<String, PolicyGrant> {
        let policies = self.bound_policies(agent);
        let policy_of = |id: &str| policies.iter().find(|p| p.id == id).copied();

        struct Acc {
            policy_id: String,
            policy_name: String,
            allow: BTreeSet<&'static str>,
            deny: BTreeSet<&'static str>,
            rule_ids: Vec<String>,
        }
        let mut acc: BTreeMap<String, Acc> = BTreeMap::new();
        let mut denied: BTreeMap<String, BTreeSet<&'static str>> = BTreeMap::new();

        for compiled in &self.rules {
            let Some(policy) = policy_of(&compiled.rule.policy_id) else {
                continue;
            };
            for candidate in self.catalog.of_kind(compiled.kind) {
                if !compiled.pattern.matches(&candidate.match_identifier()) {
                    continue;
                }
                let node_id = candidate.node_id();
                match compiled.rule.effect {
                    RuleEffect::Allow => {
                        let entry = acc.entry(node_id).or_insert_with(|| Acc {
                            policy_id: policy.id.clone(),
                            policy_name: policy.display_name.clone(),
                            allow: BTreeSet::new(),
                            deny: BTreeSet::new(),
                            rule_ids: Vec::new(),
                        });
                        entry.allow.insert(compiled.verb);
                        if !entry.rule_ids.contains(&compiled.rule.id) {
                            entry.rule_ids.push(compiled.rule.id.clone());
                        }
                    }
                    RuleEffect::Deny => {
                        denied.entry(node_id).or_default().insert(compiled.verb);
                    }
                }
            }
        }

        if self.options.deny_overrides {
            for (node_id, verbs) in denied {
                if let Some(entry) = acc.get_mut(&node_id) {
                    entry.deny = verbs;
                }
            }
        }

        acc.into_iter()
            .filter_map(|(node_id, a)| {
                let verbs: Vec<&str> = a.allow.difference(&a.deny).copied().collect();
                if verbs.is_empty() {
                    return None;
                }
                Some((
                    node_id,
                    PolicyGrant {
                        policy_id: a.policy_id,
                        policy_name: a.policy_name,
                        action: verbs.join(","),
                        rule_ids: a.rule_ids,
                    },
                ))
            })
            .collect()
    }

    /// Every derived edge for every agent in the catalog.
    pub fn resolve(&self) -> Vec<DerivedEdge> {
        let mut out = Vec::new();
        for agent in self.catalog.of_kind(EntityKind::Agent) {
            let source = agent.node_id();
            for (target, grant) in self.grants_for(agent) {
                let kind = if target.starts_with("tool-") {
                    EdgeKind::AgentTool
                } else {
                    EdgeKind::AgentResource
                };
                out.push(DerivedEdge {
                    source: source.clone(),
                    target,
                    kind,
                    grant,
                });
            }
        }
        tracing::debug!(count = out.len(), "resolved policy-derived edges");
        out
    }
}
