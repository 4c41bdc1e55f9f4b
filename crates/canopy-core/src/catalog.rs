//! Normalizes the platform's entity lists into one uniform catalog shape.
//!
//! Every entity kind is carried by the same [`EntityRecord`]; kind-specific
//! foreign keys are optional members and only meaningful for the kinds that
//! own them (see the table on each field).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::{EntityKind, NodeStatus};

fn default_enabled() -> bool {
    true
}

/// A backing record as reported by the surrounding platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Health string reported by connections ("connected", "error", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Tools only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Agents and tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Agents, resources, policies, connections, prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    /// Environments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Prompts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EntityRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            status: None,
            namespace: None,
            connection_id: None,
            environment_id: None,
            organization_id: None,
            resource_ids: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Apply a JSON patch of top-level fields (camelCase keys) to the record.
    pub fn apply_patch(&mut self, fields: &Map<String, Value>) -> Result<(), serde_json::Error> {
        let mut val = serde_json::to_value(&*self)?;
        if let Value::Object(map) = &mut val {
            for (k, v) in fields {
                map.insert(k.clone(), v.clone());
            }
        }
        *self = serde_json::from_value(val)?;
        Ok(())
    }
}

/// The uniform `{id, kind, displayName, enabled, raw}` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    pub kind: EntityKind,
    pub display_name: String,
    pub enabled: bool,
    pub raw: EntityRecord,
}

impl CatalogEntry {
    pub fn from_record(kind: EntityKind, raw: EntityRecord) -> Self {
        let display_name = if raw.name.trim().is_empty() {
            raw.id.clone()
        } else {
            raw.name.clone()
        };
        Self {
            id: raw.id.clone(),
            kind,
            display_name,
            enabled: raw.enabled,
            raw,
        }
    }

    /// The canvas node id for this entity.
    pub fn node_id(&self) -> String {
        crate::graph::entity_node_id(self.kind, &self.id)
    }

    /// Identifier that policy target patterns are matched against:
    /// `namespace/name` for namespaced tools, the bare name otherwise.
    pub fn match_identifier(&self) -> String {
        match (&self.kind, self.raw.namespace.as_deref()) {
            (EntityKind::Tool, Some(ns)) if !ns.is_empty() => format!("{}/{}", ns, self.raw.name),
            _ => self.raw.name.clone(),
        }
    }

    pub fn status(&self) -> NodeStatus {
        if !self.enabled {
            return NodeStatus::Disabled;
        }
        match self.raw.status.as_deref() {
            Some(s) => NodeStatus::parse(s),
            None => NodeStatus::Connected,
        }
    }
}

/// All entities of one organization, in catalog order, indexed by kind and id.
#[derive(Debug, Clone, Default)]
pub struct EntityCatalog {
    entries: Vec<CatalogEntry>,
    index: HashMap<(EntityKind, String), usize>,
}

impl EntityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize one fetched list and append it. A record whose id was
    /// already seen for the same kind replaces the earlier one.
    pub fn extend(&mut self, kind: EntityKind, records: impl IntoIterator<Item = EntityRecord>) {
        for raw in records {
            let entry = CatalogEntry::from_record(kind, raw);
            let key = (kind, entry.id.clone());
            match self.index.get(&key) {
                Some(&i) => self.entries[i] = entry,
                None => {
                    self.index.insert(key, self.entries.len());
                    self.entries.push(entry);
                }
            }
        }
    }

    pub fn with(mut self, kind: EntityKind, records: impl IntoIterator<Item = EntityRecord>) -> Self {
        self.extend(kind, records);
        self
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&CatalogEntry> {
        self.index
            .get(&(kind, id.to_string()))
            .map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace a record in place, e.g. after a successful entity patch.
    pub fn upsert(&mut self, entry: CatalogEntry) {
        let key = (entry.kind, entry.id.clone());
        match self.index.get(&key) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(entry);
            }
        }
    }
}
