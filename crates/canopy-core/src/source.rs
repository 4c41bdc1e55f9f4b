//! Collaborator seams: where entities, policy data and snapshots come from,
//! and where entity patches go. The canvas core only sees these traits.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::catalog::{EntityCatalog, EntityRecord};
use crate::error::CanvasError;
use crate::persist::CanvasState;
use crate::policy::{PolicyBinding, PolicyRule};
use crate::{canopy_dir, write_atomic, EntityKind};

// --- Traits ---

/// Entity lists for one organization.
pub trait CatalogSource {
    fn list_entities(&self, org_id: &str, kind: EntityKind) -> Result<Vec<EntityRecord>, CanvasError>;

    fn list_agents(&self, org_id: &str) -> Result<Vec<EntityRecord>, CanvasError> {
        self.list_entities(org_id, EntityKind::Agent)
    }

    fn list_tools(&self, org_id: &str) -> Result<Vec<EntityRecord>, CanvasError> {
        self.list_entities(org_id, EntityKind::Tool)
    }

    fn list_resources(&self, org_id: &str) -> Result<Vec<EntityRecord>, CanvasError> {
        self.list_entities(org_id, EntityKind::Resource)
    }

    fn list_policies(&self, org_id: &str) -> Result<Vec<EntityRecord>, CanvasError> {
        self.list_entities(org_id, EntityKind::Policy)
    }

    fn list_connections(&self, org_id: &str) -> Result<Vec<EntityRecord>, CanvasError> {
        self.list_entities(org_id, EntityKind::Server)
    }

    fn list_environments(&self, org_id: &str) -> Result<Vec<EntityRecord>, CanvasError> {
        self.list_entities(org_id, EntityKind::Environment)
    }

    fn list_prompts(&self, org_id: &str) -> Result<Vec<EntityRecord>, CanvasError> {
        self.list_entities(org_id, EntityKind::Prompt)
    }

    fn list_organizations(&self, org_id: &str) -> Result<Vec<EntityRecord>, CanvasError> {
        self.list_entities(org_id, EntityKind::Organization)
    }

    /// Fetch every list and normalize them into one catalog.
    fn fetch_catalog(&self, org_id: &str) -> Result<EntityCatalog, CanvasError> {
        let mut catalog = EntityCatalog::new();
        for kind in EntityKind::ALL {
            catalog.extend(kind, self.list_entities(org_id, kind)?);
        }
        Ok(catalog)
    }
}

pub trait PolicySource {
    fn list_policy_rules(&self, org_id: &str) -> Result<Vec<PolicyRule>, CanvasError>;
    fn list_policy_bindings(&self, org_id: &str) -> Result<Vec<PolicyBinding>, CanvasError>;
}

/// Snapshot persistence. `load` returns `Ok(None)` when nothing was ever
/// saved; that is not a failure.
pub trait SnapshotStore {
    fn load(&self, org_id: &str) -> Result<Option<CanvasState>, CanvasError>;
    fn save(&self, org_id: &str, state: &CanvasState) -> Result<(), CanvasError>;

    fn clear(&self, _org_id: &str) -> Result<(), CanvasError> {
        Ok(())
    }
}

/// Foreign-key updates on backing entities. Returns the updated record.
pub trait EntityPatcher {
    fn patch_entity(
        &self,
        org_id: &str,
        kind: EntityKind,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<EntityRecord, CanvasError>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- Catalog document ---

/// One organization's platform data as a single JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogData {
    pub agents: Vec<EntityRecord>,
    pub tools: Vec<EntityRecord>,
    pub resources: Vec<EntityRecord>,
    pub policies: Vec<EntityRecord>,
    pub connections: Vec<EntityRecord>,
    pub environments: Vec<EntityRecord>,
    pub prompts: Vec<EntityRecord>,
    pub organizations: Vec<EntityRecord>,
    pub policy_rules: Vec<PolicyRule>,
    pub policy_bindings: Vec<PolicyBinding>,
}

impl CatalogData {
    pub fn records(&self, kind: EntityKind) -> &Vec<EntityRecord> {
        match kind {
            EntityKind::Agent => &self.agents,
            EntityKind::Tool => &self.tools,
            EntityKind::Resource => &self.resources,
            EntityKind::Policy => &self.policies,
            EntityKind::Server => &self.connections,
            EntityKind::Environment => &self.environments,
            EntityKind::Prompt => &self.prompts,
            EntityKind::Organization => &self.organizations,
        }
    }

    pub fn records_mut(&mut self, kind: EntityKind) -> &mut Vec<EntityRecord> {
        match kind {
            EntityKind::Agent => &mut self.agents,
            EntityKind::Tool => &mut self.tools,
            EntityKind::Resource => &mut self.resources,
            EntityKind::Policy => &mut self.policies,
            EntityKind::Server => &mut self.connections,
            EntityKind::Environment => &mut self.environments,
            EntityKind::Prompt => &mut self.prompts,
            EntityKind::Organization => &mut self.organizations,
        }
    }

    pub fn patch(
        &mut self,
        kind: EntityKind,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<EntityRecord, CanvasError> {
        let record = self
            .records_mut(kind)
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CanvasError::Patch(format!("{} '{}' not found", kind, id)))?;
        record
            .apply_patch(fields)
            .map_err(|e| CanvasError::Patch(e.to_string()))?;
        Ok(record.clone())
    }
}

/// In-process catalog shared between clones. Serves a single organization,
/// so `org_id` arguments are ignored.
#[derive(Debug, Clone, Default)]
pub struct CatalogDocument {
    data: Arc<Mutex<CatalogData>>,
}

impl CatalogDocument {
    pub fn new(data: CatalogData) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, CanvasError> {
        Ok(Self::new(serde_json::from_str(raw)?))
    }

    pub fn snapshot(&self) -> CatalogData {
        lock(&self.data).clone()
    }

    /// Mutate the document in place, e.g. to simulate the platform adding
    /// an entity or a rule.
    pub fn update<R>(&self, f: impl FnOnce(&mut CatalogData) -> R) -> R {
        let mut data = lock(&self.data);
        f(&mut *data)
    }
}

impl CatalogSource for CatalogDocument {
    fn list_entities(&self, _org_id: &str, kind: EntityKind) -> Result<Vec<EntityRecord>, CanvasError> {
        Ok(lock(&self.data).records(kind).clone())
    }
}

impl PolicySource for CatalogDocument {
    fn list_policy_rules(&self, _org_id: &str) -> Result<Vec<PolicyRule>, CanvasError> {
        Ok(lock(&self.data).policy_rules.clone())
    }

    fn list_policy_bindings(&self, _org_id: &str) -> Result<Vec<PolicyBinding>, CanvasError> {
        Ok(lock(&self.data).policy_bindings.clone())
    }
}

impl EntityPatcher for CatalogDocument {
    fn patch_entity(
        &self,
        _org_id: &str,
        kind: EntityKind,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<EntityRecord, CanvasError> {
        lock(&self.data).patch(kind, id, fields)
    }
}

// --- File catalog ---

/// Catalog documents on disk, one `{org}.json` per organization. Every call
/// re-reads the file, so edits made by other processes show up on refresh.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    dir: PathBuf,
}

impl FileCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.canopy/catalogs/`
    pub fn default_location() -> Self {
        Self::new(canopy_dir().join("catalogs"))
    }

    fn path(&self, org_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", org_id))
    }

    pub fn read(&self, org_id: &str) -> Result<CatalogData, CanvasError> {
        let path = self.path(org_id);
        let raw = fs::read_to_string(&path)
            .map_err(|e| CanvasError::Catalog(format!("{}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write(&self, org_id: &str, data: &CatalogData) -> Result<(), CanvasError> {
        let json = serde_json::to_string_pretty(data)?;
        write_atomic(&self.path(org_id), &json)?;
        Ok(())
    }
}

impl CatalogSource for FileCatalog {
    fn list_entities(&self, org_id: &str, kind: EntityKind) -> Result<Vec<EntityRecord>, CanvasError> {
        Ok(self.read(org_id)?.records(kind).clone())
    }

    // One read for all eight lists.
    fn fetch_catalog(&self, org_id: &str) -> Result<EntityCatalog, CanvasError> {
        let data = self.read(org_id)?;
        let mut catalog = EntityCatalog::new();
        for kind in EntityKind::ALL {
            catalog.extend(kind, data.records(kind).iter().cloned());
        }
        Ok(catalog)
    }
}

impl PolicySource for FileCatalog {
    fn list_policy_rules(&self, org_id: &str) -> Result<Vec<PolicyRule>, CanvasError> {
        Ok(self.read(org_id)?.policy_rules)
    }

    fn list_policy_bindings(&self, org_id: &str) -> Result<Vec<PolicyBinding>, CanvasError> {
        Ok(self.read(org_id)?.policy_bindings)
    }
}

impl EntityPatcher for FileCatalog {
    fn patch_entity(
        &self,
        org_id: &str,
        kind: EntityKind,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<EntityRecord, CanvasError> {
        let mut data = self.read(org_id)?;
        let updated = data.patch(kind, id, fields)?;
        self.write(org_id, &data)?;
        Ok(updated)
    }
}

// --- Snapshot stores ---

/// Snapshots as `{org}.json` files in one directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, org_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", org_id))
    }

    /// Organizations with a stored snapshot, sorted.
    pub fn list(&self) -> Result<Vec<String>, CanvasError> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        let mut orgs: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json")
                    .filter(|n| !n.starts_with('.'))
                    .map(str::to_string)
            })
            .collect();
        orgs.sort();
        Ok(orgs)
    }
}

impl SnapshotStore for FileStore {
    fn load(&self, org_id: &str) -> Result<Option<CanvasState>, CanvasError> {
        let path = self.path(org_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let state = serde_json::from_str(&raw)
            .map_err(|e| CanvasError::Store(format!("{}: {}", path.display(), e)))?;
        Ok(Some(state))
    }

    fn save(&self, org_id: &str, state: &CanvasState) -> Result<(), CanvasError> {
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.path(org_id), &json)
            .map_err(|e| CanvasError::Store(format!("{}: {}", self.path(org_id).display(), e)))
    }

    fn clear(&self, org_id: &str) -> Result<(), CanvasError> {
        let path = self.path(org_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshots: HashMap<String, CanvasState>,
    fail_saves: bool,
    fail_loads: bool,
    saves: usize,
}

/// In-process snapshot store. Clones share state. The failure switches make
/// it stand in for an unreachable remote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        lock(&self.inner).fail_saves = fail;
    }

    pub fn set_fail_loads(&self, fail: bool) {
        lock(&self.inner).fail_loads = fail;
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        lock(&self.inner).saves
    }

    pub fn get(&self, org_id: &str) -> Option<CanvasState> {
        lock(&self.inner).snapshots.get(org_id).cloned()
    }

    pub fn put(&self, org_id: &str, state: CanvasState) {
        lock(&self.inner).snapshots.insert(org_id.to_string(), state);
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, org_id: &str) -> Result<Option<CanvasState>, CanvasError> {
        let inner = lock(&self.inner);
        if inner.fail_loads {
            return Err(CanvasError::Store("load failed: store unavailable".into()));
        }
        Ok(inner.snapshots.get(org_id).cloned())
    }

    fn save(&self, org_id: &str, state: &CanvasState) -> Result<(), CanvasError> {
        let mut inner = lock(&self.inner);
        if inner.fail_saves {
            return Err(CanvasError::Store("save failed: store unavailable".into()));
        }
        inner.snapshots.insert(org_id.to_string(), state.clone());
        inner.saves += 1;
        Ok(())
    }

    fn clear(&self, org_id: &str) -> Result<(), CanvasError> {
        lock(&self.inner).snapshots.remove(org_id);
        Ok(())
    }
}
