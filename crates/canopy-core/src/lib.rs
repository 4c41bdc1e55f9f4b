pub mod catalog;
pub mod error;
pub mod graph;
pub mod layout;
pub mod persist;
pub mod policy;
pub mod rules;
pub mod session;
pub mod source;

pub use catalog::{CatalogEntry, EntityCatalog};
pub use error::{CanvasError, ValidationError};
pub use graph::{CanvasGraph, Edge, EdgeConfig, EdgeOrigin, GraphEvent, NeighborSide, Node};
pub use layout::LayoutConfig;
pub use persist::{CanvasState, ExportDocument, MergePhase, SaveReport, SaveScheduler, Viewport};
pub use policy::{PolicyBinding, PolicyRule, ResolverOptions, RuleEffect};
pub use rules::EdgeKind;
pub use session::{CanvasFilter, CanvasSession, LoadReport, LoadSource};
pub use source::{CatalogSource, EntityPatcher, PolicySource, SnapshotStore};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// --- Types ---

/// The closed set of domain entities a canvas node can stand for.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Agent,
    Tool,
    Resource,
    Policy,
    Server,
    Environment,
    Organization,
    Prompt,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Agent,
        EntityKind::Tool,
        EntityKind::Resource,
        EntityKind::Policy,
        EntityKind::Server,
        EntityKind::Environment,
        EntityKind::Organization,
        EntityKind::Prompt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Agent => "agent",
            EntityKind::Tool => "tool",
            EntityKind::Resource => "resource",
            EntityKind::Policy => "policy",
            EntityKind::Server => "server",
            EntityKind::Environment => "environment",
            EntityKind::Organization => "organization",
            EntityKind::Prompt => "prompt",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "agent" => Ok(EntityKind::Agent),
            "tool" => Ok(EntityKind::Tool),
            "resource" => Ok(EntityKind::Resource),
            "policy" => Ok(EntityKind::Policy),
            // The platform calls servers "connections" in most of its APIs.
            "server" | "connection" => Ok(EntityKind::Server),
            "environment" => Ok(EntityKind::Environment),
            "organization" => Ok(EntityKind::Organization),
            "prompt" => Ok(EntityKind::Prompt),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Connected,
    Error,
    Unauthorized,
    Disabled,
    #[default]
    Unknown,
}

impl NodeStatus {
    pub fn parse(s: &str) -> NodeStatus {
        match s.trim().to_lowercase().as_str() {
            "connected" | "active" | "healthy" => NodeStatus::Connected,
            "error" | "failed" => NodeStatus::Error,
            "unauthorized" => NodeStatus::Unauthorized,
            "disabled" => NodeStatus::Disabled,
            _ => NodeStatus::Unknown,
        }
    }
}

/// Canvas coordinates. Every write path runs through [`Position::sanitize`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, schemars::JsonSchema)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Returns `self` when both coordinates are finite, otherwise `fallback`
    /// (or the origin if the fallback is itself unusable).
    pub fn sanitize(self, fallback: Position) -> Position {
        if self.is_finite() {
            self
        } else if fallback.is_finite() {
            fallback
        } else {
            Position::ORIGIN
        }
    }

    pub fn offset(self, dx: f64, dy: f64) -> Position {
        Position::new(self.x + dx, self.y + dy)
    }
}

// --- Storage ---

/// Resolve the canopy home directory (`$CANOPY_HOME`, else `~/.canopy/`).
pub fn canopy_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("CANOPY_HOME") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".canopy")
}

/// Write a file atomically (temp file + rename) so readers never observe a
/// truncated document.
pub fn write_atomic(path: &Path, data: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "canopy".to_string());
    let tmp = dir.join(format!(".{}.tmp", file_name));
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

// --- Settings ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CanvasSettings {
    /// Trailing-edge debounce window for snapshot saves.
    pub debounce_ms: u64,
    pub default_org: Option<String>,
    /// Let a matching deny rule suppress an allow-derived edge.
    pub deny_overrides: bool,
    pub layout: LayoutConfig,
}

impl Default for CanvasSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            default_org: None,
            deny_overrides: false,
            layout: LayoutConfig::default(),
        }
    }
}

impl CanvasSettings {
    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            deny_overrides: self.deny_overrides,
        }
    }
}

fn settings_path() -> PathBuf {
    canopy_dir().join("settings.json")
}

/// Read settings from disk. A missing or unreadable file yields defaults.
pub fn read_settings() -> CanvasSettings {
    let path = settings_path();
    if !path.exists() {
        return CanvasSettings::default();
    }
    match fs::read_to_string(&path)
        .map_err(CanvasError::from)
        .and_then(|s| serde_json::from_str(&s).map_err(CanvasError::from))
    {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings");
            CanvasSettings::default()
        }
    }
}

pub fn write_settings(settings: &CanvasSettings) -> Result<(), CanvasError> {
    let json = serde_json::to_string_pretty(settings)?;
    write_atomic(&settings_path(), &json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_non_finite_coordinates() {
        let bad = Position::new(f64::NAN, 5.0);
        assert_eq!(bad.sanitize(Position::ORIGIN), Position::ORIGIN);
        assert_eq!(
            Position::new(1.0, f64::INFINITY).sanitize(Position::new(7.0, 8.0)),
            Position::new(7.0, 8.0)
        );
        assert_eq!(
            bad.sanitize(Position::new(f64::NAN, 1.0)),
            Position::ORIGIN
        );
        assert_eq!(Position::new(3.0, 4.0).sanitize(Position::ORIGIN), Position::new(3.0, 4.0));
    }

    #[test]
    fn entity_kind_parses_connection_alias() {
        assert_eq!("connection".parse::<EntityKind>(), Ok(EntityKind::Server));
        assert_eq!("Agent".parse::<EntityKind>(), Ok(EntityKind::Agent));
        assert!("widget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn settings_fill_missing_keys_with_defaults() {
        let s: CanvasSettings = serde_json::from_str(r#"{"denyOverrides": true}"#).unwrap();
        assert!(s.deny_overrides);
        assert_eq!(s.debounce_ms, 1000);
        assert_eq!(s.layout, LayoutConfig::default());
    }
}
