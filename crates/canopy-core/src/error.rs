use thiserror::Error;

use crate::rules::EdgeKind;
use crate::EntityKind;

/// Rejections raised at the graph boundary when a proposed edge or neighbor
/// would break the compatibility matrix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("edge kind '{kind}' is not legal between {source_kind} and {target_kind}")]
    InvalidEdgeKind {
        kind: EdgeKind,
        source_kind: EntityKind,
        target_kind: EntityKind,
    },
    #[error("{source_kind} cannot connect to {target_kind}")]
    NoLegalEdgeKind {
        source_kind: EntityKind,
        target_kind: EntityKind,
    },
    #[error("node '{0}' does not exist")]
    UnknownNode(String),
    #[error("{kind} cannot be created next to a {anchor}")]
    NotCreatable { anchor: EntityKind, kind: EntityKind },
}

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("node '{0}' not found")]
    NodeNotFound(String),
    #[error("node '{0}' already exists")]
    DuplicateNode(String),
    #[error("edge '{0}' not found")]
    EdgeNotFound(String),
    #[error("node '{0}' is not a placeholder")]
    NotPlaceholder(String),
    #[error("snapshot store: {0}")]
    Store(String),
    #[error("entity patch failed: {0}")]
    Patch(String),
    #[error("catalog: {0}")]
    Catalog(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
