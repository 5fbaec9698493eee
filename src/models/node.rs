//! Represents a node (file or folder) in the metadata tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Identifier of a node, assigned by SQLite on insert.
pub type NodeId = i64;

/// A single file or folder.
///
/// Folders carry no blob reference and a stored size of zero; their size is
/// derived on demand from their descendants. File bytes live in the remote
/// blob store and are reached through `blob_ref`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Node {
    /// Unique identifier, immutable.
    pub id: NodeId,

    /// Display name. Not unique among siblings.
    pub name: String,

    /// Whether this node is a folder. Never changes after creation.
    pub is_folder: bool,

    /// Parent folder, or `None` for root-level nodes.
    pub parent_id: Option<NodeId>,

    /// Size in bytes. Only meaningful for files.
    pub size: i64,

    /// Opaque reference into the remote blob store (files only).
    pub blob_ref: Option<String>,

    /// Content type (MIME type), advisory.
    pub mime_type: Option<String>,

    /// MD5 checksum of the payload when it passed through the ingest gateway.
    pub etag: Option<String>,

    /// Caption attached to the platform message carrying the blob.
    pub caption: Option<String>,

    /// Insertion timestamp; default list ordering key.
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Lowercased extension of the node name, if any.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// Input for creating a node.
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub name: String,
    pub is_folder: bool,
    pub parent_id: Option<NodeId>,
    pub blob_ref: Option<String>,
    pub size: i64,
    pub mime_type: Option<String>,
    pub etag: Option<String>,
    pub caption: Option<String>,
}

impl NewNode {
    /// A folder named `name` under `parent_id`.
    pub fn folder(name: impl Into<String>, parent_id: Option<NodeId>) -> Self {
        Self {
            name: name.into(),
            is_folder: true,
            parent_id,
            ..Self::default()
        }
    }

    /// A file backed by `blob_ref` under `parent_id`.
    pub fn file(
        name: impl Into<String>,
        parent_id: Option<NodeId>,
        blob_ref: impl Into<String>,
        size: i64,
    ) -> Self {
        Self {
            name: name.into(),
            is_folder: false,
            parent_id,
            blob_ref: Some(blob_ref.into()),
            size,
            ..Self::default()
        }
    }

    pub fn with_mime_type(mut self, mime_type: Option<String>) -> Self {
        self.mime_type = mime_type;
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_caption(mut self, caption: Option<String>) -> Self {
        self.caption = caption;
        self
    }
}

/// Which nodes a listing should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope {
    /// Direct children of a folder, or root-level nodes for `None`.
    Children(Option<NodeId>),
    /// Every node in the tree.
    All,
}
