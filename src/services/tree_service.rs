//! src/services/tree_service.rs
//!
//! TreeService: the metadata tree of files and folders, stored as a single
//! SQLite table with parent pointers. Every invariant (existing folder parent,
//! no cycles, non-empty names) is checked before a statement is issued, so a
//! rejected call never leaves a partial write behind.
//!
//! Subtree discovery (size, delete) uses recursive CTEs joined with `UNION`,
//! which deduplicates rows and therefore terminates even if some other writer
//! managed to introduce a cycle. Ancestor walks (cycle guard, breadcrumbs) are
//! bounded by the total node count for the same reason.

use crate::models::node::{ListScope, NewNode, Node, NodeId};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const NODE_COLUMNS: &str =
    "id, name, is_folder, parent_id, size, blob_ref, mime_type, etag, caption, created_at";

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("node `{0}` not found")]
    NotFound(NodeId),
    #[error("parent `{0}` does not exist or is not a folder")]
    InvalidParent(NodeId),
    #[error("cannot move node `{id}` into `{target}`: {reason}")]
    InvalidMove {
        id: NodeId,
        target: NodeId,
        reason: &'static str,
    },
    #[error("name must not be empty")]
    InvalidName,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type TreeResult<T> = Result<T, TreeError>;

/// TreeService provides the folder-tree operations:
/// - Create, rename, move and delete nodes
/// - List one level or the whole tree
/// - Aggregate the size of a folder's subtree
/// - Resolve the breadcrumb path of a node
#[derive(Clone)]
pub struct TreeService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
}

impl TreeService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Trim a display name and reject it if nothing is left.
    fn normalize_name(name: &str) -> TreeResult<String> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(TreeError::InvalidName);
        }
        Ok(trimmed.to_string())
    }

    async fn fetch_optional(&self, id: NodeId) -> TreeResult<Option<Node>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?");
        let node = sqlx::query_as::<_, Node>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(node)
    }

    /// Fetch a node by id.
    pub async fn get(&self, id: NodeId) -> TreeResult<Node> {
        self.fetch_optional(id)
            .await?
            .ok_or(TreeError::NotFound(id))
    }

    /// Check that `parent_id` is either root or an existing folder.
    pub async fn ensure_parent(&self, parent_id: Option<NodeId>) -> TreeResult<()> {
        let Some(parent_id) = parent_id else {
            return Ok(());
        };
        match self.fetch_optional(parent_id).await? {
            Some(parent) if parent.is_folder => Ok(()),
            _ => Err(TreeError::InvalidParent(parent_id)),
        }
    }

    /// Validate a prospective node without writing it.
    pub async fn check_new(&self, new_node: &NewNode) -> TreeResult<()> {
        Self::normalize_name(&new_node.name)?;
        self.ensure_parent(new_node.parent_id).await
    }

    /// Insert a node after checking its name and parent.
    pub async fn create(&self, new_node: NewNode) -> TreeResult<Node> {
        let name = Self::normalize_name(&new_node.name)?;
        self.ensure_parent(new_node.parent_id).await?;

        let (blob_ref, size) = if new_node.is_folder {
            (None, 0)
        } else {
            (new_node.blob_ref, new_node.size.max(0))
        };

        let sql = format!(
            "INSERT INTO nodes (name, is_folder, parent_id, size, blob_ref, mime_type, etag, caption, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {NODE_COLUMNS}"
        );
        let node = sqlx::query_as::<_, Node>(&sql)
            .bind(&name)
            .bind(new_node.is_folder)
            .bind(new_node.parent_id)
            .bind(size)
            .bind(blob_ref)
            .bind(new_node.mime_type)
            .bind(new_node.etag)
            .bind(new_node.caption)
            .bind(Utc::now())
            .fetch_one(&*self.db)
            .await?;

        debug!(id = node.id, parent = ?node.parent_id, folder = node.is_folder, "created node");
        Ok(node)
    }

    /// Change a node's name. Nothing else is touched.
    pub async fn rename(&self, id: NodeId, new_name: &str) -> TreeResult<Node> {
        let name = Self::normalize_name(new_name)?;
        let sql = format!("UPDATE nodes SET name = ? WHERE id = ? RETURNING {NODE_COLUMNS}");
        sqlx::query_as::<_, Node>(&sql)
            .bind(&name)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(TreeError::NotFound(id))
    }

    /// Re-parent a node.
    ///
    /// Checks run in order: the node exists, the target is an existing
    /// folder, the target is not the node itself, and (for folders) the
    /// target is not one of the node's descendants.
    pub async fn move_node(&self, id: NodeId, new_parent_id: Option<NodeId>) -> TreeResult<Node> {
        let node = self.get(id).await?;

        if let Some(target) = new_parent_id {
            self.ensure_parent(Some(target)).await?;

            if target == id {
                return Err(TreeError::InvalidMove {
                    id,
                    target,
                    reason: "a node cannot be moved into itself",
                });
            }

            if node.is_folder && self.is_descendant(id, target).await? {
                return Err(TreeError::InvalidMove {
                    id,
                    target,
                    reason: "a folder cannot be moved into its own descendant",
                });
            }
        }

        let sql = format!("UPDATE nodes SET parent_id = ? WHERE id = ? RETURNING {NODE_COLUMNS}");
        let moved = sqlx::query_as::<_, Node>(&sql)
            .bind(new_parent_id)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(TreeError::NotFound(id))?;

        debug!(id, from = ?node.parent_id, to = ?new_parent_id, "moved node");
        Ok(moved)
    }

    /// Delete a node together with its whole subtree.
    ///
    /// Returns the number of removed rows. Deleting an unknown id is
    /// `NotFound`, so a retried delete never touches anything else.
    pub async fn delete(&self, id: NodeId) -> TreeResult<u64> {
        let mut tx = self.db.begin().await?;

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if exists == 0 {
            return Err(TreeError::NotFound(id));
        }

        let doomed = sqlx::query_scalar::<_, NodeId>(
            "WITH RECURSIVE subtree(id) AS (
                 SELECT ?
                 UNION
                 SELECT n.id FROM nodes n JOIN subtree s ON n.parent_id = s.id
             )
             SELECT id FROM subtree",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        debug!(id, descendants = doomed.len().saturating_sub(1), "deleting subtree");

        // Single statement so the foreign key sees the subtree vanish at once.
        let result = sqlx::query(
            "WITH RECURSIVE subtree(id) AS (
                 SELECT ?
                 UNION
                 SELECT n.id FROM nodes n JOIN subtree s ON n.parent_id = s.id
             )
             DELETE FROM nodes WHERE id IN subtree",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if result.rows_affected() != doomed.len() as u64 {
            warn!(
                id,
                discovered = doomed.len(),
                deleted = result.rows_affected(),
                "subtree changed while it was being deleted"
            );
        }
        Ok(result.rows_affected())
    }

    /// List nodes ordered by insertion time.
    pub async fn list(&self, scope: ListScope) -> TreeResult<Vec<Node>> {
        let nodes = match scope {
            ListScope::All => {
                let sql = format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY created_at ASC, id ASC");
                sqlx::query_as::<_, Node>(&sql).fetch_all(&*self.db).await?
            }
            ListScope::Children(None) => {
                let sql = format!(
                    "SELECT {NODE_COLUMNS} FROM nodes WHERE parent_id IS NULL
                     ORDER BY created_at ASC, id ASC"
                );
                sqlx::query_as::<_, Node>(&sql).fetch_all(&*self.db).await?
            }
            ListScope::Children(Some(parent_id)) => {
                let parent = self.get(parent_id).await?;
                if !parent.is_folder {
                    return Err(TreeError::InvalidParent(parent_id));
                }
                let sql = format!(
                    "SELECT {NODE_COLUMNS} FROM nodes WHERE parent_id = ?
                     ORDER BY created_at ASC, id ASC"
                );
                sqlx::query_as::<_, Node>(&sql)
                    .bind(parent_id)
                    .fetch_all(&*self.db)
                    .await?
            }
        };
        Ok(nodes)
    }

    /// Files sharing `node`'s parent, excluding `node` itself.
    pub async fn sibling_files(&self, node: &Node) -> TreeResult<Vec<Node>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE parent_id IS ? AND is_folder = 0 AND id <> ?
             ORDER BY created_at ASC, id ASC"
        );
        let siblings = sqlx::query_as::<_, Node>(&sql)
            .bind(node.parent_id)
            .bind(node.id)
            .fetch_all(&*self.db)
            .await?;
        Ok(siblings)
    }

    /// Sum of `size` over every file nested anywhere under `id`.
    pub async fn subtree_size(&self, id: NodeId) -> TreeResult<i64> {
        self.get(id).await?;

        let total = sqlx::query_scalar::<_, i64>(
            "WITH RECURSIVE subtree(id) AS (
                 SELECT id FROM nodes WHERE parent_id = ?
                 UNION
                 SELECT n.id FROM nodes n JOIN subtree s ON n.parent_id = s.id
             )
             SELECT COALESCE(SUM(size), 0) FROM nodes
             WHERE is_folder = 0 AND id IN subtree",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await?;
        Ok(total)
    }

    /// Nodes from the root-level ancestor down to `id`, inclusive.
    pub async fn path(&self, id: NodeId) -> TreeResult<Vec<Node>> {
        let limit = self.node_count().await?;
        let mut chain = vec![self.get(id).await?];

        while let Some(parent_id) = chain.last().and_then(|n| n.parent_id) {
            if chain.len() as i64 > limit {
                warn!(id, "ancestor chain exceeds node count; tree contains a cycle");
                break;
            }
            match self.fetch_optional(parent_id).await? {
                Some(parent) => chain.push(parent),
                None => {
                    warn!(id, parent_id, "ancestor chain references a missing parent");
                    break;
                }
            }
        }

        chain.reverse();
        Ok(chain)
    }

    /// Whether `candidate` lies in the subtree rooted at `root`.
    ///
    /// Walks `candidate`'s ancestors until reaching root level or `root`.
    /// The walk is capped at the node count; hitting the cap means the stored
    /// tree already holds a cycle, and the answer is `true` so the caller
    /// refuses to make it worse.
    pub async fn is_descendant(&self, root: NodeId, candidate: NodeId) -> TreeResult<bool> {
        let limit = self.node_count().await?;
        let mut current = Some(candidate);
        let mut steps: i64 = 0;

        while let Some(id) = current {
            if id == root {
                return Ok(true);
            }
            if steps > limit {
                warn!(root, candidate, "ancestor walk exceeded node count; tree contains a cycle");
                return Ok(true);
            }
            steps += 1;
            current = sqlx::query_scalar::<_, Option<NodeId>>("SELECT parent_id FROM nodes WHERE id = ?")
                .bind(id)
                .fetch_optional(&*self.db)
                .await?
                .flatten();
        }

        Ok(false)
    }

    async fn node_count(&self) -> TreeResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM nodes")
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }
}
