//! src/services/ingest_service.rs
//!
//! IngestService: turns incoming payloads into file nodes.
//!
//! Two entry points share the same tail: multipart uploads, whose bytes are
//! forwarded to the remote blob store first, and platform updates, whose
//! attachment already lives there. In both cases the node is only recorded
//! after the blob exists; a metadata failure at that point leaves an orphaned
//! blob and is reported as `IngestFailed`.

use crate::{
    models::{
        node::{NewNode, Node, NodeId},
        platform::{Message, Update},
    },
    services::{
        blob_client::{BlobError, BlobUpload, RemoteBlobStore},
        tree_service::{TreeError, TreeService},
    },
};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(
        "file is {size} bytes but uploads are limited to {limit} bytes; send larger files through the messaging app directly"
    )]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("upload to remote blob store failed: {0}")]
    Upstream(#[from] BlobError),
    #[error("blob `{blob_ref}` was stored but its metadata could not be saved: {source}")]
    IngestFailed {
        blob_ref: String,
        #[source]
        source: TreeError,
    },
}

pub type IngestResult<T> = Result<T, IngestError>;

/// A client upload, fully buffered.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub parent_id: Option<NodeId>,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
    pub payload: Bytes,
}

/// Attachment of a platform message, ready to become a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFile {
    pub name: String,
    pub blob_ref: String,
    pub size: i64,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
}

/// Build a node description from a message, or `None` when it carries no file.
pub fn normalize_message(message: &Message) -> Option<IncomingFile> {
    let attachment = message.attachment()?;
    let kind = attachment.kind;

    let name = attachment
        .file_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| {
            format!(
                "{}_{}.{}",
                kind.as_str(),
                message.message_id,
                kind.default_extension()
            )
        });

    let mime_type = attachment
        .mime_type
        .filter(|m| !m.trim().is_empty())
        .or_else(|| kind.default_mime_type().map(str::to_string))
        .or_else(|| guess_mime(&name));

    Some(IncomingFile {
        name,
        blob_ref: attachment.file_id,
        size: attachment.file_size.unwrap_or(0).max(0),
        mime_type,
        caption: message.caption.clone().filter(|c| !c.is_empty()),
    })
}

fn guess_mime(name: &str) -> Option<String> {
    mime_guess::from_path(name).first().map(|m| m.to_string())
}

/// IngestService records uploaded and pushed files in the tree.
#[derive(Clone)]
pub struct IngestService {
    tree: TreeService,
    blobs: Arc<dyn RemoteBlobStore>,
    max_upload_bytes: u64,
}

impl IngestService {
    pub fn new(tree: TreeService, blobs: Arc<dyn RemoteBlobStore>, max_upload_bytes: u64) -> Self {
        Self {
            tree,
            blobs,
            max_upload_bytes,
        }
    }

    /// Reject payloads over the upload ceiling.
    pub fn check_size(&self, size: u64) -> IngestResult<()> {
        if size > self.max_upload_bytes {
            return Err(IngestError::PayloadTooLarge {
                size,
                limit: self.max_upload_bytes,
            });
        }
        Ok(())
    }

    /// Store an uploaded payload remotely and record it as a file node.
    ///
    /// Size, name and parent are checked before anything leaves the process.
    pub async fn upload(&self, request: UploadRequest) -> IngestResult<Node> {
        let size = request.payload.len() as u64;
        self.check_size(size)?;

        let probe = NewNode::file(&request.file_name, request.parent_id, "", size as i64);
        self.tree.check_new(&probe).await?;

        let file_name = request.file_name.trim().to_string();
        let etag = format!("{:x}", md5::compute(&request.payload));
        let mime_type = request
            .mime_type
            .filter(|m| !m.trim().is_empty() && m != "application/octet-stream")
            .or_else(|| guess_mime(&file_name));
        let caption = request
            .caption
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| file_name.clone());

        let stored = self
            .blobs
            .upload(BlobUpload {
                file_name: file_name.clone(),
                mime_type: mime_type.clone(),
                caption: Some(caption.clone()),
                payload: request.payload,
            })
            .await?;
        debug!(blob_ref = %stored.blob_ref, size, "payload stored remotely");

        let new_node = NewNode::file(file_name, request.parent_id, stored.blob_ref.clone(), size as i64)
            .with_mime_type(mime_type)
            .with_etag(Some(etag))
            .with_caption(Some(caption));
        let node = self.record(new_node, stored.blob_ref).await?;
        info!(id = node.id, name = %node.name, size, "uploaded file");
        Ok(node)
    }

    /// Record the attachment of a pushed platform update.
    ///
    /// Updates without an attachment are acknowledged with `None`.
    pub async fn ingest_update(
        &self,
        update: Update,
        parent_id: Option<NodeId>,
    ) -> IngestResult<Option<Node>> {
        let update_id = update.update_id;
        let Some(message) = update.into_message() else {
            debug!(update_id, "update carries no message");
            return Ok(None);
        };
        let Some(file) = normalize_message(&message) else {
            debug!(update_id, message_id = message.message_id, "message carries no attachment");
            return Ok(None);
        };

        let new_node = NewNode::file(file.name, parent_id, file.blob_ref.clone(), file.size)
            .with_mime_type(file.mime_type)
            .with_caption(file.caption);
        self.tree.check_new(&new_node).await?;

        let node = self.record(new_node, file.blob_ref).await?;
        info!(id = node.id, name = %node.name, update_id, "ingested pushed file");
        Ok(Some(node))
    }

    /// Insert the node for a blob that already exists remotely.
    async fn record(&self, new_node: NewNode, blob_ref: String) -> IngestResult<Node> {
        match self.tree.create(new_node).await {
            Ok(node) => Ok(node),
            Err(source) => {
                error!(%blob_ref, error = %source, "blob stored but node not recorded; blob is orphaned");
                Err(IngestError::IngestFailed { blob_ref, source })
            }
        }
    }
}
