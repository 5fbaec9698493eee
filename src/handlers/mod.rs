//! HTTP handlers and the state they share.

pub mod health_handlers;
pub mod ingest_handlers;
pub mod node_handlers;
pub mod proxy_handlers;

use crate::{
    config::GatewaySettings,
    errors::AppError,
    models::node::NodeId,
    services::{
        blob_client::RemoteBlobStore, ingest_service::IngestService,
        proxy_service::ProxyService, tree_service::TreeService,
    },
};
use serde::{Deserialize, Deserializer};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub tree: TreeService,
    pub proxy: ProxyService,
    pub ingest: IngestService,
    pub blobs: Arc<dyn RemoteBlobStore>,
    pub settings: GatewaySettings,
}

impl AppState {
    pub fn new(
        db: Arc<SqlitePool>,
        blobs: Arc<dyn RemoteBlobStore>,
        settings: GatewaySettings,
    ) -> Self {
        let tree = TreeService::new(db);
        let proxy = ProxyService::new(
            tree.clone(),
            blobs.clone(),
            settings.upstream_timeout,
            settings.proxy_base.clone(),
        );
        let ingest = IngestService::new(tree.clone(), blobs.clone(), settings.max_upload_bytes);
        Self {
            tree,
            proxy,
            ingest,
            blobs,
            settings,
        }
    }
}

/// Parse a node id supplied as text. Empty means root level.
pub fn parse_optional_id(raw: Option<&str>) -> Result<Option<NodeId>, AppError> {
    match raw.map(str::trim) {
        None | Some("") | Some("null") => Ok(None),
        Some(value) => value
            .parse::<NodeId>()
            .map(Some)
            .map_err(|_| AppError::bad_request(format!("invalid node id `{value}`"))),
    }
}

/// Accept a node id as a JSON number, a numeric string, an empty string or null.
pub fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<NodeId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(NodeId),
        Text(String),
    }

    match Option::<RawId>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawId::Number(id)) => Ok(Some(id)),
        Some(RawId::Text(text)) => {
            parse_optional_id(Some(&text)).map_err(|e| serde::de::Error::custom(e.message))
        }
    }
}
