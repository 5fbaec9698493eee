//! Defines routes for the folder tree, the streaming proxy and ingestion.
//!
//! ## Structure
//! - **Tree endpoints**
//!   - `GET    /files`             — list a folder level (`?parent_id=`) or everything (`?all=true`)
//!   - `GET    /files/{id}`        — fetch one node
//!   - `DELETE /files/{id}`        — delete a node and its subtree
//!   - `GET    /files/{id}/path`   — breadcrumb from root level to the node
//!   - `PUT    /files/{id}/move`   — re-parent (`{"newParentId": ...}`)
//!   - `PUT    /files/{id}/rename` — rename (`{"newName": ...}`)
//!   - `POST   /folders`           — create a folder
//!   - `GET    /folders/{id}/size` — aggregate size of a subtree
//!
//! - **Content endpoints**
//!   - `GET    /{proxy_base}/{id}` — stream content, with range and playlist support
//!   - `POST   /upload`            — multipart upload
//!   - `POST   /webhook`           — platform push updates

use crate::{
    config::GatewaySettings,
    handlers::{
        AppState,
        health_handlers::{healthz, readyz},
        ingest_handlers::{receive_update, upload_file},
        node_handlers::{
            create_folder, delete_node, folder_size, get_node, list_nodes, move_node, node_path,
            rename_node,
        },
        proxy_handlers::proxy_file,
    },
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Room for multipart boundaries and the non-file fields.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Build and return the router for all endpoints.
///
/// The proxy is mounted under the configured base segment, and the upload
/// route gets a body limit sized to the upload ceiling.
pub fn routes(settings: &GatewaySettings) -> Router<AppState> {
    let upload_limit = usize::try_from(settings.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);
    let proxy_route = format!("/{}/{{id}}", settings.proxy_base.trim_matches('/'));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Tree routes
        .route("/files", get(list_nodes))
        .route("/files/{id}", get(get_node).delete(delete_node))
        .route("/files/{id}/path", get(node_path))
        .route("/files/{id}/move", put(move_node))
        .route("/files/{id}/rename", put(rename_node))
        .route("/folders", post(create_folder))
        .route("/folders/{id}/size", get(folder_size))
        // Content routes
        .route(&proxy_route, get(proxy_file))
        .route(
            "/upload",
            post(upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/webhook", post(receive_update))
}

/// Router with state attached, ready to serve.
pub fn app(state: AppState) -> Router {
    let settings = state.settings.clone();
    routes(&settings).with_state(state)
}
