//! HTTP handlers for the folder tree.
//! Thin wrappers: parse the request, call `TreeService`, render JSON.

use crate::{
    errors::AppError,
    handlers::{AppState, deserialize_optional_id, parse_optional_id},
    models::node::{ListScope, NewNode, Node, NodeId},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

/// Query params accepted by `GET /files`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Folder to list; absent or empty lists root level.
    pub parent_id: Option<String>,
    /// Return every node regardless of parent.
    #[serde(default)]
    pub all: bool,
}

/// Request body for `POST /folders`.
#[derive(Debug, Deserialize)]
pub struct CreateFolderReq {
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub parent_id: Option<NodeId>,
}

/// Request body for `PUT /files/{id}/move`.
#[derive(Debug, Deserialize)]
pub struct MoveReq {
    #[serde(
        rename = "newParentId",
        alias = "new_parent_id",
        default,
        deserialize_with = "deserialize_optional_id"
    )]
    pub new_parent_id: Option<NodeId>,
}

/// Request body for `PUT /files/{id}/rename`.
#[derive(Debug, Deserialize)]
pub struct RenameReq {
    #[serde(rename = "newName", alias = "new_name")]
    pub new_name: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub deleted: u64,
}

#[derive(Debug, Serialize)]
pub struct SizeResponse {
    pub id: NodeId,
    pub size: i64,
}

/// GET `/files` — list one folder level, or everything with `?all=true`.
pub async fn list_nodes(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<Node>>, AppError> {
    let scope = if q.all {
        ListScope::All
    } else {
        ListScope::Children(parse_optional_id(q.parent_id.as_deref())?)
    };
    Ok(Json(state.tree.list(scope).await?))
}

/// GET `/files/{id}`
pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<Node>, AppError> {
    Ok(Json(state.tree.get(id).await?))
}

/// GET `/files/{id}/path` — breadcrumb from root level down to the node.
pub async fn node_path(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<Vec<Node>>, AppError> {
    Ok(Json(state.tree.path(id).await?))
}

/// POST `/folders`
pub async fn create_folder(
    State(state): State<AppState>,
    Json(req): Json<CreateFolderReq>,
) -> Result<impl IntoResponse, AppError> {
    let folder = state
        .tree
        .create(NewNode::folder(req.name, req.parent_id))
        .await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

/// PUT `/files/{id}/move` — `{ "newParentId": id | null }`
pub async fn move_node(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
    Json(req): Json<MoveReq>,
) -> Result<Json<Node>, AppError> {
    Ok(Json(state.tree.move_node(id, req.new_parent_id).await?))
}

/// PUT `/files/{id}/rename` — `{ "newName": "..." }`
pub async fn rename_node(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
    Json(req): Json<RenameReq>,
) -> Result<Json<Node>, AppError> {
    Ok(Json(state.tree.rename(id, &req.new_name).await?))
}

/// DELETE `/files/{id}` — removes the node and everything beneath it.
pub async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted = state.tree.delete(id).await?;
    tracing::info!(id, deleted, "deleted subtree");
    Ok(Json(DeleteResponse {
        success: true,
        deleted,
    }))
}

/// GET `/folders/{id}/size`
pub async fn folder_size(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<SizeResponse>, AppError> {
    let size = state.tree.subtree_size(id).await?;
    Ok(Json(SizeResponse { id, size }))
}
