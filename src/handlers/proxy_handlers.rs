//! HTTP handler for the streaming proxy.
//! Streams upstream bodies to avoid buffering in memory; only playlists are
//! materialised so their segment lines can be rewritten.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::node::{Node, NodeId},
    services::proxy_service::{
        ProxyBody, ProxyContent, ProxyError, content_disposition, content_type_for, is_playlist,
        player_page, proxy_path,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

/// Query params accepted by `GET /{proxy_base}/{id}`.
#[derive(Debug, Default, Deserialize)]
pub struct ProxyQuery {
    /// File name advertised in `Content-Disposition`.
    pub original_name: Option<String>,
    /// `inline` or `attachment` (default).
    pub disposition: Option<String>,
    /// Any non-empty value other than `0`/`false` serves a player page.
    pub player: Option<String>,
    /// `true` returns the node metadata instead of content.
    pub info: Option<String>,
}

fn flag(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some(v) if !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
}

/// Metadata returned for `?info=true`.
#[derive(Debug, Serialize)]
pub struct ProxyInfo {
    #[serde(flatten)]
    pub node: Node,
    pub content_type: String,
    pub is_playlist: bool,
    pub url: String,
}

/// GET `/{proxy_base}/{id}` — stream a file's content.
pub async fn proxy_file(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
    Query(q): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if flag(q.info.as_deref()) {
        let node = state.proxy.content_node(id).await?;
        let info = ProxyInfo {
            content_type: content_type_for(&node),
            is_playlist: is_playlist(&node),
            url: proxy_path(state.proxy.proxy_base(), node.id),
            node,
        };
        return Ok(Json(info).into_response());
    }

    if flag(q.player.as_deref()) {
        let node = state.proxy.content_node(id).await?;
        return Ok(Html(player_page(&node, state.proxy.proxy_base())).into_response());
    }

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let content = match state.proxy.open(id, range_header).await {
        Ok(content) => content,
        Err(ProxyError::RangeNotSatisfiable { size }) => {
            return Ok(range_not_satisfiable(size));
        }
        Err(err) => return Err(err.into()),
    };

    let inline = q
        .disposition
        .as_deref()
        .is_some_and(|d| d.trim().eq_ignore_ascii_case("inline"));
    let file_name = q
        .original_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| content.node.name.clone());

    Ok(build_response(content, inline, &file_name))
}

fn build_response(content: ProxyContent, inline: bool, file_name: &str) -> Response {
    let status = if content.range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let playlist = content.is_playlist();

    let mut response = match content.body {
        ProxyBody::Playlist(bytes) => Response::new(Body::from(bytes)),
        ProxyBody::Stream(stream) => {
            let node_id = content.node.id;
            let stream = stream.inspect_err(move |err| {
                // Headers are already out; the client sees a truncated body.
                tracing::error!(node_id, error = %err, "upstream stream failed mid-transfer");
            });
            Response::new(Body::from_stream(stream))
        }
    };
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(length) = content.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if let Some(range) = content.range {
        let value = format!("bytes {}-{}/{}", range.start, range.end, content.total_size);
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
    if !playlist {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    if let Ok(value) = HeaderValue::from_str(&content_disposition(inline, file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(etag) = content.node.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(if playlist {
            "no-cache"
        } else {
            "public, max-age=31536000"
        }),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );

    response
}

fn range_not_satisfiable(size: u64) -> Response {
    let mut response = AppError::from(ProxyError::RangeNotSatisfiable { size }).into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_truthy_values() {
        assert!(flag(Some("true")));
        assert!(flag(Some("1")));
        assert!(!flag(Some("0")));
        assert!(!flag(Some("False")));
        assert!(!flag(Some("")));
        assert!(!flag(None));
    }
}
