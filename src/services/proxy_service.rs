//! src/services/proxy_service.rs
//!
//! ProxyService: serves file content out of the remote blob store.
//!
//! For ordinary files the upstream body is streamed through untouched, with
//! byte-range requests forwarded so players can seek. HLS playlists are the
//! one exception: they are read whole and every segment line naming a sibling
//! file is rewritten to a proxy URL, so relative references keep working even
//! though the segments live behind opaque blob references.

use crate::{
    models::node::{Node, NodeId},
    services::{
        blob_client::{BlobError, ByteRange, ByteStream, RemoteBlobStore},
        tree_service::{TreeError, TreeService},
    },
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// Playlists larger than this are refused rather than buffered.
pub const MAX_PLAYLIST_BYTES: usize = 4 * 1024 * 1024;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const PLAYLIST_MIME_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "audio/mpegurl",
    "audio/x-mpegurl",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("node `{0}` has no content to serve")]
    NoContent(NodeId),
    #[error("upstream unavailable: {0}")]
    Upstream(#[from] BlobError),
    #[error("requested range not satisfiable for {size} byte object")]
    RangeNotSatisfiable { size: u64 },
    #[error("playlist exceeds {limit} bytes")]
    PlaylistTooLarge { limit: usize },
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// What a client asked for with its `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No header, or one we could not parse: serve the whole body.
    Full,
    /// `bytes=start-` or `bytes=start-end`.
    From { start: u64, end: Option<u64> },
}

/// Parse a `Range` header of the form `bytes=start-` or `bytes=start-end`.
///
/// Suffix ranges (`bytes=-500`), multiple ranges and garbage all fall back to
/// a full response.
pub fn parse_range(header: Option<&str>) -> RangeRequest {
    let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return RangeRequest::Full;
    };
    if ranges.contains(',') {
        return RangeRequest::Full;
    }
    let Some((start, end)) = ranges.trim().split_once('-') else {
        return RangeRequest::Full;
    };
    let Ok(start) = start.trim().parse::<u64>() else {
        return RangeRequest::Full;
    };
    let end = match end.trim() {
        "" => None,
        end => match end.parse::<u64>() {
            Ok(end) => Some(end),
            Err(_) => return RangeRequest::Full,
        },
    };
    RangeRequest::From { start, end }
}

/// Clamp a requested range against an object of `size` bytes.
pub fn resolve_range(start: u64, end: Option<u64>, size: u64) -> ProxyResult<ByteRange> {
    if start >= size {
        return Err(ProxyError::RangeNotSatisfiable { size });
    }
    let last = size - 1;
    let end = end.map_or(last, |end| end.min(last));
    if end < start {
        return Err(ProxyError::RangeNotSatisfiable { size });
    }
    Ok(ByteRange::new(start, end))
}

/// Content type served for a node, by extension first and stored type second.
pub fn content_type_for(node: &Node) -> String {
    let by_extension = node.extension().and_then(|ext| {
        let known = match ext.as_str() {
            "m3u8" => PLAYLIST_CONTENT_TYPE,
            "ts" => "video/mp2t",
            "m4s" => "video/iso.segment",
            "mp4" => "video/mp4",
            "webm" => "video/webm",
            "mkv" => "video/x-matroska",
            "vtt" => "text/vtt",
            "srt" => "application/x-subrip",
            "ass" => "text/plain",
            "mp3" => "audio/mpeg",
            "m4a" => "audio/mp4",
            "aac" => "audio/aac",
            "flac" => "audio/flac",
            "ogg" => "audio/ogg",
            "wav" => "audio/wav",
            _ => return None,
        };
        Some(known)
    });

    by_extension
        .map(str::to_string)
        .or_else(|| node.mime_type.clone().filter(|m| !m.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

/// Whether a node is an HLS playlist that needs rewriting.
pub fn is_playlist(node: &Node) -> bool {
    if node.extension().as_deref() == Some("m3u8") {
        return true;
    }
    node.mime_type.as_deref().is_some_and(|mime| {
        PLAYLIST_MIME_TYPES
            .iter()
            .any(|known| mime.eq_ignore_ascii_case(known))
    })
}

/// Rewrite playlist lines that name a sibling file into proxy URLs.
///
/// Lines are compared after trimming; directives and unknown names pass
/// through untouched. When several siblings share a name the first one in
/// `siblings` wins. Line terminators are preserved as they were.
pub fn rewrite_playlist(text: &str, siblings: &[Node], proxy_base: &str) -> String {
    let mut by_name: HashMap<&str, NodeId> = HashMap::with_capacity(siblings.len());
    for sibling in siblings.iter().filter(|s| !s.is_folder) {
        by_name.entry(sibling.name.as_str()).or_insert(sibling.id);
    }

    let mut out = String::with_capacity(text.len());
    for piece in text.split_inclusive('\n') {
        let body_len = piece.trim_end_matches(['\r', '\n']).len();
        let (line, terminator) = piece.split_at(body_len);
        let key = line.trim();

        match by_name.get(key) {
            Some(id) if !key.starts_with('#') => {
                out.push_str(&proxy_path(proxy_base, *id));
            }
            _ => out.push_str(line),
        }
        out.push_str(terminator);
    }
    out
}

/// Proxy URL path of a node.
pub fn proxy_path(proxy_base: &str, id: NodeId) -> String {
    format!("/{}/{}", proxy_base.trim_matches('/'), id)
}

/// `Content-Disposition` value carrying a UTF-8 file name.
pub fn content_disposition(inline: bool, file_name: &str) -> String {
    let disposition = if inline { "inline" } else { "attachment" };
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{disposition}; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(file_name)
    )
}

/// Minimal HTML page embedding a player for a node.
pub fn player_page(node: &Node, proxy_base: &str) -> String {
    let title = html_escape(&node.name);
    let src = proxy_path(proxy_base, node.id);
    let mime = html_escape(&content_type_for(node));
    format!(
        concat!(
            "<!DOCTYPE html>\n",
            "<html><head><meta charset=\"utf-8\">",
            "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">",
            "<title>{title}</title>",
            "<style>body{{margin:0;background:#000}}video{{width:100vw;height:100vh}}</style>",
            "</head><body>",
            "<video controls autoplay playsinline><source src=\"{src}\" type=\"{mime}\"></video>",
            "</body></html>\n"
        ),
        title = title,
        src = src,
        mime = mime,
    )
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Drop the first `skip` bytes of a stream and stop after `take` more.
///
/// Used when the upstream ignored a range request and sent the whole body.
/// The upstream stream is dropped as soon as `take` bytes were produced.
pub fn slice_stream(stream: ByteStream, skip: u64, take: u64) -> ByteStream {
    Box::pin(futures::stream::unfold(
        (stream, skip, take),
        |(mut stream, mut skip, mut take)| async move {
            while take > 0 {
                match stream.next().await? {
                    Err(err) => return Some((Err(err), (stream, skip, 0))),
                    Ok(mut chunk) => {
                        let len = chunk.len() as u64;
                        if skip >= len {
                            skip -= len;
                            continue;
                        }
                        if skip > 0 {
                            chunk = chunk.slice(skip as usize..);
                            skip = 0;
                        }
                        if chunk.len() as u64 > take {
                            chunk.truncate(take as usize);
                        }
                        take -= chunk.len() as u64;
                        return Some((Ok(chunk), (stream, skip, take)));
                    }
                }
            }
            None
        },
    ))
}

/// Body of a proxied response.
pub enum ProxyBody {
    /// Rewritten playlist, fully materialised.
    Playlist(Bytes),
    /// Upstream bytes, streamed.
    Stream(ByteStream),
}

/// Everything the HTTP layer needs to answer a proxy request.
pub struct ProxyContent {
    pub node: Node,
    pub content_type: String,
    pub body: ProxyBody,
    /// Range actually served, when the response is partial.
    pub range: Option<ByteRange>,
    pub content_length: Option<u64>,
    /// Known total size of the object.
    pub total_size: u64,
}

impl ProxyContent {
    pub fn is_playlist(&self) -> bool {
        matches!(self.body, ProxyBody::Playlist(_))
    }
}

/// ProxyService resolves nodes to upstream bytes.
#[derive(Clone)]
pub struct ProxyService {
    tree: TreeService,
    blobs: Arc<dyn RemoteBlobStore>,
    upstream_timeout: Duration,
    proxy_base: String,
}

impl ProxyService {
    pub fn new(
        tree: TreeService,
        blobs: Arc<dyn RemoteBlobStore>,
        upstream_timeout: Duration,
        proxy_base: impl Into<String>,
    ) -> Self {
        Self {
            tree,
            blobs,
            upstream_timeout,
            proxy_base: proxy_base.into(),
        }
    }

    pub fn proxy_base(&self) -> &str {
        &self.proxy_base
    }

    /// Run an upstream call under the request-scoped timeout.
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, BlobError>>,
    ) -> ProxyResult<T> {
        match tokio::time::timeout(self.upstream_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BlobError::Timeout(self.upstream_timeout).into()),
        }
    }

    /// Look up a node that has content behind it.
    pub async fn content_node(&self, id: NodeId) -> ProxyResult<Node> {
        let node = self.tree.get(id).await?;
        if node.is_folder || node.blob_ref.is_none() {
            return Err(ProxyError::NoContent(id));
        }
        Ok(node)
    }

    /// Open the content of node `id`, honouring `range_header` for
    /// non-playlist files.
    pub async fn open(&self, id: NodeId, range_header: Option<&str>) -> ProxyResult<ProxyContent> {
        let node = self.content_node(id).await?;
        let blob_ref = node.blob_ref.clone().unwrap_or_default();

        if is_playlist(&node) {
            return self.open_playlist(node, &blob_ref).await;
        }

        let total_size = node.size.max(0) as u64;
        // Files ingested without a known size are always served whole.
        let range = match parse_range(range_header) {
            RangeRequest::From { start, end } if total_size > 0 => {
                Some(resolve_range(start, end, total_size)?)
            }
            _ => None,
        };

        let url = self.bounded(self.blobs.resolve_url(&blob_ref)).await?;
        let upstream = self.bounded(self.blobs.fetch(&url, range)).await?;
        debug!(
            node_id = id,
            ?range,
            upstream_partial = upstream.partial,
            "opened upstream body"
        );

        let (stream, content_length) = match range {
            Some(range) if upstream.partial => (upstream.stream, Some(range.len())),
            Some(range) => {
                warn!(node_id = id, "upstream ignored range request, slicing locally");
                (
                    slice_stream(upstream.stream, range.start, range.len()),
                    Some(range.len()),
                )
            }
            None => (
                upstream.stream,
                upstream
                    .content_length
                    .or((total_size > 0).then_some(total_size)),
            ),
        };

        Ok(ProxyContent {
            content_type: content_type_for(&node),
            node,
            body: ProxyBody::Stream(stream),
            range,
            content_length,
            total_size,
        })
    }

    async fn open_playlist(&self, node: Node, blob_ref: &str) -> ProxyResult<ProxyContent> {
        let url = self.bounded(self.blobs.resolve_url(blob_ref)).await?;
        let upstream = self.bounded(self.blobs.fetch(&url, None)).await?;
        let raw = self.bounded(read_capped(upstream.stream)).await??;

        let siblings = self.tree.sibling_files(&node).await?;
        let text = String::from_utf8_lossy(&raw);
        let rewritten = rewrite_playlist(&text, &siblings, &self.proxy_base);
        debug!(
            node_id = node.id,
            siblings = siblings.len(),
            "rewrote playlist"
        );

        let body = Bytes::from(rewritten);
        Ok(ProxyContent {
            content_type: PLAYLIST_CONTENT_TYPE.to_string(),
            total_size: body.len() as u64,
            content_length: Some(body.len() as u64),
            range: None,
            body: ProxyBody::Playlist(body),
            node,
        })
    }
}

/// Collect a playlist body, refusing anything over `MAX_PLAYLIST_BYTES`.
async fn read_capped(mut stream: ByteStream) -> Result<ProxyResult<Bytes>, BlobError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| BlobError::Api(format!("reading playlist: {e}")))?;
        if buf.len() + chunk.len() > MAX_PLAYLIST_BYTES {
            return Ok(Err(ProxyError::PlaylistTooLarge {
                limit: MAX_PLAYLIST_BYTES,
            }));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Ok(buf.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        models::node::NewNode,
        services::blob_client::MemoryBlobStore,
    };
    use chrono::Utc;
    use futures::{TryStreamExt, stream};
    use std::io;

    fn node(id: NodeId, name: &str, mime: Option<&str>) -> Node {
        Node {
            id,
            name: name.into(),
            is_folder: false,
            parent_id: None,
            size: 0,
            blob_ref: Some(format!("ref-{id}")),
            mime_type: mime.map(str::to_string),
            etag: None,
            caption: None,
            created_at: Utc::now(),
        }
    }

    async fn collect(stream: ByteStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[test]
    fn parses_open_and_closed_ranges() {
        assert_eq!(
            parse_range(Some("bytes=0-99")),
            RangeRequest::From {
                start: 0,
                end: Some(99)
            }
        );
        assert_eq!(
            parse_range(Some("bytes=500-")),
            RangeRequest::From {
                start: 500,
                end: None
            }
        );
    }

    #[test]
    fn malformed_ranges_fall_back_to_full() {
        for header in [
            "bytes=-500",
            "bytes=a-b",
            "items=0-1",
            "bytes=0-1,4-5",
            "bytes=",
            "bytes=5-x",
        ] {
            assert_eq!(parse_range(Some(header)), RangeRequest::Full, "{header}");
        }
        assert_eq!(parse_range(None), RangeRequest::Full);
    }

    #[test]
    fn resolves_ranges_against_object_size() {
        assert_eq!(resolve_range(0, Some(99), 1000).unwrap(), ByteRange::new(0, 99));
        assert_eq!(resolve_range(500, None, 1000).unwrap(), ByteRange::new(500, 999));
        assert_eq!(resolve_range(900, Some(5000), 1000).unwrap(), ByteRange::new(900, 999));
        assert!(matches!(
            resolve_range(1000, None, 1000),
            Err(ProxyError::RangeNotSatisfiable { size: 1000 })
        ));
        assert!(matches!(
            resolve_range(10, Some(5), 1000),
            Err(ProxyError::RangeNotSatisfiable { .. })
        ));
    }

    #[test]
    fn content_type_prefers_extension_table() {
        assert_eq!(content_type_for(&node(1, "seg0.TS", None)), "video/mp2t");
        assert_eq!(content_type_for(&node(1, "subs.srt", Some("text/plain"))), "application/x-subrip");
        assert_eq!(content_type_for(&node(1, "photo.jpg", Some("image/jpeg"))), "image/jpeg");
        assert_eq!(content_type_for(&node(1, "blob", None)), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn playlist_detection_uses_name_or_mime() {
        assert!(is_playlist(&node(1, "index.m3u8", None)));
        assert!(is_playlist(&node(1, "stream", Some("application/vnd.apple.mpegurl"))));
        assert!(is_playlist(&node(1, "stream", Some("application/x-mpegURL"))));
        assert!(!is_playlist(&node(1, "seg.ts", Some("video/mp2t"))));
    }

    #[test]
    fn rewrite_replaces_only_matching_lines() {
        let siblings = vec![node(7, "seg0.ts", None), node(8, "seg1.ts", None)];
        let input = "#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\nseg2.ts\n";
        let out = rewrite_playlist(input, &siblings, "proxy");
        assert_eq!(
            out,
            "#EXTM3U\n#EXTINF:4.0,\n/proxy/7\n#EXTINF:4.0,\n/proxy/8\nseg2.ts\n"
        );
    }

    #[test]
    fn rewrite_keeps_crlf_and_missing_final_newline() {
        let siblings = vec![node(3, "a.ts", None)];
        let out = rewrite_playlist("#EXTM3U\r\na.ts\r\na.ts", &siblings, "/p/");
        assert_eq!(out, "#EXTM3U\r\n/p/3\r\n/p/3");
    }

    #[test]
    fn rewrite_prefers_first_of_duplicate_names() {
        let siblings = vec![node(4, "dup.ts", None), node(9, "dup.ts", None)];
        assert_eq!(rewrite_playlist("dup.ts\n", &siblings, "proxy"), "/proxy/4\n");
    }

    #[test]
    fn disposition_encodes_utf8_names() {
        assert_eq!(
            content_disposition(true, "movie.mp4"),
            "inline; filename=\"movie.mp4\"; filename*=UTF-8''movie.mp4"
        );
        assert_eq!(
            content_disposition(false, "видео 1.mp4"),
            "attachment; filename=\"_____ 1.mp4\"; filename*=UTF-8''%D0%B2%D0%B8%D0%B4%D0%B5%D0%BE%201.mp4"
        );
    }

    #[test]
    fn player_page_escapes_title() {
        let page = player_page(&node(5, "<b>clip</b>.mp4", None), "proxy");
        assert!(page.contains("&lt;b&gt;clip&lt;/b&gt;.mp4"));
        assert!(page.contains("src=\"/proxy/5\""));
    }

    #[tokio::test]
    async fn slice_stream_spans_chunk_boundaries() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"0123")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"4567")),
            Ok(Bytes::from_static(b"89")),
        ];
        let sliced = slice_stream(stream::iter(chunks).boxed(), 3, 5);
        assert_eq!(collect(sliced).await, b"34567");
    }

    async fn service_with(store: &MemoryBlobStore) -> (TreeService, ProxyService) {
        let pool = Arc::new(db::in_memory().await.unwrap());
        let tree = TreeService::new(pool);
        let blobs: Arc<dyn RemoteBlobStore> = Arc::new(store.clone());
        let proxy = ProxyService::new(tree.clone(), blobs, Duration::from_secs(2), "proxy");
        (tree, proxy)
    }

    #[tokio::test]
    async fn open_serves_requested_range() {
        let store = MemoryBlobStore::new().with_chunk_size(4);
        let data: Vec<u8> = (0..=255u8).collect();
        let blob_ref = store.insert(data.clone()).await;
        let (tree, proxy) = service_with(&store).await;
        let file = tree
            .create(NewNode::file("clip.mp4", None, blob_ref, data.len() as i64))
            .await
            .unwrap();

        let content = proxy.open(file.id, Some("bytes=10-19")).await.unwrap();
        assert_eq!(content.range, Some(ByteRange::new(10, 19)));
        assert_eq!(content.content_length, Some(10));
        let ProxyBody::Stream(stream) = content.body else {
            panic!("expected a stream");
        };
        assert_eq!(collect(stream).await, &data[10..20]);
    }

    #[tokio::test]
    async fn open_slices_when_upstream_ignores_ranges() {
        let store = MemoryBlobStore::new().with_chunk_size(3);
        store.set_ignore_ranges(true);
        let blob_ref = store.insert(&b"abcdefghij"[..]).await;
        let (tree, proxy) = service_with(&store).await;
        let file = tree
            .create(NewNode::file("a.bin", None, blob_ref, 10))
            .await
            .unwrap();

        let content = proxy.open(file.id, Some("bytes=4-")).await.unwrap();
        assert_eq!(content.range, Some(ByteRange::new(4, 9)));
        let ProxyBody::Stream(stream) = content.body else {
            panic!("expected a stream");
        };
        assert_eq!(collect(stream).await, b"efghij");
    }

    #[tokio::test]
    async fn open_rewrites_playlists_against_siblings() {
        let store = MemoryBlobStore::new();
        let (tree, proxy) = service_with(&store).await;
        let folder = tree.create(NewNode::folder("show", None)).await.unwrap();
        let seg_ref = store.insert(&b"segment"[..]).await;
        let seg = tree
            .create(NewNode::file("seg0.ts", Some(folder.id), seg_ref, 7))
            .await
            .unwrap();
        let playlist_ref = store
            .insert(&b"#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n"[..])
            .await;
        let playlist = tree
            .create(NewNode::file("index.m3u8", Some(folder.id), playlist_ref, 40))
            .await
            .unwrap();

        let content = proxy.open(playlist.id, Some("bytes=0-3")).await.unwrap();
        assert!(content.is_playlist());
        assert_eq!(content.range, None);
        assert_eq!(content.content_type, PLAYLIST_CONTENT_TYPE);
        let ProxyBody::Playlist(body) = content.body else {
            panic!("expected a playlist");
        };
        assert_eq!(
            String::from_utf8(body.to_vec()).unwrap(),
            format!("#EXTM3U\n#EXTINF:4.0,\n/proxy/{}\n#EXT-X-ENDLIST\n", seg.id)
        );
    }

    #[tokio::test]
    async fn open_rejects_folders_and_unknown_ids() {
        let store = MemoryBlobStore::new();
        let (tree, proxy) = service_with(&store).await;
        let folder = tree.create(NewNode::folder("f", None)).await.unwrap();

        assert!(matches!(
            proxy.open(folder.id, None).await,
            Err(ProxyError::NoContent(_))
        ));
        assert!(matches!(
            proxy.open(404, None).await,
            Err(ProxyError::Tree(TreeError::NotFound(404)))
        ));
    }

    #[tokio::test]
    async fn open_maps_outages_to_upstream_errors() {
        let store = MemoryBlobStore::new();
        let blob_ref = store.insert(&b"x"[..]).await;
        let (tree, proxy) = service_with(&store).await;
        let file = tree.create(NewNode::file("x.bin", None, blob_ref, 1)).await.unwrap();

        store.set_offline(true);
        assert!(matches!(
            proxy.open(file.id, None).await,
            Err(ProxyError::Upstream(BlobError::Offline))
        ));
    }
}
