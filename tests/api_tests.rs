use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use bytes::Bytes;
use futures::stream;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use chat_drive::config::{BlobStoreConfig, GatewaySettings};
use chat_drive::db;
use chat_drive::handlers::AppState;
use chat_drive::models::node::{NewNode, Node};
use chat_drive::routes::routes::app;
use chat_drive::services::blob_client::{
    BlobBody, BlobError, BlobResult, BlobUpload, ByteRange, MemoryBlobStore, RemoteBlobStore,
    StoredBlob, TelegramBlobStore,
};
use chat_drive::services::proxy_service::MAX_PLAYLIST_BYTES;

// -- Helpers --------------------------------------------------------------

struct TestApp {
    router: Router,
    state: AppState,
    store: MemoryBlobStore,
}

async fn test_app() -> TestApp {
    test_app_with(GatewaySettings::default()).await
}

async fn test_app_with(settings: GatewaySettings) -> TestApp {
    let pool = Arc::new(db::in_memory().await.expect("in-memory db"));
    let store = MemoryBlobStore::new().with_chunk_size(16);
    let blobs: Arc<dyn RemoteBlobStore> = Arc::new(store.clone());
    let state = AppState::new(pool, blobs, settings);
    TestApp {
        router: app(state.clone()),
        state,
        store,
    }
}

impl TestApp {
    async fn send(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn json(&self, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _, bytes) = self.send(req).await;
        (status, parse(&bytes))
    }

    /// Put `data` in the blob store and record a file node for it.
    async fn seed_file(&self, name: &str, parent_id: Option<i64>, data: &[u8]) -> Node {
        let blob_ref = self.store.insert(data.to_vec()).await;
        self.state
            .tree
            .create(NewNode::file(name, parent_id, blob_ref, data.len() as i64))
            .await
            .unwrap()
    }
}

/// Router and state over an arbitrary blob store.
async fn app_over(blobs: Arc<dyn RemoteBlobStore>, settings: GatewaySettings) -> (Router, AppState) {
    let pool = Arc::new(db::in_memory().await.expect("in-memory db"));
    let state = AppState::new(pool, blobs, settings);
    (app(state.clone()), state)
}

/// Upstream that never answers URL lookups.
struct StalledStore;

#[async_trait]
impl RemoteBlobStore for StalledStore {
    async fn resolve_url(&self, _blob_ref: &str) -> BlobResult<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("http://never.invalid/".into())
    }

    async fn fetch(&self, _url: &str, _range: Option<ByteRange>) -> BlobResult<BlobBody> {
        Err(BlobError::Offline)
    }

    async fn upload(&self, _upload: BlobUpload) -> BlobResult<StoredBlob> {
        Err(BlobError::Offline)
    }

    async fn ping(&self) -> BlobResult<()> {
        Ok(())
    }
}

/// Upstream whose body breaks after the first chunk.
#[derive(Default)]
struct BrokenStreamStore {
    fetches: AtomicUsize,
}

#[async_trait]
impl RemoteBlobStore for BrokenStreamStore {
    async fn resolve_url(&self, blob_ref: &str) -> BlobResult<String> {
        Ok(format!("memory://{blob_ref}"))
    }

    async fn fetch(&self, _url: &str, _range: Option<ByteRange>) -> BlobResult<BlobBody> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let chunks = vec![
            Ok(Bytes::from_static(b"first chunk")),
            Err(io::Error::other("connection reset by peer")),
        ];
        Ok(BlobBody {
            stream: Box::pin(stream::iter(chunks)),
            content_length: Some(32),
            partial: false,
        })
    }

    async fn upload(&self, _upload: BlobUpload) -> BlobResult<StoredBlob> {
        Err(BlobError::Offline)
    }

    async fn ping(&self) -> BlobResult<()> {
        Ok(())
    }
}

fn parse(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes).unwrap()
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> &'a str {
    headers.get(name).unwrap().to_str().unwrap()
}

const BOUNDARY: &str = "chat-drive-test-boundary";

fn multipart_request(file_name: &str, data: &[u8], extra: &[(&str, &str)]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, value) in extra {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::post("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

// -- Tree -----------------------------------------------------------------

#[tokio::test]
async fn folder_tree_lifecycle() {
    let t = test_app().await;

    let (status, a) = t.json("POST", "/folders", json!({"name": "A"})).await;
    assert_eq!(status, StatusCode::CREATED);
    let a_id = a["id"].as_i64().unwrap();
    assert_eq!(a["is_folder"], true);

    let (status, b) = t
        .json("POST", "/folders", json!({"name": "B", "parent_id": a_id.to_string()}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let b_id = b["id"].as_i64().unwrap();

    let f = t.seed_file("f.bin", Some(b_id), &[0u8; 100]).await;

    let (status, _, body) = t.get(&format!("/folders/{a_id}/size")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["size"], 100);

    let (_, _, body) = t.get("/files").await;
    let root = parse(&body);
    assert_eq!(root.as_array().unwrap().len(), 1);
    assert_eq!(root[0]["name"], "A");

    let (_, _, body) = t.get(&format!("/files?parent_id={a_id}")).await;
    assert_eq!(parse(&body)[0]["id"], b_id);

    let (_, _, body) = t.get("/files?all=true").await;
    assert_eq!(parse(&body).as_array().unwrap().len(), 3);

    let (_, _, body) = t.get(&format!("/files/{}/path", f.id)).await;
    let names: Vec<_> = parse(&body)
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["A", "B", "f.bin"]);

    let (status, err) = t
        .json("PUT", &format!("/files/{a_id}/move"), json!({"newParentId": b_id}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["reason"], "invalid_move");

    let (status, moved) = t
        .json("PUT", &format!("/files/{b_id}/move"), json!({"newParentId": null}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved["parent_id"], Value::Null);

    let (status, renamed) = t
        .json("PUT", &format!("/files/{}/rename", f.id), json!({"newName": "g.bin"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["name"], "g.bin");
    assert_eq!(renamed["parent_id"], b_id);

    let req = Request::delete(format!("/files/{b_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = t.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body), json!({"success": true, "deleted": 2}));

    let (status, _, body) = t.get(&format!("/files/{}", f.id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse(&body)["reason"], "not_found");

    let (status, _, _) = t.get(&format!("/files/{a_id}")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn invalid_tree_requests_are_rejected() {
    let t = test_app().await;
    let file = t.seed_file("x.txt", None, b"x").await;

    let (status, err) = t.json("POST", "/folders", json!({"name": "   "})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["reason"], "invalid_name");

    let (status, err) = t
        .json("POST", "/folders", json!({"name": "sub", "parent_id": file.id}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["reason"], "invalid_parent");

    let (status, err) = t
        .json("PUT", "/files/999/rename", json!({"newName": "y"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["status"], 404);

    let (status, _, _) = t.get("/files?parent_id=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// -- Proxy ----------------------------------------------------------------

#[tokio::test]
async fn range_request_returns_exact_slice() {
    let t = test_app().await;
    let data: Vec<u8> = (0..=255u8).collect();
    let file = t.seed_file("clip.mp4", None, &data).await;

    let req = Request::get(format!("/proxy/{}", file.id))
        .header(header::RANGE, "bytes=10-19")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = t.send(req).await;

    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&headers, header::CONTENT_RANGE), "bytes 10-19/256");
    assert_eq!(header_str(&headers, header::CONTENT_LENGTH), "10");
    assert_eq!(header_str(&headers, header::ACCEPT_RANGES), "bytes");
    assert_eq!(header_str(&headers, header::CONTENT_TYPE), "video/mp4");
    assert_eq!(&body[..], &data[10..20]);
}

#[tokio::test]
async fn open_ended_range_is_served_from_a_non_range_upstream() {
    let t = test_app().await;
    t.store.set_ignore_ranges(true);
    let data: Vec<u8> = (0..100u8).collect();
    let file = t.seed_file("a.bin", None, &data).await;

    let req = Request::get(format!("/proxy/{}", file.id))
        .header(header::RANGE, "bytes=90-")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = t.send(req).await;

    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&headers, header::CONTENT_RANGE), "bytes 90-99/100");
    assert_eq!(&body[..], &data[90..]);
}

#[tokio::test]
async fn full_and_malformed_range_requests_return_whole_body() {
    let t = test_app().await;
    let file = t.seed_file("notes.txt", None, b"hello proxy").await;

    let (status, headers, body) = t.get(&format!("/proxy/{}", file.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"hello proxy");
    assert_eq!(header_str(&headers, header::CONTENT_LENGTH), "11");
    assert_eq!(header_str(&headers, header::ACCESS_CONTROL_ALLOW_ORIGIN), "*");
    assert!(headers.get(header::CONTENT_RANGE).is_none());
    assert_eq!(
        header_str(&headers, header::CONTENT_DISPOSITION),
        "attachment; filename=\"notes.txt\"; filename*=UTF-8''notes.txt"
    );
    assert_eq!(
        header_str(&headers, header::CACHE_CONTROL),
        "public, max-age=31536000"
    );

    let req = Request::get(format!("/proxy/{}", file.id))
        .header(header::RANGE, "bytes=-5")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = t.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"hello proxy");
}

#[tokio::test]
async fn unsatisfiable_range_is_416() {
    let t = test_app().await;
    let file = t.seed_file("a.bin", None, &[1u8; 256]).await;

    let req = Request::get(format!("/proxy/{}", file.id))
        .header(header::RANGE, "bytes=300-400")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = t.send(req).await;

    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(header_str(&headers, header::CONTENT_RANGE), "bytes */256");
    assert_eq!(parse(&body)["reason"], "range_not_satisfiable");
}

#[tokio::test]
async fn playlist_segments_are_rewritten_to_proxy_urls() {
    let t = test_app().await;
    let (_, show) = t.json("POST", "/folders", json!({"name": "show"})).await;
    let show_id = show["id"].as_i64().unwrap();

    let seg0 = t.seed_file("seg0.ts", Some(show_id), b"AAAA").await;
    let seg1 = t.seed_file("seg1.ts", Some(show_id), b"BBBB").await;
    // Same name elsewhere in the tree must not be picked up.
    t.seed_file("seg2.ts", None, b"CCCC").await;
    let manifest = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n#EXTINF:4.0,\nseg2.ts\n#EXT-X-ENDLIST\n";
    let playlist = t
        .seed_file("index.m3u8", Some(show_id), manifest.as_bytes())
        .await;

    let (status, headers, body) = t.get(&format!("/proxy/{}", playlist.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        header_str(&headers, header::CONTENT_TYPE),
        "application/vnd.apple.mpegurl"
    );
    assert_eq!(header_str(&headers, header::CACHE_CONTROL), "no-cache");

    let expected = format!(
        "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\n/proxy/{}\n#EXTINF:4.0,\n/proxy/{}\n#EXTINF:4.0,\nseg2.ts\n#EXT-X-ENDLIST\n",
        seg0.id, seg1.id
    );
    assert_eq!(std::str::from_utf8(&body).unwrap(), expected);

    // The rewritten URLs resolve.
    let (status, _, body) = t.get(&format!("/proxy/{}", seg1.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"BBBB");
}

#[tokio::test]
async fn proxy_errors_map_to_404_and_502() {
    let t = test_app().await;
    let (status, _, body) = t.get("/proxy/4242").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse(&body)["reason"], "not_found");

    let (_, folder) = t.json("POST", "/folders", json!({"name": "dir"})).await;
    let (status, _, _) = t.get(&format!("/proxy/{}", folder["id"])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let file = t.seed_file("a.bin", None, b"abc").await;
    t.store.set_offline(true);
    let (status, _, body) = t.get(&format!("/proxy/{}", file.id)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(parse(&body)["reason"], "upstream_unavailable");
}

#[tokio::test]
async fn stalled_upstream_times_out_as_502() {
    let settings = GatewaySettings {
        upstream_timeout: Duration::from_millis(50),
        ..GatewaySettings::default()
    };
    let (router, state) = app_over(Arc::new(StalledStore), settings).await;
    let node = state
        .tree
        .create(NewNode::file("slow.bin", None, "blob-1", 10))
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let resp = router
        .oneshot(
            Request::get(format!("/proxy/{}", node.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(parse(&body)["reason"], "upstream_unavailable");
}

#[tokio::test]
async fn mid_stream_failure_ends_the_body_without_refetching() {
    let store = Arc::new(BrokenStreamStore::default());
    let blobs: Arc<dyn RemoteBlobStore> = store.clone();
    let (router, state) = app_over(blobs, GatewaySettings::default()).await;
    let node = state
        .tree
        .create(NewNode::file("movie.mp4", None, "blob-1", 32))
        .await
        .unwrap();

    let resp = router
        .oneshot(
            Request::get(format!("/proxy/{}", node.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let mut body = resp.into_body();
    let first = body.frame().await.unwrap().unwrap();
    assert_eq!(first.into_data().unwrap(), Bytes::from_static(b"first chunk"));
    assert!(body.frame().await.unwrap().is_err());
    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upstream_failures_never_expose_the_bot_token() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let telegram = TelegramBlobStore::new(BlobStoreConfig {
        bot_token: "123456:SUPERSECRET".into(),
        chat_id: "-1001".into(),
        api_base_url: format!("http://{addr}"),
        timeout: Duration::from_secs(2),
    })
    .unwrap();
    let (router, state) = app_over(Arc::new(telegram), GatewaySettings::default()).await;
    let node = state
        .tree
        .create(NewNode::file("secret.bin", None, "file-1", 10))
        .await
        .unwrap();

    for uri in [format!("/proxy/{}", node.id), "/readyz".to_string()] {
        let resp = router
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.status().is_server_error(), "{uri}: {}", resp.status());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("SUPERSECRET"), "{uri} leaked the token: {text}");
    }
}

#[tokio::test]
async fn oversized_playlist_is_refused_with_its_own_reason() {
    let store = MemoryBlobStore::new();
    let manifest = vec![b'#'; MAX_PLAYLIST_BYTES + 1];
    let size = manifest.len() as i64;
    let blob_ref = store.insert(manifest).await;
    let (router, state) = app_over(Arc::new(store), GatewaySettings::default()).await;
    let node = state
        .tree
        .create(NewNode::file("huge.m3u8", None, blob_ref, size))
        .await
        .unwrap();

    let resp = router
        .oneshot(
            Request::get(format!("/proxy/{}", node.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(parse(&body)["reason"], "playlist_too_large");
}

#[tokio::test]
async fn proxy_honours_disposition_info_and_player() {
    let t = test_app().await;
    let file = t.seed_file("clip.webm", None, b"webm").await;

    let (_, headers, _) = t
        .get(&format!(
            "/proxy/{}?disposition=inline&original_name=My%20Clip.webm",
            file.id
        ))
        .await;
    assert_eq!(
        header_str(&headers, header::CONTENT_DISPOSITION),
        "inline; filename=\"My Clip.webm\"; filename*=UTF-8''My%20Clip.webm"
    );

    let (status, headers, body) = t.get(&format!("/proxy/{}?info=true", file.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(header_str(&headers, header::CONTENT_TYPE).starts_with("application/json"));
    let info = parse(&body);
    assert_eq!(info["id"], file.id);
    assert_eq!(info["content_type"], "video/webm");
    assert_eq!(info["is_playlist"], false);
    assert_eq!(info["url"], format!("/proxy/{}", file.id));

    let (status, headers, body) = t.get(&format!("/proxy/{}?player=1", file.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(header_str(&headers, header::CONTENT_TYPE).starts_with("text/html"));
    let page = std::str::from_utf8(&body).unwrap();
    assert!(page.contains(&format!("src=\"/proxy/{}\"", file.id)));
}

#[tokio::test]
async fn proxy_mounts_under_configured_base() {
    let t = test_app_with(GatewaySettings {
        proxy_base: "media".into(),
        ..GatewaySettings::default()
    })
    .await;
    let file = t.seed_file("a.txt", None, b"abc").await;

    let (status, _, body) = t.get(&format!("/media/{}", file.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"abc");

    let (status, _, _) = t.get(&format!("/proxy/{}", file.id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// -- Ingest ---------------------------------------------------------------

#[tokio::test]
async fn multipart_upload_creates_file_node() {
    let t = test_app().await;
    let (_, folder) = t.json("POST", "/folders", json!({"name": "docs"})).await;
    let folder_id = folder["id"].as_i64().unwrap().to_string();

    let req = multipart_request(
        "report.pdf",
        b"%PDF-1.4 fake",
        &[("parent_id", folder_id.as_str()), ("caption", "quarterly")],
    );
    let (status, _, body) = t.send(req).await;
    assert_eq!(status, StatusCode::CREATED);

    let node = parse(&body);
    assert_eq!(node["name"], "report.pdf");
    assert_eq!(node["parent_id"].as_i64().unwrap().to_string(), folder_id);
    assert_eq!(node["size"], 13);
    assert_eq!(node["mime_type"], "application/pdf");
    assert_eq!(node["caption"], "quarterly");
    assert_eq!(node["etag"].as_str().unwrap().len(), 32);
    assert_eq!(t.store.upload_count(), 1);

    let (status, _, body) = t.get(&format!("/proxy/{}", node["id"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"%PDF-1.4 fake");
}

#[tokio::test]
async fn oversized_upload_is_413_and_never_forwarded() {
    let t = test_app_with(GatewaySettings {
        max_upload_bytes: 8,
        ..GatewaySettings::default()
    })
    .await;

    let (status, _, body) = t.send(multipart_request("big.bin", &[7u8; 9], &[])).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(parse(&body)["reason"], "payload_too_large");
    assert_eq!(t.store.upload_count(), 0);

    let (_, _, body) = t.get("/files?all=true").await;
    assert_eq!(parse(&body), json!([]));
}

#[tokio::test]
async fn upload_without_file_field_is_400() {
    let t = test_app().await;
    let body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"caption\"\r\n\r\nhi\r\n--{BOUNDARY}--\r\n"
    );
    let req = Request::post("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();
    let (status, _, _) = t.send(req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(t.store.upload_count(), 0);
}

#[tokio::test]
async fn webhook_records_attachments_and_checks_secret() {
    let t = test_app_with(GatewaySettings {
        webhook_secret: Some("s3cret".into()),
        ..GatewaySettings::default()
    })
    .await;

    let update = json!({
        "update_id": 1,
        "message": {
            "message_id": 5,
            "chat": {"id": -100},
            "document": {"file_id": "DOC5", "file_name": "ep1.mkv", "mime_type": "video/x-matroska", "file_size": 4096}
        }
    });

    let unauthenticated = Request::post("/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(update.to_string()))
        .unwrap();
    let (status, _, _) = t.send(unauthenticated).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::post("/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-telegram-bot-api-secret-token", "s3cret")
        .body(Body::from(update.to_string()))
        .unwrap();
    let (status, _, body) = t.send(req).await;
    assert_eq!(status, StatusCode::OK);
    let resp = parse(&body);
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["node"]["name"], "ep1.mkv");
    assert_eq!(resp["node"]["blob_ref"], "DOC5");
    assert_eq!(resp["node"]["size"], 4096);

    let text_only = json!({
        "update_id": 2,
        "message": {"message_id": 6, "chat": {"id": -100}, "text": "hello"}
    });
    let req = Request::post("/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-telegram-bot-api-secret-token", "s3cret")
        .body(Body::from(text_only.to_string()))
        .unwrap();
    let (status, _, body) = t.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body), json!({"ok": true, "node": null}));
}

// -- Health ---------------------------------------------------------------

#[tokio::test]
async fn readiness_reflects_blob_store_reachability() {
    let t = test_app().await;

    let (status, _, _) = t.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = t.get("/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["checks"]["sqlite"]["ok"], true);

    t.store.set_offline(true);
    let (status, _, body) = t.get("/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(parse(&body)["checks"]["blob_store"]["ok"], false);
}
