//! Admin surface: mirror CRUD, idempotent PATCH, credential redaction,
//! probe trigger, and the stats/history read side.

use hyper::{Body, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use mirrorgate::admin::{self, AdminContext};
use mirrorgate::config::TrafficConfig;
use mirrorgate::crypto::CredentialCipher;
use mirrorgate::mirror::{MirrorRegistry, ProbeHandle};
use mirrorgate::store::Store;
use mirrorgate::traffic::TrafficRecorder;

const BASE: &str = "/api";

async fn test_context() -> (Arc<AdminContext>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(
        dir.path().to_str().unwrap(),
        CredentialCipher::from_passphrase("test"),
    )
    .await
    .unwrap();
    let registry = MirrorRegistry::new();
    let recorder = TrafficRecorder::new(&TrafficConfig::default(), Duration::from_secs(60));
    let ctx = Arc::new(AdminContext::new(
        store,
        registry,
        ProbeHandle::default(),
        None,
        recorder,
    ));
    (ctx, dir)
}

async fn call(ctx: &Arc<AdminContext>, method: &str, path: &str, body: &str) -> Response<Body> {
    let req = Request::builder()
        .method(method)
        .uri(format!("http://admin.local{}{}", BASE, path))
        .body(if body.is_empty() {
            Body::empty()
        } else {
            Body::from(body.to_string())
        })
        .unwrap();
    admin::handle(req, Arc::clone(ctx), BASE).await
}

async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_mirror_crud_lifecycle() {
    let (ctx, _dir) = test_context().await;

    // Create.
    let response = call(
        &ctx,
        "POST",
        "/mirrors",
        r#"{"prefix":"ghcr","upstream_url":"https://ghcr.io"}"#,
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["prefix"], "ghcr");
    assert_eq!(created["upstream_host"], "ghcr.io");
    assert_eq!(created["health"], "unknown");

    // Visible in the list and in the routing registry.
    let response = call(&ctx, "GET", "/mirrors", "").await;
    let list = json_body(response).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert!(ctx.registry.get_by_prefix("ghcr").await.is_some());

    // Patch.
    let response = call(
        &ctx,
        "PATCH",
        &format!("/mirrors/{}", id),
        r#"{"upstream_host":"ghcr.cdn.example"}"#,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let patched = json_body(response).await;
    assert_eq!(patched["upstream_host"], "ghcr.cdn.example");

    // Toggle off takes it out of the registry's selectable view.
    let response = call(&ctx, "POST", &format!("/mirrors/{}/toggle", id), "").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(ctx.registry.list_by_prefix("ghcr", true).await.is_empty());

    // Delete.
    let response = call(&ctx, "DELETE", &format!("/mirrors/{}", id), "").await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = call(&ctx, "DELETE", &format!("/mirrors/{}", id), "").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(ctx.registry.get_by_prefix("ghcr").await.is_none());
}

#[tokio::test]
async fn test_patch_is_idempotent() {
    let (ctx, _dir) = test_context().await;
    let response = call(
        &ctx,
        "POST",
        "/mirrors",
        r#"{"prefix":"quay","upstream_url":"https://quay.io"}"#,
    )
    .await;
    let id = json_body(response).await["id"].as_i64().unwrap();

    let patch = r#"{"prefix":"quay","upstream_url":"https://quay.io","enabled":true}"#;
    let first = json_body(call(&ctx, "PATCH", &format!("/mirrors/{}", id), patch).await).await;
    let second = json_body(call(&ctx, "PATCH", &format!("/mirrors/{}", id), patch).await).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_credentials_redacted_everywhere() {
    let (ctx, _dir) = test_context().await;
    let response = call(
        &ctx,
        "POST",
        "/mirrors",
        r#"{"prefix":"harbor","upstream_url":"https://harbor.example",
            "auth":{"kind":"basic","username":"alice","password":"s3cret"}}"#,
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(!text.contains("s3cret"));
    assert!(text.contains("<redacted>"));

    let response = call(&ctx, "GET", "/mirrors", "").await;
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert!(!String::from_utf8_lossy(&bytes).contains("s3cret"));
}

#[tokio::test]
async fn test_create_validation() {
    let (ctx, _dir) = test_context().await;

    let response = call(
        &ctx,
        "POST",
        "/mirrors",
        r#"{"prefix":"a/b","upstream_url":"https://x.example"}"#,
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = call(
        &ctx,
        "POST",
        "/mirrors",
        r#"{"prefix":"ok","upstream_url":"ftp://x.example"}"#,
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = call(&ctx, "POST", "/mirrors", "not json").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_probe_trigger_and_unknown_routes() {
    let (ctx, _dir) = test_context().await;

    let response = call(&ctx, "POST", "/probe", "").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // No scraper configured.
    let response = call(&ctx, "POST", "/scrape", "").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = call(&ctx, "GET", "/nope", "").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = call(&ctx, "PATCH", "/mirrors/not-a-number", "{}").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stats_and_history_endpoints() {
    let (ctx, _dir) = test_context().await;

    let records: Vec<mirrorgate::traffic::TrafficRecord> = (0..3)
        .map(|i| mirrorgate::traffic::TrafficRecord {
            ts: chrono::Utc::now() + chrono::Duration::seconds(i),
            client_ip: "10.0.0.9".into(),
            method: "GET".into(),
            path: format!("/v2/a/manifests/v{}", i),
            mirror_id: Some(4),
            upstream_status: Some(200),
            bytes_out: 512,
            duration_ms: 20,
            image_ref: Some(format!("a:v{}", i)),
            outcome: mirrorgate::traffic::RecordOutcome::Complete,
        })
        .collect();
    ctx.store.insert_traffic_batch(&records).await.unwrap();

    let stats = json_body(call(&ctx, "GET", "/stats", "").await).await;
    assert_eq!(stats["total_requests"], 3);
    assert_eq!(stats["total_bytes"], 1536);
    assert_eq!(stats["per_mirror"][0]["id"], 4);
    assert!(stats["records_dropped"].is_number());

    let history = json_body(call(&ctx, "GET", "/history?limit=2", "").await).await;
    let items = history.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["image_ref"], "a:v2");
}
