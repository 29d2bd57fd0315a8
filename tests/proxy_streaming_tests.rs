//! End-to-end proxy behavior against throwaway local upstreams: local
//! ping handling, transparent streaming, prefix routing, failover, and
//! the upstream auth handshake.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mirrorgate::auth::TokenBroker;
use mirrorgate::config::{HttpClientConfig, TrafficConfig};
use mirrorgate::mirror::{HealthState, Mirror, MirrorAuth, MirrorRegistry};
use mirrorgate::proxy::ProxyEngine;
use mirrorgate::traffic::TrafficRecorder;

const CLIENT: &str = "10.1.2.3:55555";

fn test_engine(registry: MirrorRegistry) -> ProxyEngine {
    let recorder = TrafficRecorder::new(&TrafficConfig::default(), Duration::from_secs(5));
    ProxyEngine::new(
        registry,
        TokenBroker::new(),
        recorder,
        HttpClientConfig::default(),
    )
}

fn mirror(id: i64, prefix: &str, addr: SocketAddr, latency: u64) -> Mirror {
    Mirror {
        id,
        prefix: prefix.to_string(),
        upstream_url: format!("http://{}", addr),
        upstream_host: addr.to_string(),
        auth: MirrorAuth::None,
        enabled: true,
        health: HealthState::Healthy,
        latency_ms: Some(latency),
        consecutive_failures: 0,
        last_probe_at: None,
    }
}

/// Bind a throwaway upstream on 127.0.0.1:0 running the given handler.
async fn spawn_upstream<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response<Body>> + Send + 'static,
{
    let make_service = make_service_fn(move |_| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler(req).await) }
            }))
        }
    });
    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_service);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(format!("http://proxy.local{}", path))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_v2_ping_answered_locally() {
    // No mirrors at all: the ping must still work without upstream traffic.
    let registry = MirrorRegistry::new();
    let engine = test_engine(registry);

    let response = engine.handle(get("/v2/"), CLIENT.parse().unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("Docker-Distribution-API-Version")
            .and_then(|v| v.to_str().ok()),
        Some("registry/2.0")
    );
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"{}");
}

#[tokio::test]
async fn test_no_upstream_is_503() {
    let registry = MirrorRegistry::new();
    let engine = test_engine(registry);

    let response = engine
        .handle(get("/v2/library/nginx/manifests/latest"), CLIENT.parse().unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], br#"{"error":"no upstream"}"#);
}

#[tokio::test]
async fn test_streaming_is_transparent() {
    // 1 MiB of patterned bytes delivered in many chunks must arrive intact.
    let payload: Arc<Vec<u8>> = Arc::new((0..1_048_576u32).map(|i| (i % 251) as u8).collect());
    let served = Arc::clone(&payload);
    let addr = spawn_upstream(move |_req| {
        let served = Arc::clone(&served);
        async move {
            let (mut tx, body) = Body::channel();
            tokio::spawn(async move {
                for chunk in served.chunks(8192) {
                    if tx.send_data(bytes::Bytes::copy_from_slice(chunk)).await.is_err() {
                        return;
                    }
                }
            });
            Response::builder()
                .header("docker-content-digest", "sha256:deadbeef")
                .body(body)
                .unwrap()
        }
    })
    .await;

    let registry = MirrorRegistry::new();
    registry.replace_all(vec![mirror(1, "dockerhub", addr, 10)]).await;
    let engine = test_engine(registry);

    let response = engine
        .handle(
            get("/v2/library/nginx/blobs/sha256:deadbeef"),
            CLIENT.parse().unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok()),
        Some("sha256:deadbeef")
    );

    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(body.len(), payload.len());
    assert_eq!(&body[..], payload.as_slice());
}

#[tokio::test]
async fn test_library_shortcut_applied_for_default_pool() {
    let addr = spawn_upstream(|req| async move {
        Response::new(Body::from(req.uri().path().to_string()))
    })
    .await;

    let registry = MirrorRegistry::new();
    registry.replace_all(vec![mirror(1, "dockerhub", addr, 10)]).await;
    let engine = test_engine(registry);

    let response = engine
        .handle(get("/v2/nginx/manifests/latest"), CLIENT.parse().unwrap())
        .await;
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"/v2/library/nginx/manifests/latest");
}

#[tokio::test]
async fn test_prefix_stripped_before_forwarding() {
    let addr = spawn_upstream(|req| async move {
        Response::new(Body::from(req.uri().path().to_string()))
    })
    .await;

    let registry = MirrorRegistry::new();
    registry.replace_all(vec![mirror(1, "ghcr", addr, 10)]).await;
    let engine = test_engine(registry);

    let response = engine
        .handle(get("/v2/ghcr/owner/app/manifests/v1"), CLIENT.parse().unwrap())
        .await;
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    // Prefix gone, and no library rewrite outside the default pool.
    assert_eq!(&body[..], b"/v2/owner/app/manifests/v1");
}

#[tokio::test]
async fn test_legacy_path_normalized_to_manifest() {
    let addr = spawn_upstream(|req| async move {
        Response::new(Body::from(req.uri().path().to_string()))
    })
    .await;

    let registry = MirrorRegistry::new();
    registry.replace_all(vec![mirror(1, "dockerhub", addr, 10)]).await;
    let engine = test_engine(registry);

    let response = engine.handle(get("/nginx:1.25"), CLIENT.parse().unwrap()).await;
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"/v2/library/nginx/manifests/1.25");
}

#[tokio::test]
async fn test_failover_to_slower_mirror_before_body() {
    // The faster mirror is a dead port: connection refused before any
    // body bytes, so the request must transparently land on the slower one.
    let dead_addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    };
    let live_addr = spawn_upstream(|_req| async move {
        Response::new(Body::from("manifest-from-live-mirror"))
    })
    .await;

    let registry = MirrorRegistry::new();
    registry
        .replace_all(vec![
            mirror(1, "dockerhub", live_addr, 50),
            mirror(2, "dockerhub", dead_addr, 20),
        ])
        .await;
    let engine = test_engine(registry);

    let response = engine
        .handle(get("/v2/library/nginx/manifests/latest"), CLIENT.parse().unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"manifest-from-live-mirror");
}

#[tokio::test]
async fn test_all_mirrors_down_is_502() {
    let dead_addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    };

    let registry = MirrorRegistry::new();
    registry.replace_all(vec![mirror(1, "dockerhub", dead_addr, 20)]).await;
    let engine = test_engine(registry);

    let response = engine
        .handle(get("/v2/library/nginx/manifests/latest"), CLIENT.parse().unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_404_passes_through() {
    let addr = spawn_upstream(|_req| async move {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from(r#"{"errors":[{"code":"MANIFEST_UNKNOWN"}]}"#))
            .unwrap()
    })
    .await;

    let registry = MirrorRegistry::new();
    registry.replace_all(vec![mirror(1, "dockerhub", addr, 10)]).await;
    let engine = test_engine(registry);

    let response = engine
        .handle(get("/v2/library/nope/manifests/latest"), CLIENT.parse().unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_basic_challenge_answered_from_stored_credentials() {
    // Upstream wants Basic auth; the client never sent any. The proxy
    // must retry with the mirror's stored credentials.
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let addr = spawn_upstream(move |req| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            match req.headers().get("authorization").and_then(|v| v.to_str().ok()) {
                // base64("alice:s3cret")
                Some("Basic YWxpY2U6czNjcmV0") => Response::new(Body::from("private-manifest")),
                _ => Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .header("Www-Authenticate", r#"Basic realm="harbor""#)
                    .body(Body::empty())
                    .unwrap(),
            }
        }
    })
    .await;

    let registry = MirrorRegistry::new();
    let mut m = mirror(1, "harbor", addr, 10);
    m.auth = MirrorAuth::Basic {
        username: "alice".into(),
        password: "s3cret".into(),
    };
    registry.replace_all(vec![m]).await;
    let engine = test_engine(registry);

    let response = engine
        .handle(get("/v2/harbor/team/app/manifests/v1"), CLIENT.parse().unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"private-manifest");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_bearer_dance_and_single_realm_fetch() {
    // Token realm counting its hits.
    let realm_hits = Arc::new(AtomicUsize::new(0));
    let realm_seen = Arc::clone(&realm_hits);
    let realm_addr = spawn_upstream(move |_req| {
        let realm_seen = Arc::clone(&realm_seen);
        async move {
            realm_seen.fetch_add(1, Ordering::SeqCst);
            Response::builder()
                .header("content-type", "application/json")
                .body(Body::from(r#"{"token":"tok-123","expires_in":300}"#))
                .unwrap()
        }
    })
    .await;

    // Registry demanding a Bearer token.
    let realm_url = format!("http://{}/token", realm_addr);
    let challenge = format!(
        r#"Bearer realm="{}",service="test-registry",scope="repository:library/nginx:pull""#,
        realm_url
    );
    let registry_addr = spawn_upstream(move |req| {
        let challenge = challenge.clone();
        async move {
            match req.headers().get("authorization").and_then(|v| v.to_str().ok()) {
                Some("Bearer tok-123") => Response::new(Body::from("tokened-manifest")),
                _ => Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .header("Www-Authenticate", challenge)
                    .body(Body::empty())
                    .unwrap(),
            }
        }
    })
    .await;

    let registry = MirrorRegistry::new();
    registry
        .replace_all(vec![mirror(1, "dockerhub", registry_addr, 10)])
        .await;
    let engine = test_engine(registry);

    // A burst of identical pulls on a cold token cache.
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .handle(get("/v2/library/nginx/manifests/latest"), CLIENT.parse().unwrap())
                .await
        }));
    }
    for task in tasks {
        let response = task.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"tokened-manifest");
    }

    assert_eq!(realm_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_second_401_surfaces_unchanged() {
    // Upstream rejects even the fetched token.
    let realm_addr = spawn_upstream(|_req| async move {
        Response::new(Body::from(r#"{"token":"useless"}"#))
    })
    .await;
    let realm_url = format!("http://{}/token", realm_addr);
    let challenge = format!(r#"Bearer realm="{}",service="s""#, realm_url);
    let registry_addr = spawn_upstream(move |_req| {
        let challenge = challenge.clone();
        async move {
            Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header("Www-Authenticate", challenge)
                .body(Body::from("denied"))
                .unwrap()
        }
    })
    .await;

    let registry = MirrorRegistry::new();
    registry
        .replace_all(vec![mirror(1, "dockerhub", registry_addr, 10)])
        .await;
    let engine = test_engine(registry);

    let response = engine
        .handle(get("/v2/library/nginx/manifests/latest"), CLIENT.parse().unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get("www-authenticate").is_some());
}

#[tokio::test]
async fn test_blob_redirect_followed() {
    // CDN target for the redirect.
    let cdn_addr = spawn_upstream(|req| async move {
        assert!(req.headers().get("authorization").is_none());
        Response::new(Body::from("blob-bytes-from-cdn"))
    })
    .await;

    let location = format!("http://{}/storage/blob", cdn_addr);
    let registry_addr = spawn_upstream(move |_req| {
        let location = location.clone();
        async move {
            Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header("location", location)
                .body(Body::empty())
                .unwrap()
        }
    })
    .await;

    let registry = MirrorRegistry::new();
    registry
        .replace_all(vec![mirror(1, "dockerhub", registry_addr, 10)])
        .await;
    let engine = test_engine(registry);

    let response = engine
        .handle(
            get("/v2/library/nginx/blobs/sha256:cafe"),
            CLIENT.parse().unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"blob-bytes-from-cdn");
}

#[tokio::test]
async fn test_manifest_redirect_not_followed() {
    let registry_addr = spawn_upstream(|_req| async move {
        Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header("location", "http://elsewhere.example/manifest")
            .body(Body::empty())
            .unwrap()
    })
    .await;

    let registry = MirrorRegistry::new();
    registry
        .replace_all(vec![mirror(1, "dockerhub", registry_addr, 10)])
        .await;
    let engine = test_engine(registry);

    let response = engine
        .handle(get("/v2/library/nginx/manifests/latest"), CLIENT.parse().unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
}

#[tokio::test]
async fn test_client_authorization_never_reaches_upstream() {
    let addr = spawn_upstream(|req| async move {
        let leaked = req.headers().get("authorization").is_some();
        Response::new(Body::from(if leaked { "leaked" } else { "clean" }))
    })
    .await;

    let registry = MirrorRegistry::new();
    registry.replace_all(vec![mirror(1, "dockerhub", addr, 10)]).await;
    let engine = test_engine(registry);

    let req = Request::builder()
        .method("GET")
        .uri("http://proxy.local/v2/library/nginx/manifests/latest")
        .header("authorization", "Bearer client-secret")
        .body(Body::empty())
        .unwrap();
    let response = engine.handle(req, CLIENT.parse().unwrap()).await;
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"clean");
}
