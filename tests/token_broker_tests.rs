//! Token broker behavior against a local auth realm: caching, the expiry
//! safety margin, field fallbacks, and failure mapping.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mirrorgate::auth::TokenBroker;
use mirrorgate::error::ProxyError;
use mirrorgate::mirror::{HealthState, Mirror, MirrorAuth};

fn mirror(id: i64, auth: MirrorAuth) -> Mirror {
    Mirror {
        id,
        prefix: "dockerhub".to_string(),
        upstream_url: "https://registry-1.docker.io".to_string(),
        upstream_host: "registry-1.docker.io".to_string(),
        auth,
        enabled: true,
        health: HealthState::Healthy,
        latency_ms: Some(10),
        consecutive_failures: 0,
        last_probe_at: None,
    }
}

async fn spawn_realm<F, Fut>(handler: F) -> SocketAddr
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

#[tokio::test]
async fn test_token_cached_per_scope() {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let addr = spawn_realm(move |req| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            let scope = req.uri().query().unwrap_or("").to_string();
            Response::new(Body::from(format!(
                r#"{{"token":"tok-{}","expires_in":300}}"#,
                scope.len()
            )))
        }
    })
    .await;
    let realm = format!("http://{}/token", addr);

    let broker = TokenBroker::new();
    let m = mirror(1, MirrorAuth::None);

    let first = broker
        .token(&m, &realm, Some("svc"), Some("repository:a:pull"))
        .await
        .unwrap();
    let second = broker
        .token(&m, &realm, Some("svc"), Some("repository:a:pull"))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // A different scope is a different cache entry.
    broker
        .token(&m, &realm, Some("svc"), Some("repository:b:pull"))
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_short_lived_token_is_not_reused() {
    // expires_in below the 30s safety margin: usable once, never cached.
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let addr = spawn_realm(move |_req| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Response::new(Body::from(r#"{"token":"ephemeral","expires_in":10}"#))
        }
    })
    .await;
    let realm = format!("http://{}/token", addr);

    let broker = TokenBroker::new();
    let m = mirror(1, MirrorAuth::None);
    broker.token(&m, &realm, None, Some("s")).await.unwrap();
    broker.token(&m, &realm, None, Some("s")).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_access_token_fallback_and_default_expiry() {
    let addr = spawn_realm(|_req| async move {
        // GHCR-style response: access_token, no expires_in.
        Response::new(Body::from(r#"{"access_token":"ghcr-tok"}"#))
    })
    .await;
    let realm = format!("http://{}/token", addr);

    let broker = TokenBroker::new();
    let token = broker
        .token(&mirror(1, MirrorAuth::None), &realm, None, Some("s"))
        .await
        .unwrap();
    assert_eq!(token, "ghcr-tok");
}

#[tokio::test]
async fn test_basic_credentials_attached_to_realm_fetch() {
    let addr = spawn_realm(|req| async move {
        match req.headers().get("authorization").and_then(|v| v.to_str().ok()) {
            // base64("alice:s3cret")
            Some("Basic YWxpY2U6czNjcmV0") => {
                Response::new(Body::from(r#"{"token":"private-tok"}"#))
            }
            _ => Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(Body::empty())
                .unwrap(),
        }
    })
    .await;
    let realm = format!("http://{}/token", addr);

    let broker = TokenBroker::new();
    let m = mirror(
        1,
        MirrorAuth::Basic {
            username: "alice".into(),
            password: "s3cret".into(),
        },
    );
    let token = broker.token(&m, &realm, None, Some("s")).await.unwrap();
    assert_eq!(token, "private-tok");

    // Without credentials the same realm rejects the fetch.
    let anon = mirror(2, MirrorAuth::None);
    let err = broker.token(&anon, &realm, None, Some("s")).await.unwrap_err();
    assert!(matches!(err, ProxyError::AuthFailure { .. }));
}

#[tokio::test]
async fn test_realm_errors_map_to_auth_failure() {
    let addr = spawn_realm(|_req| async move {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap()
    })
    .await;
    let realm = format!("http://{}/token", addr);

    let broker = TokenBroker::new();
    let err = broker
        .token(&mirror(1, MirrorAuth::None), &realm, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::AuthFailure { .. }));

    // Malformed body.
    let addr = spawn_realm(|_req| async move { Response::new(Body::from("not json")) }).await;
    let realm = format!("http://{}/token", addr);
    let err = broker
        .token(&mirror(1, MirrorAuth::None), &realm, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::AuthFailure { .. }));

    // Unreachable realm.
    let dead = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    };
    let err = broker
        .token(
            &mirror(1, MirrorAuth::None),
            &format!("http://{}/token", dead),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::AuthFailure { .. }));
}
