use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response};
use hyper_rustls::HttpsConnectorBuilder;
use once_cell::sync::Lazy;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::HttpClientConfig;
use crate::error::{ProxyError, ProxyResult};

/// Shared hyper client with connection pooling (HTTP/HTTPS via rustls).
///
/// A single instance is reused across requests so upstream connections
/// pool per host. Redirects are not followed here; the engine follows
/// them explicitly for blob downloads only.
#[allow(clippy::type_complexity)]
static SHARED_CLIENT: Lazy<
    RwLock<Arc<Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>>>,
> = Lazy::new(|| RwLock::new(Arc::new(build_client(&HttpClientConfig::default()))));

/// Initialize or replace the shared client. First call wins the config;
/// later calls rebuild the pool (best-effort hot reload).
pub fn init(config: &HttpClientConfig) {
    let new_client = Arc::new(build_client(config));
    if let Ok(mut guard) = SHARED_CLIENT.write() {
        *guard = new_client;
    }
}

fn get_client() -> Arc<Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>> {
    SHARED_CLIENT
        .read()
        .ok()
        .map(|g| Arc::clone(&g))
        .unwrap_or_else(|| Arc::new(build_client(&HttpClientConfig::default())))
}

fn build_client(
    config: &HttpClientConfig,
) -> Client<hyper_rustls::HttpsConnector<HttpConnector>, Body> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));

    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder()
        .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build::<_, Body>(https)
}

/// Send a request upstream, bounding the wait for response headers. The
/// body stream that follows is unbounded; the caller enforces its own
/// idle deadline while relaying.
pub async fn send(
    req: Request<Body>,
    mirror_name: &str,
    header_timeout: Duration,
) -> ProxyResult<Response<Body>> {
    let client = get_client();
    match tokio::time::timeout(header_timeout, client.request(req)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(ProxyError::upstream_unavailable(mirror_name, e.to_string())),
        Err(_) => Err(ProxyError::timeout(header_timeout, "upstream response headers")),
    }
}
