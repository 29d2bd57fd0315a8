use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::Utc;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, HOST, LOCATION, WWW_AUTHENTICATE};
use hyper::{Body, Method, Request, Response, StatusCode, Uri};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::http_client;
use super::path::{self, ParsedRequest, Route, RouteKind};
use crate::auth::{Challenge, TokenBroker};
use crate::config::HttpClientConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::mirror::{selector, Mirror, MirrorRegistry};
use crate::traffic::{RecordOutcome, RequestMeta, TrafficRecorder};

/// The request router and reverse proxy.
///
/// Parses the v2 path, picks the best mirror for its prefix, rewrites and
/// forwards the request, completes the upstream auth handshake when
/// challenged, and streams the response back through the traffic
/// recorder. Failover to the next candidate happens only while no body
/// bytes have reached the client.
#[derive(Clone)]
pub struct ProxyEngine {
    registry: MirrorRegistry,
    broker: TokenBroker,
    recorder: TrafficRecorder,
    config: HttpClientConfig,
}

impl ProxyEngine {
    pub fn new(
        registry: MirrorRegistry,
        broker: TokenBroker,
        recorder: TrafficRecorder,
        config: HttpClientConfig,
    ) -> Self {
        http_client::init(&config);
        Self {
            registry,
            broker,
            recorder,
            config,
        }
    }

    /// Entry point for registry-surface requests. Never fails; every error
    /// becomes its fixed client response.
    pub async fn handle(&self, req: Request<Body>, client_addr: SocketAddr) -> Response<Body> {
        let request_id = Uuid::new_v4();
        match self.process(req, client_addr, request_id).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request {} failed: {}", request_id, e);
                error_response(&e)
            }
        }
    }

    async fn process(
        &self,
        req: Request<Body>,
        client_addr: SocketAddr,
        request_id: Uuid,
    ) -> ProxyResult<Response<Body>> {
        let started = Instant::now();
        let ts = Utc::now();

        let raw_path = req.uri().path().to_string();
        let path = match path::normalize_legacy(&raw_path) {
            Some(normalized) if req.method() == Method::GET || req.method() == Method::HEAD => {
                debug!("Legacy path {} normalized to {}", raw_path, normalized);
                normalized
            }
            _ => raw_path.clone(),
        };

        let known: HashSet<String> = self.registry.known_prefixes().await.into_iter().collect();
        let route = match path::parse(&path, &known)? {
            ParsedRequest::Ping => {
                debug!("Request {} answered v2 ping locally", request_id);
                return ping_response();
            }
            ParsedRequest::Forward(route) => route,
        };

        let candidates = selector::candidates(&self.registry, &route.prefix).await?;
        let query = req.uri().query().map(|q| q.to_string());
        let method = req.method().clone();
        let headers = req.headers().clone();

        // Bodies are replayed on auth retry and failover, so they are
        // collected up front. Registry pulls carry no body at all.
        let body_bytes = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(|e| ProxyError::bad_request(format!("request body: {}", e)))?;

        let total = candidates.len();
        let mut last_err: Option<ProxyError> = None;
        for (attempt, mirror) in candidates.iter().enumerate() {
            let meta = RequestMeta {
                ts,
                started,
                client_ip: client_addr.ip().to_string(),
                method: method.to_string(),
                path: raw_path.clone(),
                mirror_id: Some(mirror.id),
                upstream_status: None,
                image_ref: route.image_ref.clone(),
            };

            match self
                .forward_once(mirror, &method, &headers, &body_bytes, &route, query.as_deref())
                .await
            {
                Ok(response) if response.status().is_server_error() && attempt + 1 < total => {
                    info!(
                        "Request {} got {} from '{}', failing over",
                        request_id,
                        response.status(),
                        mirror.prefix
                    );
                    self.recorder.submit(
                        RequestMeta {
                            upstream_status: Some(response.status().as_u16()),
                            ..meta
                        }
                        .into_record(0, RecordOutcome::UpstreamAbort),
                    );
                    continue;
                }
                Ok(response) => {
                    metrics::counter!("mirrorgate_requests_total").increment(1);
                    return Ok(self.relay(response, meta));
                }
                Err(e) if e.is_failover() && attempt + 1 < total => {
                    info!(
                        "Request {} upstream '{}' unavailable ({}), failing over",
                        request_id, mirror.prefix, e
                    );
                    self.recorder
                        .submit(meta.into_record(0, RecordOutcome::UpstreamAbort));
                    last_err = Some(e);
                    continue;
                }
                Err(e) => {
                    self.recorder
                        .submit(meta.into_record(0, RecordOutcome::UpstreamAbort));
                    last_err = Some(e);
                    break;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            // All candidates answered 5xx and the final one fell through.
            ProxyError::upstream_unavailable(route.prefix.clone(), "all mirrors exhausted")
        }))
    }

    /// One forwarding attempt against one mirror, including the auth
    /// handshake and (for blob GETs) redirect chasing.
    async fn forward_once(
        &self,
        mirror: &Mirror,
        method: &Method,
        headers: &HeaderMap,
        body: &Bytes,
        route: &Route,
        query: Option<&str>,
    ) -> ProxyResult<Response<Body>> {
        let url = upstream_url(mirror, &route.upstream_path, query);
        let header_timeout = Duration::from_secs(self.config.header_timeout_secs);

        let response = self
            .send_to(mirror, method, headers, body, &url, None, header_timeout)
            .await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            self.answer_challenge(mirror, method, headers, body, &url, route, response)
                .await?
        } else {
            response
        };

        if route.kind == RouteKind::Blob && method == Method::GET {
            return self
                .follow_redirects(mirror, method, headers, body, url, response)
                .await;
        }
        Ok(response)
    }

    /// 401 handling: answer a Basic challenge from stored credentials, or
    /// run the token dance for a Bearer challenge. One retry; a second 401
    /// is surfaced to the client unchanged.
    async fn answer_challenge(
        &self,
        mirror: &Mirror,
        method: &Method,
        headers: &HeaderMap,
        body: &Bytes,
        url: &str,
        route: &Route,
        original: Response<Body>,
    ) -> ProxyResult<Response<Body>> {
        let challenge = original
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse);

        let authorization = match challenge {
            Some(Challenge::Basic) => match mirror.auth.basic_credentials() {
                Some((user, pass)) => {
                    let encoded = general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
                    format!("Basic {}", encoded)
                }
                None => return Ok(original),
            },
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                // Anonymous pulls need the token dance too; stored Basic
                // credentials only change how the realm fetch is made.
                let scope = scope.or_else(|| default_scope(route));
                let token = self
                    .broker
                    .token(mirror, &realm, service.as_deref(), scope.as_deref())
                    .await?;
                format!("Bearer {}", token)
            }
            None => return Ok(original),
        };

        debug!("Retrying against '{}' with upstream credentials", mirror.prefix);
        let header_timeout = Duration::from_secs(self.config.header_timeout_secs);
        self.send_to(
            mirror,
            method,
            headers,
            body,
            url,
            Some(authorization.as_str()),
            header_timeout,
        )
        .await
    }

    /// Blob storage commonly redirects to an object-storage CDN; a Docker
    /// daemon expects content, so those hops are followed here, up to the
    /// configured budget.
    async fn follow_redirects(
        &self,
        mirror: &Mirror,
        method: &Method,
        headers: &HeaderMap,
        body: &Bytes,
        mut current_url: String,
        mut response: Response<Body>,
    ) -> ProxyResult<Response<Body>> {
        let header_timeout = Duration::from_secs(self.config.header_timeout_secs);

        for _ in 0..self.config.max_redirects {
            if !response.status().is_redirection() {
                return Ok(response);
            }
            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
            else {
                return Ok(response);
            };

            let next_url = resolve_location(&current_url, &location)?;
            debug!("Following blob redirect to {}", next_url);

            // Presigned CDN URLs carry their own auth in the query string
            // and reject a stale Authorization header.
            let cross_host = host_of(&next_url) != host_of(&current_url);
            response = self
                .send_redirect(method, headers, body, &next_url, cross_host, header_timeout)
                .await
                .map_err(|e| match e {
                    ProxyError::UpstreamUnavailable { message, .. } => {
                        ProxyError::upstream_unavailable(mirror.prefix.clone(), message)
                    }
                    other => other,
                })?;
            current_url = next_url;
        }

        if response.status().is_redirection() {
            warn!("Redirect budget exhausted for blob on '{}'", mirror.prefix);
            return Err(ProxyError::upstream_unavailable(
                mirror.prefix.clone(),
                "too many redirects",
            ));
        }
        Ok(response)
    }

    async fn send_redirect(
        &self,
        method: &Method,
        headers: &HeaderMap,
        body: &Bytes,
        url: &str,
        strip_auth: bool,
        header_timeout: Duration,
    ) -> ProxyResult<Response<Body>> {
        let uri: Uri = url.parse()?;
        let host = uri
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| ProxyError::bad_request(format!("redirect without host: {}", url)))?;

        let mut builder = Request::builder().method(method.clone()).uri(uri);
        if let Some(out) = builder.headers_mut() {
            copy_request_headers(headers, out);
            out.insert(HOST, HeaderValue::from_str(&host).map_err(ProxyError::from_header)?);
            if strip_auth {
                out.remove(AUTHORIZATION);
            }
        }
        let req = builder.body(Body::from(body.clone()))?;
        http_client::send(req, &host, header_timeout).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_to(
        &self,
        mirror: &Mirror,
        method: &Method,
        headers: &HeaderMap,
        body: &Bytes,
        url: &str,
        authorization: Option<&str>,
        header_timeout: Duration,
    ) -> ProxyResult<Response<Body>> {
        let uri: Uri = url.parse()?;
        let mut builder = Request::builder().method(method.clone()).uri(uri);
        if let Some(out) = builder.headers_mut() {
            copy_request_headers(headers, out);
            out.insert(
                HOST,
                HeaderValue::from_str(&mirror.upstream_host).map_err(ProxyError::from_header)?,
            );
            if let Some(auth) = authorization {
                out.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(auth).map_err(ProxyError::from_header)?,
                );
            }
        }
        let req = builder.body(Body::from(body.clone()))?;
        http_client::send(req, &mirror.prefix, header_timeout).await
    }

    /// Hand the upstream response to the client with its body routed
    /// through the counting pump.
    fn relay(&self, response: Response<Body>, meta: RequestMeta) -> Response<Body> {
        let (parts, body) = response.into_parts();
        let meta = RequestMeta {
            upstream_status: Some(parts.status.as_u16()),
            ..meta
        };

        let mut builder = Response::builder().status(parts.status);
        if let Some(out) = builder.headers_mut() {
            copy_response_headers(&parts.headers, out);
        }
        builder
            .body(self.recorder.relay(body, meta))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

impl ProxyError {
    fn from_header(err: hyper::header::InvalidHeaderValue) -> Self {
        ProxyError::internal(format!("header value: {}", err))
    }
}

/// Scope to request when a Bearer challenge omits one.
fn default_scope(route: &Route) -> Option<String> {
    let name = repository_name(&route.upstream_path)?;
    Some(format!("repository:{}:pull", name))
}

fn repository_name(upstream_path: &str) -> Option<String> {
    let rest = upstream_path.strip_prefix("/v2/")?;
    for marker in ["/manifests/", "/blobs/", "/tags/"] {
        if let Some(idx) = rest.find(marker) {
            return Some(rest[..idx].to_string());
        }
    }
    None
}

fn upstream_url(mirror: &Mirror, upstream_path: &str, query: Option<&str>) -> String {
    let base = mirror.upstream_url.trim_end_matches('/');
    match query {
        Some(q) => format!("{}{}?{}", base, upstream_path, q),
        None => format!("{}{}", base, upstream_path),
    }
}

fn host_of(url: &str) -> Option<String> {
    url.parse::<Uri>()
        .ok()
        .and_then(|u| u.authority().map(|a| a.host().to_string()))
}

/// Resolve a Location header against the URL that produced it.
fn resolve_location(current: &str, location: &str) -> ProxyResult<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(location.to_string());
    }
    let uri: Uri = current.parse()?;
    let scheme = uri.scheme_str().unwrap_or("https");
    let authority = uri
        .authority()
        .ok_or_else(|| ProxyError::bad_request(format!("relative redirect from {}", current)))?;
    if location.starts_with('/') {
        Ok(format!("{}://{}{}", scheme, authority, location))
    } else {
        let base_path = uri.path();
        let dir = &base_path[..base_path.rfind('/').map(|i| i + 1).unwrap_or(0)];
        Ok(format!("{}://{}{}{}", scheme, authority, dir, location))
    }
}

/// Copy client request headers upstream, dropping hop-by-hop headers and
/// everything the proxy owns: `Host` is set per mirror and incoming
/// `Authorization` never crosses (clients do not authenticate to us).
fn copy_request_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if is_hop_by_hop_header(name.as_str())
            || name == &HOST
            || name == &AUTHORIZATION
            || name == hyper::header::CONTENT_LENGTH
        {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// Copy upstream response headers to the client, dropping hop-by-hop
/// headers and any upstream cookies.
fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if is_hop_by_hop_header(name.as_str()) || name == &hyper::header::SET_COOKIE {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// `/v2/` discovery ping, answered without touching any upstream.
fn ping_response() -> ProxyResult<Response<Body>> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Docker-Distribution-API-Version", "registry/2.0")
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))?)
}

fn error_response(error: &ProxyError) -> Response<Body> {
    let status = error.client_status();
    let body = match error {
        ProxyError::NoUpstream { .. } => r#"{"error":"no upstream"}"#.to_string(),
        ProxyError::BadRequest { message } => {
            serde_json::json!({ "error": message }).to_string()
        }
        _ => r#"{"error":"upstream failure"}"#.to_string(),
    };
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
