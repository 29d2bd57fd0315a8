//! JSON admin API: mirror CRUD, probe and scrape triggers, traffic stats
//! and history, and the Docker Hub search passthrough.
//!
//! Mounted on the proxy listener under a configurable base path. State is
//! passed explicitly; handlers never reach for globals.

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ProxyResult;
use crate::mirror::{MirrorRegistry, ProbeHandle};
use crate::mirror::scraper::MirrorScraper;
use crate::store::{MirrorPatch, NewMirror, Store};
use crate::traffic::TrafficRecorder;

pub struct AdminContext {
    pub store: Store,
    pub registry: MirrorRegistry,
    pub probe: ProbeHandle,
    pub scraper: Option<Arc<MirrorScraper>>,
    pub recorder: TrafficRecorder,
    search_client: reqwest::Client,
}

impl AdminContext {
    pub fn new(
        store: Store,
        registry: MirrorRegistry,
        probe: ProbeHandle,
        scraper: Option<Arc<MirrorScraper>>,
        recorder: TrafficRecorder,
    ) -> Self {
        let search_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            store,
            registry,
            probe,
            scraper,
            recorder,
            search_client,
        }
    }

    /// Rebuild the in-memory registry from the store, called after every
    /// mutation so the hot path sees the change.
    async fn reload_registry(&self) -> ProxyResult<()> {
        let mirrors = self.store.load_mirrors().await?;
        self.registry.replace_all(mirrors).await;
        Ok(())
    }
}

/// Route an admin request. `base_path` has already been matched by the
/// caller and is stripped here.
pub async fn handle(req: Request<Body>, ctx: Arc<AdminContext>, base_path: &str) -> Response<Body> {
    let path = req.uri().path()[base_path.len()..].to_string();
    let method = req.method().clone();

    let result = match (&method, path.as_str()) {
        (&Method::GET, "/mirrors") => list_mirrors(&ctx).await,
        (&Method::POST, "/mirrors") => create_mirror(req, &ctx).await,
        (&Method::POST, "/probe") => trigger_probe(&ctx),
        (&Method::POST, "/scrape") => trigger_scrape(&ctx),
        (&Method::GET, "/stats") => stats(&ctx).await,
        (&Method::GET, "/history") => history(req.uri().query(), &ctx).await,
        (&Method::GET, "/search") => search(req.uri().query(), &ctx).await,
        _ => match parse_mirror_path(&path) {
            Some((id, None)) if method == Method::PATCH => patch_mirror(req, id, &ctx).await,
            Some((id, None)) if method == Method::DELETE => delete_mirror(id, &ctx).await,
            Some((id, Some("toggle"))) if method == Method::POST => toggle_mirror(id, &ctx).await,
            _ => Ok(status_json(
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": "not found"}),
            )),
        },
    };

    result.unwrap_or_else(|e| {
        warn!("Admin request {} {} failed: {}", method, path, e);
        status_json(
            e.client_status(),
            serde_json::json!({"error": e.to_string()}),
        )
    })
}

/// `/mirrors/{id}` and `/mirrors/{id}/{action}`.
fn parse_mirror_path(path: &str) -> Option<(i64, Option<&str>)> {
    let rest = path.strip_prefix("/mirrors/")?;
    match rest.split_once('/') {
        Some((id, action)) => Some((id.parse().ok()?, Some(action))),
        None => Some((rest.parse().ok()?, None)),
    }
}

async fn list_mirrors(ctx: &AdminContext) -> ProxyResult<Response<Body>> {
    let mirrors = ctx.registry.all().await;
    Ok(ok_json(&mirrors))
}

async fn create_mirror(req: Request<Body>, ctx: &AdminContext) -> ProxyResult<Response<Body>> {
    let new: NewMirror = match read_json(req).await {
        Ok(new) => new,
        Err(resp) => return Ok(resp),
    };

    if new.prefix.is_empty() || new.prefix.contains('/') {
        return Ok(bad_request("prefix must be a single path segment"));
    }
    if !new.upstream_url.starts_with("http://") && !new.upstream_url.starts_with("https://") {
        return Ok(bad_request("upstream_url must be absolute"));
    }

    let created = ctx.store.insert_mirror(&new).await?;
    ctx.reload_registry().await?;
    info!("Mirror '{}' created (id {})", created.prefix, created.id);
    Ok(status_json(StatusCode::CREATED, &created))
}

async fn patch_mirror(
    req: Request<Body>,
    id: i64,
    ctx: &AdminContext,
) -> ProxyResult<Response<Body>> {
    let patch: MirrorPatch = match read_json(req).await {
        Ok(patch) => patch,
        Err(resp) => return Ok(resp),
    };
    if let Some(prefix) = &patch.prefix {
        if prefix.is_empty() || prefix.contains('/') {
            return Ok(bad_request("prefix must be a single path segment"));
        }
    }

    match ctx.store.update_mirror(id, &patch).await? {
        Some(updated) => {
            ctx.reload_registry().await?;
            Ok(ok_json(&updated))
        }
        None => Ok(not_found()),
    }
}

async fn delete_mirror(id: i64, ctx: &AdminContext) -> ProxyResult<Response<Body>> {
    if !ctx.store.delete_mirror(id).await? {
        return Ok(not_found());
    }
    ctx.reload_registry().await?;
    info!("Mirror {} deleted", id);
    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty())))
}

async fn toggle_mirror(id: i64, ctx: &AdminContext) -> ProxyResult<Response<Body>> {
    match ctx.store.toggle_mirror(id).await? {
        Some(updated) => {
            ctx.reload_registry().await?;
            info!(
                "Mirror '{}' {}",
                updated.prefix,
                if updated.enabled { "enabled" } else { "disabled" }
            );
            Ok(ok_json(&updated))
        }
        None => Ok(not_found()),
    }
}

fn trigger_probe(ctx: &AdminContext) -> ProxyResult<Response<Body>> {
    ctx.probe.trigger();
    Ok(status_json(
        StatusCode::ACCEPTED,
        serde_json::json!({"status": "probing"}),
    ))
}

fn trigger_scrape(ctx: &AdminContext) -> ProxyResult<Response<Body>> {
    let Some(scraper) = ctx.scraper.clone() else {
        return Ok(status_json(
            StatusCode::CONFLICT,
            serde_json::json!({"error": "no scraper source configured"}),
        ));
    };
    tokio::spawn(async move {
        if let Err(e) = scraper.run_once().await {
            warn!("Scrape round failed: {}", e);
        }
    });
    Ok(status_json(
        StatusCode::ACCEPTED,
        serde_json::json!({"status": "scraping"}),
    ))
}

async fn stats(ctx: &AdminContext) -> ProxyResult<Response<Body>> {
    let mut summary = serde_json::to_value(ctx.store.traffic_summary().await?)
        .unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = summary.as_object_mut() {
        obj.insert(
            "records_dropped".to_string(),
            serde_json::json!(ctx.recorder.dropped_count()),
        );
    }
    Ok(ok_json(&summary))
}

async fn history(query: Option<&str>, ctx: &AdminContext) -> ProxyResult<Response<Body>> {
    let limit = query_param(query, "limit")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(100)
        .clamp(1, 1000);
    let records = ctx.store.traffic_history(limit).await?;
    Ok(ok_json(&records))
}

/// Search passthrough to Docker Hub. Failures degrade to an empty result
/// set; the UI treats that the same as no matches.
async fn search(query: Option<&str>, ctx: &AdminContext) -> ProxyResult<Response<Body>> {
    let Some(q) = query_param(query, "q") else {
        return Ok(bad_request("missing query parameter q"));
    };

    let url = "https://hub.docker.com/v2/search/repositories/";
    match ctx
        .search_client
        .get(url)
        .query(&[("query", q.as_str())])
        .send()
        .await
    {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let body = response.bytes().await.unwrap_or_default();
            Ok(Response::builder()
                .status(status)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap_or_else(|_| Response::new(Body::empty())))
        }
        Err(e) => {
            warn!("Search passthrough failed: {}", e);
            Ok(status_json(
                StatusCode::BAD_GATEWAY,
                serde_json::json!({"results": []}),
            ))
        }
    }
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Body>,
) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| bad_request(&format!("body read: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| bad_request(&format!("invalid JSON: {}", e)))
}

fn ok_json<T: Serialize>(value: &T) -> Response<Body> {
    status_json(StatusCode::OK, value)
}

fn status_json<T: Serialize>(status: StatusCode, value: T) -> Response<Body> {
    let body = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn bad_request(message: &str) -> Response<Body> {
    status_json(
        StatusCode::BAD_REQUEST,
        serde_json::json!({ "error": message }),
    )
}

fn not_found() -> Response<Body> {
    status_json(
        StatusCode::NOT_FOUND,
        serde_json::json!({"error": "mirror not found"}),
    )
}
