//! The registry v2 path grammar as seen from the client side, and its
//! translation into an upstream path.

use std::collections::HashSet;

use crate::error::{ProxyError, ProxyResult};
use crate::mirror::DEFAULT_PREFIX;

/// Operation class of a forwarded request. Blob downloads get redirect
/// following; manifest requests feed the pull history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Catalog,
    TagList,
    Manifest,
    Blob,
    Upload,
    /// Anything else under a repository path (e.g. the referrers API);
    /// forwarded verbatim.
    Other,
}

/// A client path resolved against the known mirror prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Routing key selecting the mirror pool.
    pub prefix: String,
    /// Path to request upstream, query string excluded.
    pub upstream_path: String,
    pub kind: RouteKind,
    /// `name:reference` for manifest requests.
    pub image_ref: Option<String>,
}

/// What to do with an incoming registry path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRequest {
    /// `/v2/` discovery ping, answered locally.
    Ping,
    Forward(Route),
}

/// Parse a client path rooted at `/v2/`.
///
/// The first segment after `/v2/` is compared against the known mirror
/// prefixes; on a match it is stripped and the remainder is forwarded to
/// that pool, otherwise the whole path goes to the default pool. Docker
/// Hub's `library/` shortcut is applied for default-pool names without a
/// slash.
pub fn parse(path: &str, known_prefixes: &HashSet<String>) -> ProxyResult<ParsedRequest> {
    let rest = path
        .strip_prefix("/v2")
        .ok_or_else(|| ProxyError::bad_request(format!("path outside /v2: {}", path)))?;
    let rest = rest.strip_prefix('/').unwrap_or(rest);

    if rest.is_empty() {
        return Ok(ParsedRequest::Ping);
    }

    let segments: Vec<&str> = rest.split('/').collect();
    let (prefix, segments) = if segments.len() > 1 && known_prefixes.contains(segments[0]) {
        (segments[0].to_string(), &segments[1..])
    } else {
        (DEFAULT_PREFIX.to_string(), &segments[..])
    };

    if segments.len() == 1 && segments[0] == "_catalog" {
        return Ok(ParsedRequest::Forward(Route {
            prefix,
            upstream_path: "/v2/_catalog".to_string(),
            kind: RouteKind::Catalog,
            image_ref: None,
        }));
    }

    let route = classify(&prefix, segments)
        .ok_or_else(|| ProxyError::bad_request(format!("unrecognized registry path: {}", path)))?;
    Ok(ParsedRequest::Forward(route))
}

fn classify(prefix: &str, segments: &[&str]) -> Option<Route> {
    let n = segments.len();
    if n < 2 {
        // A lone repository name has no operation on it.
        return None;
    }
    // Empty segments mean a double slash, except the trailing slash of
    // `blobs/uploads/` which is part of the upload grammar.
    let trailing_upload_slash = segments[n - 1].is_empty() && segments[n - 2] == "uploads";
    if segments[..n - 1].iter().any(|s| s.is_empty())
        || (segments[n - 1].is_empty() && !trailing_upload_slash)
    {
        return None;
    }

    // blobs/uploads/… must be matched before the generic blobs form.
    if let Some(i) = (0..n.saturating_sub(1)).find(|&i| {
        segments[i] == "blobs" && segments[i + 1] == "uploads" && i > 0
    }) {
        let name = rewrite_name(prefix, &segments[..i].join("/"));
        let tail = segments[i..].join("/");
        return Some(Route {
            prefix: prefix.to_string(),
            upstream_path: format!("/v2/{}/{}", name, tail),
            kind: RouteKind::Upload,
            image_ref: None,
        });
    }

    if n >= 3 && segments[n - 2] == "manifests" {
        let name = rewrite_name(prefix, &segments[..n - 2].join("/"));
        let reference = segments[n - 1];
        return Some(Route {
            prefix: prefix.to_string(),
            upstream_path: format!("/v2/{}/manifests/{}", name, reference),
            kind: RouteKind::Manifest,
            image_ref: Some(format!("{}:{}", name, reference)),
        });
    }

    if n >= 3 && segments[n - 2] == "tags" && segments[n - 1] == "list" {
        let name = rewrite_name(prefix, &segments[..n - 2].join("/"));
        return Some(Route {
            prefix: prefix.to_string(),
            upstream_path: format!("/v2/{}/tags/list", name),
            kind: RouteKind::TagList,
            image_ref: None,
        });
    }

    if n >= 3 && segments[n - 2] == "blobs" {
        let name = rewrite_name(prefix, &segments[..n - 2].join("/"));
        return Some(Route {
            prefix: prefix.to_string(),
            upstream_path: format!("/v2/{}/blobs/{}", name, segments[n - 1]),
            kind: RouteKind::Blob,
            image_ref: None,
        });
    }

    Some(Route {
        prefix: prefix.to_string(),
        upstream_path: format!("/v2/{}", segments.join("/")),
        kind: RouteKind::Other,
        image_ref: None,
    })
}

/// Docker Hub resolves bare names under `library/`; mirrors of it expect
/// the expansion done for them.
fn rewrite_name(prefix: &str, name: &str) -> String {
    if prefix == DEFAULT_PREFIX && !name.contains('/') {
        format!("library/{}", name)
    } else {
        name.to_string()
    }
}

/// Compatibility shim: `GET /<name>[:<tag>]` from tooling that skips the
/// v2 surface is normalised to the matching manifest path. Returns `None`
/// when the path does not look like an image reference.
pub fn normalize_legacy(path: &str) -> Option<String> {
    let rest = path.strip_prefix('/')?;
    if rest.is_empty() || rest.starts_with("v2/") || rest == "v2" {
        return None;
    }
    if !rest
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | ':'))
    {
        return None;
    }

    let (name, tag) = match rest.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') && !tag.is_empty() => (name, tag),
        _ => (rest, "latest"),
    };
    if name.is_empty() || name.ends_with('/') {
        return None;
    }
    Some(format!("/v2/{}/manifests/{}", name, tag))
}
