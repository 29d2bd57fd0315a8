use crate::error::{ProxyError, ProxyResult};
use crate::mirror::{Mirror, MirrorRegistry};

/// Best live upstream for a route prefix.
///
/// Thin, pure policy over the registry's ranked view: the head of
/// `list_by_prefix` is the answer, and an empty list is `NoUpstream`
/// (mapped to 503 by the proxy).
pub async fn select(registry: &MirrorRegistry, prefix: &str) -> ProxyResult<Mirror> {
    candidates(registry, prefix)
        .await
        .map(|mut list| list.remove(0))
}

/// All live upstreams for a prefix, best-first. The proxy walks this list
/// when failing over before the first body byte.
pub async fn candidates(registry: &MirrorRegistry, prefix: &str) -> ProxyResult<Vec<Mirror>> {
    let list = registry.list_by_prefix(prefix, true).await;
    if list.is_empty() {
        return Err(ProxyError::no_upstream(prefix));
    }
    Ok(list)
}
