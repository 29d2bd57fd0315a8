use lru::LruCache;
use reqwest::Client;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::mirror::Mirror;

/// Registries that omit `expires_in` issue tokens good for at least this.
const DEFAULT_EXPIRES_IN_SECS: u64 = 60;
/// A token is treated as expired this long before it actually is, so a
/// token handed out now survives the request it authorizes.
const EXPIRY_SAFETY_MARGIN_SECS: u64 = 30;
const CACHE_CAPACITY: usize = 4096;
const REALM_FETCH_TIMEOUT_SECS: u64 = 10;

/// Cache key: one token per mirror and scope.
type TokenKey = (i64, String);

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Obtains and caches Bearer tokens from upstream auth services.
///
/// The cache is bounded LRU; concurrent misses for the same key collapse
/// into a single realm fetch through a per-key guard, so a burst of 401s
/// on a cold cache does not stampede the auth service.
#[derive(Clone)]
pub struct TokenBroker {
    cache: Arc<Mutex<LruCache<TokenKey, CachedToken>>>,
    inflight: Arc<tokio::sync::Mutex<HashMap<TokenKey, Arc<tokio::sync::Mutex<()>>>>>,
    client: Client,
}

impl Default for TokenBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBroker {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity");
        let client = Client::builder()
            .timeout(Duration::from_secs(REALM_FETCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
            inflight: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            client,
        }
    }

    /// Bearer token for `(mirror, scope)`, from cache or the realm.
    pub async fn token(
        &self,
        mirror: &Mirror,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
    ) -> ProxyResult<String> {
        let key: TokenKey = (mirror.id, scope.unwrap_or_default().to_string());

        if let Some(token) = self.cached(&key) {
            return Ok(token);
        }

        // Single flight: first caller for this key fetches, the rest wait
        // on the guard and then hit the cache.
        let guard = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(inflight.entry(key.clone()).or_default())
        };
        let _held = guard.lock().await;

        if let Some(token) = self.cached(&key) {
            debug!("Token for {:?} resolved by a concurrent fetch", key);
            return Ok(token);
        }

        let fetched = self.fetch(mirror, realm, service, scope).await;
        if let Ok((token, expires_in)) = &fetched {
            let ttl = expires_in.saturating_sub(EXPIRY_SAFETY_MARGIN_SECS);
            let mut cache = self
                .cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cache.put(
                key.clone(),
                CachedToken {
                    token: token.clone(),
                    expires_at: Instant::now() + Duration::from_secs(ttl),
                },
            );
        }
        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&key);
        }
        fetched.map(|(token, _)| token)
    }

    fn cached(&self, key: &TokenKey) -> Option<String> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.token.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    /// `GET realm?service=S&scope=Sc`, with the mirror's Basic credentials
    /// when it has any. Returns the token and its advertised lifetime.
    async fn fetch(
        &self,
        mirror: &Mirror,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
    ) -> ProxyResult<(String, u64)> {
        metrics::counter!("mirrorgate_token_fetches_total").increment(1);

        let mut request = self.client.get(realm);
        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = service {
            params.push(("service", service));
        }
        if let Some(scope) = scope {
            params.push(("scope", scope));
        }
        request = request.query(&params);
        if let Some((user, pass)) = mirror.auth.basic_credentials() {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await.map_err(|e| {
            warn!("Token realm {} unreachable: {}", realm, e);
            ProxyError::auth_failure(format!("realm unreachable: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!("Token realm {} answered {}", realm, status);
            return Err(ProxyError::auth_failure(format!(
                "realm rejected token request: {}",
                status
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProxyError::auth_failure(format!("malformed token response: {}", e)))?;

        // Docker Hub and most registries answer `token`; GHCR and friends
        // use `access_token`.
        let token = body
            .get("token")
            .and_then(|t| t.as_str())
            .or_else(|| body.get("access_token").and_then(|t| t.as_str()))
            .ok_or_else(|| ProxyError::auth_failure("token response carries no token"))?
            .to_string();

        let expires_in = body
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);

        debug!(
            "Fetched token for mirror '{}' scope {:?} (expires in {}s)",
            mirror.prefix, scope, expires_in
        );
        Ok((token, expires_in))
    }

    #[cfg(test)]
    pub fn insert_for_test(&self, mirror_id: i64, scope: &str, token: &str, ttl: Duration) {
        let mut cache = self.cache.lock().unwrap();
        cache.put(
            (mirror_id, scope.to_string()),
            CachedToken {
                token: token.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    #[cfg(test)]
    pub fn cached_for_test(&self, mirror_id: i64, scope: &str) -> Option<String> {
        self.cached(&(mirror_id, scope.to_string()))
    }
}
