use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{HealthState, Mirror, ProbeOutcome};

/// In-memory authoritative catalog of mirrors.
///
/// Rebuilt from the store at startup and after every admin mutation via
/// [`replace_all`](MirrorRegistry::replace_all). Selection order per prefix
/// is precomputed on every write so the hot path answers "best upstream for
/// prefix P" without sorting.
#[derive(Clone, Default)]
pub struct MirrorRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    mirrors: Vec<Mirror>,
    /// Per prefix, indices into `mirrors` ranked best-first, selectable only.
    ranked: HashMap<String, Vec<usize>>,
}

impl RegistryState {
    fn rebuild_ranking(&mut self) {
        self.ranked.clear();
        for (idx, mirror) in self.mirrors.iter().enumerate() {
            if mirror.selectable() {
                self.ranked
                    .entry(mirror.prefix.clone())
                    .or_default()
                    .push(idx);
            }
        }
        let mirrors = &self.mirrors;
        for indices in self.ranked.values_mut() {
            // Unprobed mirrors go last; ties break on smallest id for
            // deterministic selection.
            indices.sort_by_key(|&i| (mirrors[i].latency_ms.unwrap_or(u64::MAX), mirrors[i].id));
        }
    }
}

impl MirrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole catalog, e.g. after a reload from the store.
    pub async fn replace_all(&self, mirrors: Vec<Mirror>) {
        let mut state = self.inner.write().await;
        state.mirrors = mirrors;
        state.rebuild_ranking();
        debug!("Mirror registry rebuilt with {} mirrors", state.mirrors.len());
    }

    /// Every configured mirror, selectable or not.
    pub async fn all(&self) -> Vec<Mirror> {
        self.inner.read().await.mirrors.clone()
    }

    /// Prefixes the router recognizes in incoming paths. Includes disabled
    /// mirrors so their traffic does not silently fall through to the
    /// default upstream.
    pub async fn known_prefixes(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .mirrors
            .iter()
            .map(|m| m.prefix.clone())
            .collect()
    }

    pub async fn get_by_prefix(&self, prefix: &str) -> Option<Mirror> {
        self.inner
            .read()
            .await
            .mirrors
            .iter()
            .find(|m| m.prefix == prefix)
            .cloned()
    }

    pub async fn get_by_id(&self, id: i64) -> Option<Mirror> {
        self.inner
            .read()
            .await
            .mirrors
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Mirrors for a prefix, best-first.
    ///
    /// With `only_enabled_healthy` (the hot-path mode) the precomputed
    /// ranking is returned: ascending latency, unprobed last, unhealthy and
    /// disabled mirrors excluded. Otherwise all mirrors for the prefix are
    /// returned in the same order policy without the exclusions.
    pub async fn list_by_prefix(&self, prefix: &str, only_enabled_healthy: bool) -> Vec<Mirror> {
        let state = self.inner.read().await;
        if only_enabled_healthy {
            state
                .ranked
                .get(prefix)
                .map(|indices| indices.iter().map(|&i| state.mirrors[i].clone()).collect())
                .unwrap_or_default()
        } else {
            let mut mirrors: Vec<Mirror> = state
                .mirrors
                .iter()
                .filter(|m| m.prefix == prefix)
                .cloned()
                .collect();
            mirrors.sort_by_key(|m| (m.latency_ms.unwrap_or(u64::MAX), m.id));
            mirrors
        }
    }

    /// Apply a probe result. The prober is the only caller; config fields
    /// are never touched here.
    ///
    /// Returns the updated mirror, or `None` when the id is gone (deleted
    /// while the probe was in flight).
    pub async fn update_health(&self, id: i64, outcome: ProbeOutcome) -> Option<Mirror> {
        let mut state = self.inner.write().await;
        let mirror = state.mirrors.iter_mut().find(|m| m.id == id)?;

        match outcome {
            ProbeOutcome::Success { latency_ms } => {
                if mirror.health == HealthState::Unhealthy {
                    debug!(
                        "Mirror '{}' recovered ({} ms), back in rotation",
                        mirror.prefix, latency_ms
                    );
                }
                mirror.health = HealthState::Healthy;
                mirror.latency_ms = Some(latency_ms);
                mirror.consecutive_failures = 0;
            }
            ProbeOutcome::Failure => {
                mirror.consecutive_failures = mirror.consecutive_failures.saturating_add(1);
                if mirror.health != HealthState::Unhealthy {
                    warn!(
                        "Mirror '{}' failed probe ({} consecutive), excluding from selection",
                        mirror.prefix, mirror.consecutive_failures
                    );
                }
                mirror.health = HealthState::Unhealthy;
                mirror.latency_ms = None;
            }
        }
        mirror.last_probe_at = Some(chrono::Utc::now());

        let updated = mirror.clone();
        state.rebuild_ranking();
        Some(updated)
    }
}
