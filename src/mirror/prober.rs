use rand::Rng;
use reqwest::Client;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::mirror::{Mirror, MirrorRegistry, ProbeOutcome};
use crate::shutdown::Shutdown;
use crate::store::Store;

/// On-demand trigger for a probe round, handed to the admin API.
#[derive(Clone, Default)]
pub struct ProbeHandle {
    notify: Arc<Notify>,
}

impl ProbeHandle {
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

/// Periodic health prober.
///
/// Every interval (and on demand) issues `GET <upstream_url>/v2/` against
/// each enabled mirror with a hard timeout. 200 and 401 both prove a
/// reachable registry; anything else counts as a failure and takes the
/// mirror out of rotation until a later probe succeeds. Probes run
/// concurrently across mirrors with at most one in flight per mirror.
pub struct HealthProber {
    registry: MirrorRegistry,
    store: Store,
    client: Client,
    config: ProbeConfig,
    handle: ProbeHandle,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl HealthProber {
    pub fn new(registry: MirrorRegistry, store: Store, config: ProbeConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .unwrap_or_default();

        Self {
            registry,
            store,
            client,
            config,
            handle: ProbeHandle::default(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn handle(&self) -> ProbeHandle {
        self.handle.clone()
    }

    /// Scheduler loop. Runs one immediate round so selection has latencies
    /// before the first interval elapses, then ticks until shutdown.
    pub async fn run(self, shutdown: Shutdown) {
        let mut shutdown_rx = shutdown.subscribe();
        let interval = Duration::from_secs(self.config.interval_secs.max(1));

        info!(
            "Health prober started (interval {}s, timeout {}s)",
            self.config.interval_secs, self.config.timeout_secs
        );
        self.probe_all().await;

        loop {
            let jitter = if self.config.jitter_secs > 0 {
                Duration::from_secs(rand::thread_rng().gen_range(0..=self.config.jitter_secs))
            } else {
                Duration::ZERO
            };

            tokio::select! {
                _ = tokio::time::sleep(interval + jitter) => {
                    self.probe_all().await;
                }
                _ = self.handle.notify.notified() => {
                    debug!("On-demand probe round requested");
                    self.probe_all().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Health prober stopping");
                    return;
                }
            }
        }
    }

    /// Probe every enabled mirror concurrently and apply the outcomes.
    pub async fn probe_all(&self) {
        let mirrors: Vec<Mirror> = self
            .registry
            .all()
            .await
            .into_iter()
            .filter(|m| m.enabled)
            .collect();

        if mirrors.is_empty() {
            debug!("No enabled mirrors to probe");
            return;
        }

        let mut tasks = JoinSet::new();
        for mirror in mirrors {
            // One probe in flight per mirror; a slow probe must not stack
            // behind an on-demand round.
            {
                let mut guard = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if !guard.insert(mirror.id) {
                    debug!("Probe already in flight for '{}', skipping", mirror.prefix);
                    continue;
                }
            }

            let client = self.client.clone();
            let in_flight = Arc::clone(&self.in_flight);
            tasks.spawn(async move {
                let outcome = probe_one(&client, &mirror).await;
                in_flight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&mirror.id);
                (mirror.id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((id, outcome)) = joined else { continue };
            if matches!(outcome, ProbeOutcome::Failure) {
                metrics::counter!("mirrorgate_probe_failures_total").increment(1);
            }
            if let Some(updated) = self.registry.update_health(id, outcome).await {
                if let Err(e) = self.store.record_probe(&updated).await {
                    warn!("Failed to persist probe result for mirror {}: {}", id, e);
                }
            }
        }
        debug!("Probe round complete");
    }
}

/// Probe a single mirror's v2 ping endpoint.
///
/// 401 is the expected answer from auth-required registries and still
/// proves reachability; only the wall clock of the request is recorded.
async fn probe_one(client: &Client, mirror: &Mirror) -> ProbeOutcome {
    let url = format!("{}/v2/", mirror.upstream_url.trim_end_matches('/'));
    let start = Instant::now();

    match client
        .get(&url)
        .header(reqwest::header::HOST, mirror.upstream_host.clone())
        .send()
        .await
    {
        Ok(response) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            let status = response.status();
            if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::UNAUTHORIZED {
                debug!(
                    "Probe '{}' ok: {} in {} ms",
                    mirror.prefix, status, latency_ms
                );
                ProbeOutcome::Success { latency_ms }
            } else {
                debug!("Probe '{}' unexpected status {}", mirror.prefix, status);
                ProbeOutcome::Failure
            }
        }
        Err(e) => {
            debug!("Probe '{}' failed: {}", mirror.prefix, e);
            ProbeOutcome::Failure
        }
    }
}
