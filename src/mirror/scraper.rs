use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::mirror::{MirrorRegistry, ProbeHandle, DEFAULT_PREFIX};
use crate::store::{NewMirror, Store};

/// Entry shape of the third-party mirror status page. The feed is volatile;
/// unknown fields are ignored and missing ones get defaults.
#[derive(Debug, Deserialize)]
struct ScrapedEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    tags: Vec<ScrapedTag>,
}

#[derive(Debug, Deserialize)]
struct ScrapedTag {
    #[serde(default)]
    name: String,
}

/// Tags marking mirrors we must not route through: paid, intranet-only,
/// or login-required.
const EXCLUDED_TAGS: &[&str] = &["付费", "内网", "需登陆"];

/// Imports public Docker Hub mirrors from a configured status feed.
///
/// New URLs are stored as additional `dockerhub`-prefix mirrors (anonymous
/// auth) and a probe round is triggered so they earn a latency before the
/// selector can pick them.
pub struct MirrorScraper {
    store: Store,
    registry: MirrorRegistry,
    probe: ProbeHandle,
    client: Client,
    source_url: String,
}

impl MirrorScraper {
    pub fn new(
        store: Store,
        registry: MirrorRegistry,
        probe: ProbeHandle,
        source_url: String,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            store,
            registry,
            probe,
            client,
            source_url,
        }
    }

    /// One scrape round: fetch, filter, insert unseen mirrors, reprobe.
    /// Parse failures abort the round without touching existing mirrors.
    pub async fn run_once(&self) -> ProxyResult<usize> {
        info!("Scraping mirror list from {}", self.source_url);

        let response = self
            .client
            .get(&self.source_url)
            .send()
            .await
            .map_err(|e| ProxyError::internal(format!("scrape fetch: {}", e)))?;
        if !response.status().is_success() {
            return Err(ProxyError::internal(format!(
                "scrape source returned {}",
                response.status()
            )));
        }
        let entries: Vec<ScrapedEntry> = response
            .json()
            .await
            .map_err(|e| ProxyError::internal(format!("scrape parse: {}", e)))?;

        let existing: HashSet<String> = self
            .registry
            .all()
            .await
            .into_iter()
            .map(|m| m.upstream_url)
            .collect();

        let mut added = 0usize;
        let mut seen_this_round = existing;
        for entry in entries {
            let Some(url) = entry.url.as_deref() else {
                continue;
            };
            if entry
                .tags
                .iter()
                .any(|t| EXCLUDED_TAGS.iter().any(|ex| t.name.contains(ex)))
            {
                debug!("Skipping tagged mirror {:?}", entry.name);
                continue;
            }

            let url = url.trim_end_matches('/').to_string();
            if !url.starts_with("http") || !seen_this_round.insert(url.clone()) {
                continue;
            }

            let host = match crate::mirror::Mirror::url_host(&url) {
                Some(host) => host,
                None => {
                    debug!("Skipping unparseable mirror URL {}", url);
                    continue;
                }
            };

            let new = NewMirror {
                prefix: DEFAULT_PREFIX.to_string(),
                upstream_url: url,
                upstream_host: host,
                auth: crate::mirror::MirrorAuth::None,
            };
            match self.store.insert_mirror(&new).await {
                Ok(_) => added += 1,
                Err(e) => warn!("Failed to store scraped mirror: {}", e),
            }
        }

        if added > 0 {
            let mirrors = self.store.load_mirrors().await?;
            self.registry.replace_all(mirrors).await;
            self.probe.trigger();
        }
        info!("Scrape round added {} mirrors", added);
        Ok(added)
    }
}
