//! Mirror catalog: the set of configured upstream registries, their
//! routing prefixes, credentials, and measured health.

pub mod prober;
pub mod registry;
pub mod scraper;
pub mod selector;

pub use prober::{HealthProber, ProbeHandle};
pub use registry::MirrorRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Routing key used when the incoming path does not start with a known prefix.
pub const DEFAULT_PREFIX: &str = "dockerhub";

/// How the proxy authenticates against an upstream registry.
///
/// `Basic` credentials are replayed when the upstream answers a 401 with a
/// Basic challenge, and attached to token-realm fetches on Bearer
/// challenges. `BearerDelegated` follows the standard registry token dance
/// anonymously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MirrorAuth {
    #[default]
    None,
    Basic {
        username: String,
        #[serde(serialize_with = "redact_password")]
        password: String,
    },
    BearerDelegated,
}

fn redact_password<S: Serializer>(_password: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("<redacted>")
}

impl MirrorAuth {
    /// Basic credentials, if configured.
    pub fn basic_credentials(&self) -> Option<(&str, &str)> {
        match self {
            MirrorAuth::Basic { username, password } => Some((username, password)),
            _ => None,
        }
    }

    /// Storage column value for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            MirrorAuth::None => "none",
            MirrorAuth::Basic { .. } => "basic",
            MirrorAuth::BearerDelegated => "bearer_delegated",
        }
    }
}

/// Probe-derived health of a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => HealthState::Healthy,
            "unhealthy" => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured upstream registry.
///
/// Config fields (prefix, URL, auth, enabled) are owned by the admin API;
/// health fields (health, latency, failures, last probe) are owned by the
/// prober. The two writers never touch each other's columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mirror {
    pub id: i64,
    /// Routing key, unique across mirrors (e.g. `dockerhub`, `ghcr`, `quay`).
    pub prefix: String,
    /// Absolute base URL: scheme + host, no trailing path.
    pub upstream_url: String,
    /// Host header the upstream expects; may differ from the URL host
    /// when the registry sits behind a CDN.
    pub upstream_host: String,
    pub auth: MirrorAuth,
    pub enabled: bool,
    pub health: HealthState,
    /// Last measured round-trip to `/v2/`, absent while unprobed or failing.
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl Mirror {
    /// Whether selection may hand this mirror out.
    pub fn selectable(&self) -> bool {
        self.enabled && self.health != HealthState::Unhealthy
    }

    /// Host portion of `upstream_url`, used when `upstream_host` was not
    /// configured explicitly.
    pub fn url_host(url: &str) -> Option<String> {
        url.parse::<hyper::Uri>()
            .ok()
            .and_then(|u| u.authority().map(|a| a.to_string()))
    }
}

/// Result of a single health probe, applied atomically by the registry.
#[derive(Debug, Clone, Copy)]
pub enum ProbeOutcome {
    /// Upstream answered 200 or 401 within the deadline.
    Success { latency_ms: u64 },
    /// Network error, timeout, or an unexpected status.
    Failure,
}
