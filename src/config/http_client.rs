use serde::{Deserialize, Serialize};

/// Upstream HTTP client tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpClientConfig {
    /// Idle connections kept per upstream host.
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_secs: u64,
    /// TCP connect deadline.
    pub connect_timeout_secs: u64,
    /// Deadline for upstream response headers.
    pub header_timeout_secs: u64,
    /// Maximum gap between body chunks while streaming; the total request
    /// has no cap (blobs run to gigabytes).
    pub stream_idle_timeout_secs: u64,
    /// Redirect budget for blob downloads bouncing to object-storage CDNs.
    pub max_redirects: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 32,
            pool_idle_timeout_secs: 90,
            connect_timeout_secs: 5,
            header_timeout_secs: 10,
            stream_idle_timeout_secs: 60,
            max_redirects: 5,
        }
    }
}
