use serde::{Deserialize, Serialize};

/// Listener and admin-mount configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address the proxy listens on for both registry and admin traffic.
    pub listen_addr: String,
    /// Base path the admin API is mounted under.
    pub admin_base_path: String,
    /// Optional Prometheus exporter address; disabled when unset.
    pub metrics_addr: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            admin_base_path: "/api".to_string(),
            metrics_addr: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid listen_addr '{}': {}", self.listen_addr, e))?;
        if !self.admin_base_path.starts_with('/') || self.admin_base_path.len() < 2 {
            anyhow::bail!(
                "admin_base_path '{}' must be a non-root absolute path",
                self.admin_base_path
            );
        }
        if let Some(addr) = &self.metrics_addr {
            addr.parse::<std::net::SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid metrics_addr '{}': {}", addr, e))?;
        }
        Ok(())
    }
}
