use serde::{Deserialize, Serialize};

/// Health probe scheduling.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    /// Seconds between probe rounds.
    pub interval_secs: u64,
    /// Hard per-probe deadline; a slower mirror counts as failed.
    pub timeout_secs: u64,
    /// Upper bound of the random delay added to each round so a fleet of
    /// proxies does not probe in lockstep.
    pub jitter_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            timeout_secs: 10,
            jitter_secs: 0,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_secs == 0 {
            anyhow::bail!("probe.interval_secs must be positive");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("probe.timeout_secs must be positive");
        }
        Ok(())
    }
}
