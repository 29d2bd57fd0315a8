use serde::{Deserialize, Serialize};

/// Traffic accounting pipeline tuning.
///
/// Accounting is best-effort: when the queue is full the oldest record is
/// dropped and counted, and the request path moves on.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficConfig {
    /// Bounded queue between the streaming hot path and the store writer.
    pub queue_size: usize,
    /// Records written per batch.
    pub batch_size: usize,
    /// Longest a record may sit in the queue before a flush.
    pub flush_interval_ms: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            batch_size: 100,
            flush_interval_ms: 1000,
        }
    }
}

impl TrafficConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_size == 0 || self.batch_size == 0 {
            anyhow::bail!("traffic.queue_size and traffic.batch_size must be positive");
        }
        Ok(())
    }
}
