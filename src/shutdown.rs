use tokio::sync::broadcast;
use tracing::info;

/// Broadcast-based shutdown signal shared by the server, the prober, and
/// the traffic writer. Cloning is cheap; every long-lived task subscribes
/// and exits when the sender fires.
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Signal every subscriber. Idempotent; later calls are no-ops for
    /// tasks that already exited.
    pub fn trigger(&self) {
        info!("Shutdown signal broadcast");
        let _ = self.tx.send(());
    }
}
