use chrono::{DateTime, Utc};
use hyper::body::HttpBody as _;
use hyper::Body;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{RecordOutcome, TrafficRecord};
use crate::config::TrafficConfig;
use crate::shutdown::Shutdown;
use crate::store::Store;

/// Everything known about a request before its body starts streaming.
/// Turned into a [`TrafficRecord`] when the stream settles.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub ts: DateTime<Utc>,
    pub started: Instant,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub mirror_id: Option<i64>,
    pub upstream_status: Option<u16>,
    pub image_ref: Option<String>,
}

impl RequestMeta {
    pub fn into_record(self, bytes_out: u64, outcome: RecordOutcome) -> TrafficRecord {
        TrafficRecord {
            ts: self.ts,
            client_ip: self.client_ip,
            method: self.method,
            path: self.path,
            mirror_id: self.mirror_id,
            upstream_status: self.upstream_status,
            bytes_out,
            duration_ms: self.started.elapsed().as_millis() as i64,
            image_ref: self.image_ref,
            outcome,
        }
    }
}

/// Best-effort accounting pipeline.
///
/// The hot path pushes into a bounded in-memory queue under a plain mutex
/// (no await points while held); a single background writer drains it into
/// the store in batches. A full queue sheds its oldest record with a
/// counter bump instead of blocking the stream.
#[derive(Clone)]
pub struct TrafficRecorder {
    queue: Arc<Mutex<VecDeque<TrafficRecord>>>,
    notify: Arc<Notify>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
    stream_idle_timeout: Duration,
}

impl TrafficRecorder {
    pub fn new(config: &TrafficConfig, stream_idle_timeout: Duration) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::with_capacity(config.queue_size))),
            notify: Arc::new(Notify::new()),
            capacity: config.queue_size,
            dropped: Arc::new(AtomicU64::new(0)),
            stream_idle_timeout,
        }
    }

    /// Enqueue a finished record. Never blocks and never fails.
    pub fn submit(&self, record: TrafficRecord) {
        {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("mirrorgate_traffic_queue_dropped_total").increment(1);
            }
            queue.push_back(record);
        }
        self.notify.notify_one();
    }

    /// Records shed so far because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn queued_count(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Wrap an upstream body into a client body, counting every relayed
    /// byte. The pump task emits the traffic record when the stream
    /// completes, the client hangs up, or the upstream dies; dropping the
    /// upstream body on the way out cancels the upstream request.
    pub fn relay(&self, mut upstream: Body, meta: RequestMeta) -> Body {
        let (mut tx, client_body) = Body::channel();
        let recorder = self.clone();
        let idle = self.stream_idle_timeout;

        tokio::spawn(async move {
            let mut bytes_out: u64 = 0;
            let outcome = loop {
                match tokio::time::timeout(idle, upstream.data()).await {
                    Ok(Some(Ok(chunk))) => {
                        bytes_out += chunk.len() as u64;
                        metrics::counter!("mirrorgate_bytes_out_total")
                            .increment(chunk.len() as u64);
                        if tx.send_data(chunk).await.is_err() {
                            debug!("Client went away mid-stream after {} bytes", bytes_out);
                            break RecordOutcome::ClientAbort;
                        }
                    }
                    Ok(Some(Err(e))) => {
                        warn!("Upstream stream error after {} bytes: {}", bytes_out, e);
                        tx.abort();
                        break RecordOutcome::UpstreamAbort;
                    }
                    Ok(None) => break RecordOutcome::Complete,
                    Err(_) => {
                        warn!("Upstream stream idle for {:?}, dropping", idle);
                        tx.abort();
                        break RecordOutcome::UpstreamAbort;
                    }
                }
            };
            recorder.submit(meta.into_record(bytes_out, outcome));
        });

        client_body
    }

    /// Background writer: drains the queue into the store in batches of at
    /// most `batch_size`, at least every flush interval. Runs a final drain
    /// on shutdown; the returned handle resolves once that drain is done.
    pub fn spawn_writer(
        &self,
        store: Store,
        config: TrafficConfig,
        shutdown: Shutdown,
    ) -> tokio::task::JoinHandle<()> {
        let recorder = self.clone();
        let flush_interval = Duration::from_millis(config.flush_interval_ms.max(1));
        let batch_size = config.batch_size;

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = recorder.notify.notified() => {}
                    _ = tokio::time::sleep(flush_interval) => {}
                    _ = shutdown_rx.recv() => {
                        recorder.flush_all(&store, batch_size).await;
                        debug!("Traffic writer stopped");
                        return;
                    }
                }
                recorder.flush_once(&store, batch_size).await;
            }
        })
    }

    async fn flush_once(&self, store: &Store, batch_size: usize) {
        let batch: Vec<TrafficRecord> = {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let take = queue.len().min(batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }
        if let Err(e) = store.insert_traffic_batch(&batch).await {
            warn!("Failed to write {} traffic records: {}", batch.len(), e);
        }
    }

    async fn flush_all(&self, store: &Store, batch_size: usize) {
        loop {
            let remaining = {
                let queue = self
                    .queue
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                queue.len()
            };
            if remaining == 0 {
                return;
            }
            self.flush_once(store, batch_size).await;
        }
    }
}
