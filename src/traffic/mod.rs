//! Traffic accounting: per-request records and the best-effort pipeline
//! that lands them in the store.

pub mod recorder;

pub use recorder::{RequestMeta, TrafficRecorder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a proxied response stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordOutcome {
    /// Upstream body relayed to the last byte.
    Complete,
    /// Client hung up while we were still writing.
    ClientAbort,
    /// Upstream died mid-stream or before usable headers.
    UpstreamAbort,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Complete => "complete",
            RecordOutcome::ClientAbort => "client-abort",
            RecordOutcome::UpstreamAbort => "upstream-abort",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "client-abort" => RecordOutcome::ClientAbort,
            "upstream-abort" => RecordOutcome::UpstreamAbort,
            _ => RecordOutcome::Complete,
        }
    }
}

/// Append-only accounting row, one per proxied request attempt.
/// Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub ts: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub mirror_id: Option<i64>,
    /// Absent when the attempt died before upstream headers arrived.
    pub upstream_status: Option<u16>,
    pub bytes_out: u64,
    pub duration_ms: i64,
    /// `name:reference` for manifest requests, the pull-history key.
    pub image_ref: Option<String>,
    pub outcome: RecordOutcome,
}

/// Aggregate numbers served by the admin stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrafficSummary {
    pub total_requests: i64,
    pub total_bytes: i64,
    pub per_mirror: Vec<MirrorTraffic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorTraffic {
    pub id: i64,
    pub requests: i64,
    pub bytes: i64,
}
