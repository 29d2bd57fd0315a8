//! Embedded SQLite store: mirror configuration and the append-only
//! traffic log. The in-memory registry is rebuilt from here after every
//! admin mutation; the proxy hot path never queries the store directly.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::crypto::CredentialCipher;
use crate::error::ProxyResult;
use crate::mirror::{HealthState, Mirror, MirrorAuth};
use crate::traffic::{MirrorTraffic, RecordOutcome, TrafficRecord, TrafficSummary};

/// Input for mirror creation (admin API and scraper).
#[derive(Debug, Clone, Deserialize)]
pub struct NewMirror {
    pub prefix: String,
    pub upstream_url: String,
    #[serde(default)]
    pub upstream_host: String,
    #[serde(default)]
    pub auth: MirrorAuth,
}

/// Partial mirror update; absent fields keep their stored values.
/// Health fields are not patchable, they belong to the prober.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MirrorPatch {
    pub prefix: Option<String>,
    pub upstream_url: Option<String>,
    pub upstream_host: Option<String>,
    pub auth: Option<MirrorAuth>,
    pub enabled: Option<bool>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    cipher: Arc<CredentialCipher>,
}

impl Store {
    /// Open (or create) the database under `data_dir` and run the schema.
    pub async fn open(data_dir: &str, cipher: CredentialCipher) -> ProxyResult<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = Path::new(data_dir).join("mirrorgate.db");

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            cipher: Arc::new(cipher),
        };
        store.create_tables().await?;
        info!("Store opened at {:?}", db_path);
        Ok(store)
    }

    #[cfg(test)]
    pub async fn open_in_memory(cipher: CredentialCipher) -> ProxyResult<Self> {
        let options: SqliteConnectOptions = "sqlite::memory:".parse()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            cipher: Arc::new(cipher),
        };
        store.create_tables().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> ProxyResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mirrors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prefix TEXT NOT NULL,
                upstream_url TEXT NOT NULL,
                upstream_host TEXT NOT NULL,
                auth_kind TEXT NOT NULL DEFAULT 'none',
                auth_user TEXT,
                auth_pass_encrypted TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                health TEXT NOT NULL DEFAULT 'unknown',
                latency_ms INTEGER,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_probe_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traffic (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts DATETIME NOT NULL,
                client_ip TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                mirror_id INTEGER,
                upstream_status INTEGER,
                bytes_out INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                image_ref TEXT,
                outcome TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_traffic_ts ON traffic(ts)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mirrors_prefix ON mirrors(prefix)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ---- mirrors ----

    pub async fn load_mirrors(&self) -> ProxyResult<Vec<Mirror>> {
        let rows = sqlx::query("SELECT * FROM mirrors ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| self.row_to_mirror(row)).collect())
    }

    pub async fn count_mirrors(&self) -> ProxyResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM mirrors")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn insert_mirror(&self, new: &NewMirror) -> ProxyResult<Mirror> {
        let upstream_host = if new.upstream_host.is_empty() {
            Mirror::url_host(&new.upstream_url).unwrap_or_default()
        } else {
            new.upstream_host.clone()
        };
        let (auth_user, auth_pass) = self.encrypt_auth(&new.auth)?;

        let result = sqlx::query(
            r#"
            INSERT INTO mirrors (prefix, upstream_url, upstream_host, auth_kind, auth_user, auth_pass_encrypted)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.prefix)
        .bind(new.upstream_url.trim_end_matches('/'))
        .bind(&upstream_host)
        .bind(new.auth.kind())
        .bind(&auth_user)
        .bind(&auth_pass)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        Ok(Mirror {
            id,
            prefix: new.prefix.clone(),
            upstream_url: new.upstream_url.trim_end_matches('/').to_string(),
            upstream_host,
            auth: new.auth.clone(),
            enabled: true,
            health: HealthState::Unknown,
            latency_ms: None,
            consecutive_failures: 0,
            last_probe_at: None,
        })
    }

    /// Apply a partial config update. Returns the merged mirror, or `None`
    /// for an unknown id. Health columns are left untouched, so repeating
    /// the same patch converges to the same row.
    pub async fn update_mirror(&self, id: i64, patch: &MirrorPatch) -> ProxyResult<Option<Mirror>> {
        let Some(current) = self.get_mirror(id).await? else {
            return Ok(None);
        };

        let prefix = patch.prefix.clone().unwrap_or(current.prefix);
        let upstream_url = patch
            .upstream_url
            .clone()
            .unwrap_or(current.upstream_url)
            .trim_end_matches('/')
            .to_string();
        let upstream_host = match &patch.upstream_host {
            Some(host) => host.clone(),
            None if patch.upstream_url.is_some() => {
                Mirror::url_host(&upstream_url).unwrap_or(current.upstream_host)
            }
            None => current.upstream_host,
        };
        let auth = patch.auth.clone().unwrap_or(current.auth);
        let enabled = patch.enabled.unwrap_or(current.enabled);
        let (auth_user, auth_pass) = self.encrypt_auth(&auth)?;

        sqlx::query(
            r#"
            UPDATE mirrors
            SET prefix = ?, upstream_url = ?, upstream_host = ?,
                auth_kind = ?, auth_user = ?, auth_pass_encrypted = ?, enabled = ?
            WHERE id = ?
            "#,
        )
        .bind(&prefix)
        .bind(&upstream_url)
        .bind(&upstream_host)
        .bind(auth.kind())
        .bind(&auth_user)
        .bind(&auth_pass)
        .bind(enabled)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get_mirror(id).await
    }

    pub async fn get_mirror(&self, id: i64) -> ProxyResult<Option<Mirror>> {
        let row = sqlx::query("SELECT * FROM mirrors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| self.row_to_mirror(&r)))
    }

    pub async fn delete_mirror(&self, id: i64) -> ProxyResult<bool> {
        let result = sqlx::query("DELETE FROM mirrors WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn toggle_mirror(&self, id: i64) -> ProxyResult<Option<Mirror>> {
        sqlx::query("UPDATE mirrors SET enabled = NOT enabled WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get_mirror(id).await
    }

    /// Persist a probe outcome. Only health columns move here; config
    /// columns belong to the admin API.
    pub async fn record_probe(&self, mirror: &Mirror) -> ProxyResult<()> {
        sqlx::query(
            r#"
            UPDATE mirrors
            SET health = ?, latency_ms = ?, consecutive_failures = ?, last_probe_at = ?
            WHERE id = ?
            "#,
        )
        .bind(mirror.health.as_str())
        .bind(mirror.latency_ms.map(|v| v as i64))
        .bind(mirror.consecutive_failures as i64)
        .bind(mirror.last_probe_at)
        .bind(mirror.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn encrypt_auth(&self, auth: &MirrorAuth) -> ProxyResult<(Option<String>, Option<String>)> {
        match auth {
            MirrorAuth::Basic { username, password } => Ok((
                Some(username.clone()),
                Some(self.cipher.encrypt(password)?),
            )),
            _ => Ok((None, None)),
        }
    }

    fn row_to_mirror(&self, row: &sqlx::sqlite::SqliteRow) -> Mirror {
        let auth_kind: String = row.get("auth_kind");
        let auth = match auth_kind.as_str() {
            "basic" => {
                let username: Option<String> = row.get("auth_user");
                let encrypted: Option<String> = row.get("auth_pass_encrypted");
                match (username, encrypted.map(|e| self.cipher.decrypt(&e))) {
                    (Some(username), Some(Ok(password))) => MirrorAuth::Basic { username, password },
                    (_, Some(Err(e))) => {
                        warn!("Dropping undecryptable credentials for mirror row: {}", e);
                        MirrorAuth::None
                    }
                    _ => MirrorAuth::None,
                }
            }
            "bearer_delegated" => MirrorAuth::BearerDelegated,
            _ => MirrorAuth::None,
        };

        let health: String = row.get("health");
        let latency_ms: Option<i64> = row.get("latency_ms");
        Mirror {
            id: row.get("id"),
            prefix: row.get("prefix"),
            upstream_url: row.get("upstream_url"),
            upstream_host: row.get("upstream_host"),
            auth,
            enabled: row.get("enabled"),
            health: HealthState::parse(&health),
            latency_ms: latency_ms.map(|v| v as u64),
            consecutive_failures: row.get::<i64, _>("consecutive_failures") as u32,
            last_probe_at: row.get("last_probe_at"),
        }
    }

    // ---- traffic ----

    pub async fn insert_traffic_batch(&self, records: &[TrafficRecord]) -> ProxyResult<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO traffic
                    (ts, client_ip, method, path, mirror_id, upstream_status,
                     bytes_out, duration_ms, image_ref, outcome)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.ts)
            .bind(&record.client_ip)
            .bind(&record.method)
            .bind(&record.path)
            .bind(record.mirror_id)
            .bind(record.upstream_status.map(|s| s as i64))
            .bind(record.bytes_out as i64)
            .bind(record.duration_ms)
            .bind(&record.image_ref)
            .bind(record.outcome.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn traffic_summary(&self) -> ProxyResult<TrafficSummary> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS requests, COALESCE(SUM(bytes_out), 0) AS bytes FROM traffic",
        )
        .fetch_one(&self.pool)
        .await?;

        let per_mirror_rows = sqlx::query(
            r#"
            SELECT mirror_id, COUNT(*) AS requests, COALESCE(SUM(bytes_out), 0) AS bytes
            FROM traffic
            WHERE mirror_id IS NOT NULL
            GROUP BY mirror_id
            ORDER BY bytes DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(TrafficSummary {
            total_requests: totals.get("requests"),
            total_bytes: totals.get("bytes"),
            per_mirror: per_mirror_rows
                .iter()
                .map(|row| MirrorTraffic {
                    id: row.get("mirror_id"),
                    requests: row.get("requests"),
                    bytes: row.get("bytes"),
                })
                .collect(),
        })
    }

    pub async fn traffic_history(&self, limit: i64) -> ProxyResult<Vec<TrafficRecord>> {
        let rows = sqlx::query("SELECT * FROM traffic ORDER BY ts DESC, id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let ts: DateTime<Utc> = row.get("ts");
                let outcome: String = row.get("outcome");
                TrafficRecord {
                    ts,
                    client_ip: row.get("client_ip"),
                    method: row.get("method"),
                    path: row.get("path"),
                    mirror_id: row.get("mirror_id"),
                    upstream_status: row
                        .get::<Option<i64>, _>("upstream_status")
                        .map(|s| s as u16),
                    bytes_out: row.get::<i64, _>("bytes_out") as u64,
                    duration_ms: row.get("duration_ms"),
                    image_ref: row.get("image_ref"),
                    outcome: RecordOutcome::parse(&outcome),
                }
            })
            .collect())
    }
}
