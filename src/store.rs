//! Durable state store. A single SQLite file owns every persistent entity:
//! requests, responses, the status-transition audit trail, cache entries,
//! api keys, and cost samples. All access goes through `spawn_blocking` so
//! the async runtime never blocks on the database.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::OptionalExtension;
use thiserror::Error;

use crate::types::{
    now_millis, ApiKeyRecord, BackendKind, CostSample, ErrorKind, KeyStatus, RequestRecord,
    RequestStatus, ResponseRecord, TokenUsage,
};

const SCHEMA_VERSION: i64 = 1;

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("request already exists: {id}")]
    DuplicateRequest { id: String },
    #[error("request not found: {id}")]
    NotFound { id: String },
    #[error("status conflict on {id}: expected {expected:?}, found {actual:?}")]
    Conflict {
        id: String,
        expected: RequestStatus,
        actual: RequestStatus,
    },
}

#[derive(Clone, Debug, Default)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub provider: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Clone, Debug)]
pub struct TransitionRow {
    pub request_id: String,
    pub from_status: RequestStatus,
    pub to_status: RequestStatus,
    pub note: Option<String>,
    pub ts_ms: u64,
}

#[derive(Clone, Debug)]
pub struct CacheRow {
    pub fingerprint: String,
    pub text: String,
    pub thinking: Option<String>,
    pub tokens: TokenUsage,
    pub provider_used: String,
    pub stored_at_ms: u64,
    pub ttl_s: u64,
    pub last_used_ms: u64,
}

impl CacheRow {
    pub fn body_bytes(&self) -> usize {
        self.text.len() + self.thinking.as_deref().map_or(0, str::len)
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.stored_at_ms.saturating_add(self.ttl_s.saturating_mul(1000))
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_bytes: u64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct CostSummary {
    pub period_days: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub total_requests: u64,
    pub today_cost_usd: f64,
    pub week_cost_usd: f64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ProviderCost {
    pub provider: String,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub request_count: u64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct DailyCost {
    pub date: String,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub request_count: u64,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    // ---- requests ----

    pub async fn put_request(&self, request: &RequestRecord) -> Result<(), StoreError> {
        let path = self.path.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            let result = conn.execute(
                "INSERT INTO requests (
                    id, provider, model, agent, prompt, priority, status, attempts,
                    fingerprint, bypass_cache, api_key_id, parent_id, worker,
                    submitted_at_ms, deadline_ms, updated_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                rusqlite::params![
                    request.id,
                    request.provider,
                    request.model,
                    request.agent,
                    request.prompt,
                    request.priority,
                    request.status.as_str(),
                    request.attempts,
                    request.fingerprint,
                    request.bypass_cache as i64,
                    request.api_key_id,
                    request.parent_id,
                    request.worker.map(|w| w as i64),
                    request.submitted_at_ms as i64,
                    request.deadline_ms as i64,
                    request.updated_at_ms as i64,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::DuplicateRequest { id: request.id })
                }
                Err(err) => Err(err.into()),
            }
        })
        .await?
    }

    pub async fn get_request(&self, id: &str) -> Result<Option<RequestRecord>, StoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<RequestRecord>, StoreError> {
            let conn = open_connection(path)?;
            let row = conn
                .query_row(
                    &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
                    rusqlite::params![id],
                    row_to_request,
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    /// Compare-and-set status transition. Fails with `Conflict` when the
    /// current status differs from `from`; appends an audit row on success.
    pub async fn transition(
        &self,
        id: &str,
        from: RequestStatus,
        to: RequestStatus,
        note: Option<String>,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = open_connection(path)?;
            let tx = conn.transaction()?;
            cas_status(&tx, &id, from, to, None)?;
            append_transition(&tx, &id, from, to, note.as_deref())?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// Queued → processing, recording the worker that claimed the request.
    pub async fn mark_processing(&self, id: &str, worker: u64) -> Result<(), StoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = open_connection(path)?;
            let tx = conn.transaction()?;
            cas_status(
                &tx,
                &id,
                RequestStatus::Queued,
                RequestStatus::Processing,
                Some(worker),
            )?;
            append_transition(
                &tx,
                &id,
                RequestStatus::Queued,
                RequestStatus::Processing,
                None,
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// Terminal transition plus the response row, committed together. Every
    /// terminal request gets exactly one response row this way.
    pub async fn finish(
        &self,
        id: &str,
        from: RequestStatus,
        to: RequestStatus,
        response: &ResponseRecord,
    ) -> Result<(), StoreError> {
        debug_assert!(to.is_terminal());
        let path = self.path.clone();
        let id = id.to_string();
        let response = response.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = open_connection(path)?;
            let tx = conn.transaction()?;
            cas_status(&tx, &id, from, to, None)?;
            insert_response(&tx, &response)?;
            append_transition(
                &tx,
                &id,
                from,
                to,
                response.error_kind.map(|kind| kind.as_str()),
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn bump_attempts(&self, id: &str) -> Result<u32, StoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<u32, StoreError> {
            let conn = open_connection(path)?;
            let updated = conn.execute(
                "UPDATE requests SET attempts = attempts + 1, updated_at_ms = ?2 WHERE id = ?1",
                rusqlite::params![id, now_millis() as i64],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound { id });
            }
            let attempts: i64 = conn.query_row(
                "SELECT attempts FROM requests WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )?;
            Ok(attempts.max(0) as u32)
        })
        .await?
    }

    pub async fn list_requests(
        &self,
        filter: RequestFilter,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<RequestRecord>, StoreError> {
            let conn = open_connection(path)?;
            let mut query = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE 1=1");
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(status) = filter.status {
                query.push_str(" AND status = ?");
                params.push(Box::new(status.as_str().to_string()));
            }
            if let Some(provider) = filter.provider {
                query.push_str(" AND provider = ?");
                params.push(Box::new(provider));
            }
            query.push_str(" ORDER BY submitted_at_ms DESC LIMIT ? OFFSET ?");
            let limit = if filter.limit == 0 { 50 } else { filter.limit };
            params.push(Box::new(limit as i64));
            params.push(Box::new(filter.offset as i64));

            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params), row_to_request)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn counts_by_status(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(String, u64)>, StoreError> {
            let conn = open_connection(path)?;
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM requests GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (status, count) = row?;
                out.push((status, count.max(0) as u64));
            }
            Ok(out)
        })
        .await?
    }

    pub async fn list_transitions(&self, id: &str) -> Result<Vec<TransitionRow>, StoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<TransitionRow>, StoreError> {
            let conn = open_connection(path)?;
            let mut stmt = conn.prepare(
                "SELECT request_id, from_status, to_status, note, ts_ms
                 FROM state_transitions WHERE request_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (request_id, from_status, to_status, note, ts_ms) = row?;
                out.push(TransitionRow {
                    request_id,
                    from_status: parse_status(&from_status)?,
                    to_status: parse_status(&to_status)?,
                    note,
                    ts_ms: ts_ms.max(0) as u64,
                });
            }
            Ok(out)
        })
        .await?
    }

    /// Marks every request the previous process left in a non-terminal
    /// status as failed/interrupted, writing the matching response rows.
    /// Returns the affected (id, provider) pairs so the caller can emit
    /// synthetic failure events.
    pub async fn startup_recovery(&self) -> Result<Vec<(String, String)>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(String, String)>, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            let now = now_millis();

            let stranded: Vec<(String, String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, provider, status FROM requests
                     WHERE status IN ('queued', 'processing')",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                out
            };

            let mut recovered = Vec::with_capacity(stranded.len());
            for (id, provider, status) in stranded {
                let from = parse_status(&status)?;
                tx.execute(
                    "UPDATE requests SET status = 'failed', updated_at_ms = ?2 WHERE id = ?1",
                    rusqlite::params![id, now as i64],
                )?;
                let response = ResponseRecord {
                    request_id: id.clone(),
                    text: String::new(),
                    thinking: None,
                    tokens: TokenUsage::default(),
                    latency_ms: 0,
                    backend: None,
                    provider_used: None,
                    error_kind: Some(ErrorKind::Interrupted),
                    error_message: Some(
                        "gateway restarted while the request was in flight".to_string(),
                    ),
                    cached: false,
                    completed_at_ms: now,
                };
                insert_response(&tx, &response)?;
                append_transition(
                    &tx,
                    &id,
                    from,
                    RequestStatus::Failed,
                    Some(ErrorKind::Interrupted.as_str()),
                )?;
                recovered.push((id, provider));
            }

            tx.commit()?;
            Ok(recovered)
        })
        .await?
    }

    pub async fn cleanup_old_requests(&self, max_age_hours: u64) -> Result<u64, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let conn = open_connection(path)?;
            let cutoff = now_millis().saturating_sub(max_age_hours.saturating_mul(3_600_000));
            conn.execute(
                "DELETE FROM responses WHERE request_id IN (
                    SELECT id FROM requests WHERE submitted_at_ms < ?1 AND status IN (
                        'completed', 'failed', 'cancelled', 'timed_out'
                    )
                )",
                rusqlite::params![cutoff as i64],
            )?;
            conn.execute(
                "DELETE FROM state_transitions WHERE request_id IN (
                    SELECT id FROM requests WHERE submitted_at_ms < ?1 AND status IN (
                        'completed', 'failed', 'cancelled', 'timed_out'
                    )
                )",
                rusqlite::params![cutoff as i64],
            )?;
            let removed = conn.execute(
                "DELETE FROM requests WHERE submitted_at_ms < ?1 AND status IN (
                    'completed', 'failed', 'cancelled', 'timed_out'
                )",
                rusqlite::params![cutoff as i64],
            )?;
            Ok(removed as u64)
        })
        .await?
    }

    // ---- responses ----

    pub async fn get_response(&self, id: &str) -> Result<Option<ResponseRecord>, StoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<ResponseRecord>, StoreError> {
            let conn = open_connection(path)?;
            let row = conn
                .query_row(
                    &format!("SELECT {RESPONSE_COLUMNS} FROM responses WHERE request_id = ?1"),
                    rusqlite::params![id],
                    row_to_response,
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    // ---- cache ----

    pub async fn cache_get(&self, fingerprint: &str) -> Result<Option<CacheRow>, StoreError> {
        let path = self.path.clone();
        let fingerprint = fingerprint.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<CacheRow>, StoreError> {
            let conn = open_connection(path)?;
            let now = now_millis();
            let row = conn
                .query_row(
                    "SELECT fingerprint, text, thinking, input_tokens, output_tokens,
                            total_tokens, provider_used, stored_at_ms, ttl_s, last_used_ms
                     FROM cache_entries WHERE fingerprint = ?1",
                    rusqlite::params![fingerprint],
                    row_to_cache,
                )
                .optional()?;
            let Some(entry) = row else {
                return Ok(None);
            };
            if now >= entry.expires_at_ms() {
                conn.execute(
                    "DELETE FROM cache_entries WHERE fingerprint = ?1",
                    rusqlite::params![fingerprint],
                )?;
                return Ok(None);
            }
            conn.execute(
                "UPDATE cache_entries SET last_used_ms = ?2 WHERE fingerprint = ?1",
                rusqlite::params![fingerprint, now as i64],
            )?;
            Ok(Some(entry))
        })
        .await?
    }

    /// Insert-or-replace, then evict least-recently-used rows until both the
    /// entry-count and total-byte budgets hold.
    pub async fn cache_put(
        &self,
        entry: CacheRow,
        max_entries: usize,
        max_bytes: usize,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            if max_entries == 0 || max_bytes == 0 || entry.ttl_s == 0 {
                return Ok(());
            }
            if entry.body_bytes() > max_bytes {
                return Ok(());
            }
            let mut conn = open_connection(path)?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO cache_entries (
                    fingerprint, text, thinking, input_tokens, output_tokens, total_tokens,
                    provider_used, stored_at_ms, ttl_s, last_used_ms, body_bytes
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    entry.fingerprint,
                    entry.text,
                    entry.thinking,
                    entry.tokens.input,
                    entry.tokens.output,
                    entry.tokens.total,
                    entry.provider_used,
                    entry.stored_at_ms as i64,
                    entry.ttl_s as i64,
                    entry.last_used_ms as i64,
                    entry.body_bytes() as i64,
                ],
            )?;
            loop {
                let (count, bytes): (i64, i64) = tx.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(body_bytes), 0) FROM cache_entries",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                if count as usize <= max_entries && bytes as usize <= max_bytes {
                    break;
                }
                let evicted = tx.execute(
                    "DELETE FROM cache_entries WHERE fingerprint = (
                        SELECT fingerprint FROM cache_entries
                        ORDER BY last_used_ms ASC LIMIT 1
                    )",
                    [],
                )?;
                if evicted == 0 {
                    break;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn cache_evict(&self, fingerprint: &str) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let fingerprint = fingerprint.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            let removed = conn.execute(
                "DELETE FROM cache_entries WHERE fingerprint = ?1",
                rusqlite::params![fingerprint],
            )?;
            Ok(removed > 0)
        })
        .await?
    }

    pub async fn cache_clear(&self) -> Result<u64, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let conn = open_connection(path)?;
            let removed = conn.execute("DELETE FROM cache_entries", [])?;
            Ok(removed as u64)
        })
        .await?
    }

    /// Remove rows past their TTL; returns the number removed.
    pub async fn cache_cleanup(&self) -> Result<u64, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let conn = open_connection(path)?;
            let now = now_millis();
            let removed = conn.execute(
                "DELETE FROM cache_entries WHERE stored_at_ms + ttl_s * 1000 <= ?1",
                rusqlite::params![now as i64],
            )?;
            Ok(removed as u64)
        })
        .await?
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<CacheStats, StoreError> {
            let conn = open_connection(path)?;
            let (entries, bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(body_bytes), 0) FROM cache_entries",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(CacheStats {
                entries: entries.max(0) as u64,
                total_bytes: bytes.max(0) as u64,
            })
        })
        .await?
    }

    // ---- api keys ----

    /// Creates a key and returns the record plus the plaintext secret. The
    /// secret is shown exactly once; only its hash is stored.
    pub async fn api_key_create(
        &self,
        name: &str,
        rpm: Option<u32>,
    ) -> Result<(ApiKeyRecord, String), StoreError> {
        let path = self.path.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<(ApiKeyRecord, String), StoreError> {
            let conn = open_connection(path)?;
            let now = now_millis();
            let id = format!("key-{:08x}", rand::random::<u32>());
            let secret = format!("syk-{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>());
            let record = ApiKeyRecord {
                id: id.clone(),
                name,
                status: KeyStatus::Active,
                rpm,
                created_at_ms: now,
                last_used_ms: None,
            };
            conn.execute(
                "INSERT INTO api_keys (id, secret_hash, name, status, rpm, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    record.id,
                    hash_secret(&secret),
                    record.name,
                    record.status.as_str(),
                    record.rpm,
                    now as i64,
                ],
            )?;
            Ok((record, secret))
        })
        .await?
    }

    /// Looks up an active key by plaintext secret and stamps last-used.
    pub async fn api_key_verify(&self, secret: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let path = self.path.clone();
        let hash = hash_secret(secret);
        tokio::task::spawn_blocking(move || -> Result<Option<ApiKeyRecord>, StoreError> {
            let conn = open_connection(path)?;
            let row = conn
                .query_row(
                    "SELECT id, name, status, rpm, created_at_ms, last_used_ms
                     FROM api_keys WHERE secret_hash = ?1",
                    rusqlite::params![hash],
                    row_to_api_key,
                )
                .optional()?;
            let Some(record) = row else {
                return Ok(None);
            };
            if record.status != KeyStatus::Active {
                return Ok(None);
            }
            conn.execute(
                "UPDATE api_keys SET last_used_ms = ?2 WHERE id = ?1",
                rusqlite::params![record.id, now_millis() as i64],
            )?;
            Ok(Some(record))
        })
        .await?
    }

    pub async fn api_key_list(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ApiKeyRecord>, StoreError> {
            let conn = open_connection(path)?;
            let mut stmt = conn.prepare(
                "SELECT id, name, status, rpm, created_at_ms, last_used_ms
                 FROM api_keys ORDER BY created_at_ms ASC",
            )?;
            let rows = stmt.query_map([], row_to_api_key)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn api_key_delete(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            let removed = conn.execute("DELETE FROM api_keys WHERE id = ?1", rusqlite::params![id])?;
            Ok(removed > 0)
        })
        .await?
    }

    pub async fn api_key_set_status(
        &self,
        id: &str,
        status: KeyStatus,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            let updated = conn.execute(
                "UPDATE api_keys SET status = ?2 WHERE id = ?1",
                rusqlite::params![id, status.as_str()],
            )?;
            Ok(updated > 0)
        })
        .await?
    }

    // ---- cost samples ----

    pub async fn cost_sample_append(&self, sample: &CostSample) -> Result<(), StoreError> {
        let path = self.path.clone();
        let sample = sample.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            conn.execute(
                "INSERT INTO cost_samples (
                    provider, request_id, model, input_tokens, output_tokens, cost_usd, ts_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    sample.provider,
                    sample.request_id,
                    sample.model,
                    sample.input_tokens as i64,
                    sample.output_tokens as i64,
                    sample.cost_usd,
                    sample.ts_ms as i64,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn cost_summary(&self, days: u64) -> Result<CostSummary, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<CostSummary, StoreError> {
            let conn = open_connection(path)?;
            let now = now_millis();
            let cutoff = now.saturating_sub(days.saturating_mul(86_400_000));
            let (input, output, cost, count): (i64, i64, f64, i64) = conn.query_row(
                "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(cost_usd), 0.0), COUNT(*)
                 FROM cost_samples WHERE ts_ms > ?1",
                rusqlite::params![cutoff as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
            let today_start = now - (now % 86_400_000);
            let today_cost: f64 = conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cost_samples WHERE ts_ms > ?1",
                rusqlite::params![today_start as i64],
                |row| row.get(0),
            )?;
            let week_start = now.saturating_sub(7 * 86_400_000);
            let week_cost: f64 = conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cost_samples WHERE ts_ms > ?1",
                rusqlite::params![week_start as i64],
                |row| row.get(0),
            )?;
            Ok(CostSummary {
                period_days: days,
                total_input_tokens: input.max(0) as u64,
                total_output_tokens: output.max(0) as u64,
                total_cost_usd: cost,
                total_requests: count.max(0) as u64,
                today_cost_usd: today_cost,
                week_cost_usd: week_cost,
            })
        })
        .await?
    }

    pub async fn cost_by_provider(&self, days: u64) -> Result<Vec<ProviderCost>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ProviderCost>, StoreError> {
            let conn = open_connection(path)?;
            let cutoff = now_millis().saturating_sub(days.saturating_mul(86_400_000));
            let mut stmt = conn.prepare(
                "SELECT provider, COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(cost_usd), 0.0), COUNT(*)
                 FROM cost_samples WHERE ts_ms > ?1
                 GROUP BY provider ORDER BY SUM(cost_usd) DESC",
            )?;
            let rows = stmt.query_map(rusqlite::params![cutoff as i64], |row| {
                Ok(ProviderCost {
                    provider: row.get(0)?,
                    total_input_tokens: row.get::<_, i64>(1)?.max(0) as u64,
                    total_output_tokens: row.get::<_, i64>(2)?.max(0) as u64,
                    total_cost_usd: row.get(3)?,
                    request_count: row.get::<_, i64>(4)?.max(0) as u64,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn cost_by_day(&self, days: u64) -> Result<Vec<DailyCost>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<DailyCost>, StoreError> {
            let conn = open_connection(path)?;
            let cutoff = now_millis().saturating_sub(days.saturating_mul(86_400_000));
            let mut stmt = conn.prepare(
                "SELECT DATE(ts_ms / 1000, 'unixepoch') AS day,
                        COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(cost_usd), 0.0), COUNT(*)
                 FROM cost_samples WHERE ts_ms > ?1
                 GROUP BY day ORDER BY day DESC",
            )?;
            let rows = stmt.query_map(rusqlite::params![cutoff as i64], |row| {
                Ok(DailyCost {
                    date: row.get(0)?,
                    total_input_tokens: row.get::<_, i64>(1)?.max(0) as u64,
                    total_output_tokens: row.get::<_, i64>(2)?.max(0) as u64,
                    total_cost_usd: row.get(3)?,
                    request_count: row.get::<_, i64>(4)?.max(0) as u64,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }
}

const REQUEST_COLUMNS: &str = "id, provider, model, agent, prompt, priority, status, attempts, \
                               fingerprint, bypass_cache, api_key_id, parent_id, worker, \
                               submitted_at_ms, deadline_ms, updated_at_ms";

const RESPONSE_COLUMNS: &str = "request_id, text, thinking, input_tokens, output_tokens, \
                                total_tokens, latency_ms, backend, provider_used, error_kind, \
                                error_message, cached, completed_at_ms";

fn cas_status(
    tx: &rusqlite::Transaction<'_>,
    id: &str,
    from: RequestStatus,
    to: RequestStatus,
    worker: Option<u64>,
) -> Result<(), StoreError> {
    let now = now_millis() as i64;
    let updated = match worker {
        Some(worker) => tx.execute(
            "UPDATE requests SET status = ?3, worker = ?4, updated_at_ms = ?5
             WHERE id = ?1 AND status = ?2",
            rusqlite::params![id, from.as_str(), to.as_str(), worker as i64, now],
        )?,
        None => tx.execute(
            "UPDATE requests SET status = ?3, updated_at_ms = ?4
             WHERE id = ?1 AND status = ?2",
            rusqlite::params![id, from.as_str(), to.as_str(), now],
        )?,
    };
    if updated > 0 {
        return Ok(());
    }
    let actual: Option<String> = tx
        .query_row(
            "SELECT status FROM requests WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        )
        .optional()?;
    match actual {
        None => Err(StoreError::NotFound { id: id.to_string() }),
        Some(status) => Err(StoreError::Conflict {
            id: id.to_string(),
            expected: from,
            actual: parse_status(&status)?,
        }),
    }
}

fn append_transition(
    tx: &rusqlite::Transaction<'_>,
    id: &str,
    from: RequestStatus,
    to: RequestStatus,
    note: Option<&str>,
) -> Result<(), rusqlite::Error> {
    tx.execute(
        "INSERT INTO state_transitions (request_id, from_status, to_status, note, ts_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![id, from.as_str(), to.as_str(), note, now_millis() as i64],
    )?;
    Ok(())
}

fn insert_response(
    tx: &rusqlite::Transaction<'_>,
    response: &ResponseRecord,
) -> Result<(), rusqlite::Error> {
    tx.execute(
        "INSERT OR REPLACE INTO responses (
            request_id, text, thinking, input_tokens, output_tokens, total_tokens,
            latency_ms, backend, provider_used, error_kind, error_message, cached,
            completed_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            response.request_id,
            response.text,
            response.thinking,
            response.tokens.input,
            response.tokens.output,
            response.tokens.total,
            response.latency_ms as i64,
            response.backend.map(|kind| kind.as_str()),
            response.provider_used,
            response.error_kind.map(|kind| kind.as_str()),
            response.error_message,
            response.cached as i64,
            response.completed_at_ms as i64,
        ],
    )?;
    Ok(())
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRecord> {
    let status: String = row.get(6)?;
    Ok(RequestRecord {
        id: row.get(0)?,
        provider: row.get(1)?,
        model: row.get(2)?,
        agent: row.get(3)?,
        prompt: row.get(4)?,
        priority: row.get(5)?,
        status: parse_status(&status)?,
        attempts: row.get::<_, i64>(7)?.max(0) as u32,
        fingerprint: row.get(8)?,
        bypass_cache: row.get::<_, i64>(9)? != 0,
        api_key_id: row.get(10)?,
        parent_id: row.get(11)?,
        worker: row.get::<_, Option<i64>>(12)?.map(|w| w.max(0) as u64),
        submitted_at_ms: row.get::<_, i64>(13)?.max(0) as u64,
        deadline_ms: row.get::<_, i64>(14)?.max(0) as u64,
        updated_at_ms: row.get::<_, i64>(15)?.max(0) as u64,
    })
}

fn row_to_response(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResponseRecord> {
    let backend: Option<String> = row.get(7)?;
    let error_kind: Option<String> = row.get(9)?;
    Ok(ResponseRecord {
        request_id: row.get(0)?,
        text: row.get(1)?,
        thinking: row.get(2)?,
        tokens: TokenUsage {
            input: row.get::<_, i64>(3)?.max(0) as u32,
            output: row.get::<_, i64>(4)?.max(0) as u32,
            total: row.get::<_, i64>(5)?.max(0) as u32,
        },
        latency_ms: row.get::<_, i64>(6)?.max(0) as u64,
        backend: backend.as_deref().and_then(BackendKind::parse),
        provider_used: row.get(8)?,
        error_kind: error_kind.as_deref().and_then(ErrorKind::parse),
        error_message: row.get(10)?,
        cached: row.get::<_, i64>(11)? != 0,
        completed_at_ms: row.get::<_, i64>(12)?.max(0) as u64,
    })
}

fn row_to_cache(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheRow> {
    Ok(CacheRow {
        fingerprint: row.get(0)?,
        text: row.get(1)?,
        thinking: row.get(2)?,
        tokens: TokenUsage {
            input: row.get::<_, i64>(3)?.max(0) as u32,
            output: row.get::<_, i64>(4)?.max(0) as u32,
            total: row.get::<_, i64>(5)?.max(0) as u32,
        },
        provider_used: row.get(6)?,
        stored_at_ms: row.get::<_, i64>(7)?.max(0) as u64,
        ttl_s: row.get::<_, i64>(8)?.max(0) as u64,
        last_used_ms: row.get::<_, i64>(9)?.max(0) as u64,
    })
}

fn row_to_api_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    let status: String = row.get(2)?;
    Ok(ApiKeyRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        status: KeyStatus::parse(&status).unwrap_or(KeyStatus::Disabled),
        rpm: row.get::<_, Option<i64>>(3)?.map(|v| v.max(0) as u32),
        created_at_ms: row.get::<_, i64>(4)?.max(0) as u64,
        last_used_ms: row.get::<_, Option<i64>>(5)?.map(|v| v.max(0) as u64),
    })
}

fn parse_status(value: &str) -> rusqlite::Result<RequestStatus> {
    RequestStatus::parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown request status: {value}").into(),
        )
    })
}

fn hash_secret(secret: &str) -> String {
    use base64::Engine as _;
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(secret.as_bytes());
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS requests (
            id TEXT PRIMARY KEY NOT NULL,
            provider TEXT NOT NULL,
            model TEXT,
            agent TEXT,
            prompt TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            fingerprint TEXT NOT NULL,
            bypass_cache INTEGER NOT NULL DEFAULT 0,
            api_key_id TEXT,
            parent_id TEXT,
            worker INTEGER,
            submitted_at_ms INTEGER NOT NULL,
            deadline_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status);
        CREATE INDEX IF NOT EXISTS idx_requests_provider ON requests(provider);
        CREATE INDEX IF NOT EXISTS idx_requests_fingerprint ON requests(fingerprint);
        CREATE INDEX IF NOT EXISTS idx_requests_priority
            ON requests(priority DESC, submitted_at_ms ASC);

        CREATE TABLE IF NOT EXISTS responses (
            request_id TEXT PRIMARY KEY NOT NULL,
            text TEXT NOT NULL,
            thinking TEXT,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            backend TEXT,
            provider_used TEXT,
            error_kind TEXT,
            error_message TEXT,
            cached INTEGER NOT NULL DEFAULT 0,
            completed_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS state_transitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            from_status TEXT NOT NULL,
            to_status TEXT NOT NULL,
            note TEXT,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transitions_request
            ON state_transitions(request_id);

        CREATE TABLE IF NOT EXISTS cache_entries (
            fingerprint TEXT PRIMARY KEY NOT NULL,
            text TEXT NOT NULL,
            thinking TEXT,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            provider_used TEXT NOT NULL,
            stored_at_ms INTEGER NOT NULL,
            ttl_s INTEGER NOT NULL,
            last_used_ms INTEGER NOT NULL,
            body_bytes INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_cache_last_used ON cache_entries(last_used_ms);

        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY NOT NULL,
            secret_hash TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            rpm INTEGER,
            created_at_ms INTEGER NOT NULL,
            last_used_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS cost_samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider TEXT NOT NULL,
            request_id TEXT,
            model TEXT,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0.0,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cost_samples_provider ON cost_samples(provider);
        CREATE INDEX IF NOT EXISTS idx_cost_samples_ts ON cost_samples(ts_ms);",
    )?;
    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    if version.is_none() {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            rusqlite::params![SCHEMA_VERSION],
        )?;
    }
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(id: &str) -> RequestRecord {
        let now = now_millis();
        RequestRecord {
            id: id.to_string(),
            provider: "stub".to_string(),
            model: None,
            agent: None,
            prompt: "hello".to_string(),
            priority: 0,
            status: RequestStatus::Queued,
            attempts: 0,
            fingerprint: "fp".to_string(),
            bypass_cache: false,
            api_key_id: None,
            parent_id: None,
            worker: None,
            submitted_at_ms: now,
            deadline_ms: now + 30_000,
            updated_at_ms: now,
        }
    }

    fn sample_response(id: &str) -> ResponseRecord {
        ResponseRecord {
            request_id: id.to_string(),
            text: "hi".to_string(),
            thinking: None,
            tokens: TokenUsage::new(3, 1),
            latency_ms: 12,
            backend: Some(BackendKind::HttpApi),
            provider_used: Some("stub".to_string()),
            error_kind: None,
            error_message: None,
            cached: false,
            completed_at_ms: now_millis(),
        }
    }

    async fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        store.init().await.expect("init");
        (dir, store)
    }

    #[tokio::test]
    async fn request_round_trips() {
        let (_dir, store) = open_store().await;
        let request = sample_request("r1");
        store.put_request(&request).await.expect("put");
        let loaded = store.get_request("r1").await.expect("get").expect("some");
        assert_eq!(loaded.provider, "stub");
        assert_eq!(loaded.status, RequestStatus::Queued);
        assert!(store.get_request("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn duplicate_request_ids_are_rejected() {
        let (_dir, store) = open_store().await;
        store.put_request(&sample_request("r1")).await.expect("put");
        let err = store.put_request(&sample_request("r1")).await;
        assert!(matches!(err, Err(StoreError::DuplicateRequest { .. })));
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let (_dir, store) = open_store().await;
        store.put_request(&sample_request("r1")).await.expect("put");
        store.mark_processing("r1", 1).await.expect("processing");

        let err = store.mark_processing("r1", 2).await;
        assert!(matches!(
            err,
            Err(StoreError::Conflict {
                expected: RequestStatus::Queued,
                actual: RequestStatus::Processing,
                ..
            })
        ));

        let transitions = store.list_transitions("r1").await.expect("transitions");
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to_status, RequestStatus::Processing);
    }

    #[tokio::test]
    async fn finish_writes_response_and_terminal_status_together() {
        let (_dir, store) = open_store().await;
        store.put_request(&sample_request("r1")).await.expect("put");
        store.mark_processing("r1", 1).await.expect("processing");
        store
            .finish(
                "r1",
                RequestStatus::Processing,
                RequestStatus::Completed,
                &sample_response("r1"),
            )
            .await
            .expect("finish");

        let request = store.get_request("r1").await.expect("get").expect("some");
        assert_eq!(request.status, RequestStatus::Completed);
        let response = store.get_response("r1").await.expect("get").expect("some");
        assert_eq!(response.text, "hi");
        assert_eq!(response.tokens.total, 4);
    }

    #[tokio::test]
    async fn cancelling_a_terminal_request_conflicts() {
        let (_dir, store) = open_store().await;
        store.put_request(&sample_request("r1")).await.expect("put");
        store.mark_processing("r1", 1).await.expect("processing");
        store
            .finish(
                "r1",
                RequestStatus::Processing,
                RequestStatus::Completed,
                &sample_response("r1"),
            )
            .await
            .expect("finish");

        let err = store
            .transition(
                "r1",
                RequestStatus::Processing,
                RequestStatus::Cancelled,
                None,
            )
            .await;
        assert!(matches!(err, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn attempts_are_monotonic() {
        let (_dir, store) = open_store().await;
        store.put_request(&sample_request("r1")).await.expect("put");
        assert_eq!(store.bump_attempts("r1").await.expect("bump"), 1);
        assert_eq!(store.bump_attempts("r1").await.expect("bump"), 2);
        assert_eq!(store.bump_attempts("r1").await.expect("bump"), 3);
    }

    #[tokio::test]
    async fn startup_recovery_fails_stranded_requests() {
        let (_dir, store) = open_store().await;
        store.put_request(&sample_request("q1")).await.expect("put");
        store.put_request(&sample_request("p1")).await.expect("put");
        store.mark_processing("p1", 7).await.expect("processing");
        store.put_request(&sample_request("done")).await.expect("put");
        store.mark_processing("done", 7).await.expect("processing");
        store
            .finish(
                "done",
                RequestStatus::Processing,
                RequestStatus::Completed,
                &sample_response("done"),
            )
            .await
            .expect("finish");

        let recovered = store.startup_recovery().await.expect("recovery");
        let mut ids: Vec<_> = recovered.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["p1".to_string(), "q1".to_string()]);

        for id in ["q1", "p1"] {
            let request = store.get_request(id).await.expect("get").expect("some");
            assert_eq!(request.status, RequestStatus::Failed);
            let response = store.get_response(id).await.expect("get").expect("some");
            assert_eq!(response.error_kind, Some(ErrorKind::Interrupted));
        }
        let done = store.get_request("done").await.expect("get").expect("some");
        assert_eq!(done.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn list_requests_filters_by_status_and_provider() {
        let (_dir, store) = open_store().await;
        let mut other = sample_request("r2");
        other.provider = "other".to_string();
        store.put_request(&sample_request("r1")).await.expect("put");
        store.put_request(&other).await.expect("put");

        let queued = store
            .list_requests(RequestFilter {
                status: Some(RequestStatus::Queued),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(queued.len(), 2);

        let stubs = store
            .list_requests(RequestFilter {
                provider: Some("stub".to_string()),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(stubs.len(), 1);
        assert_eq!(stubs[0].id, "r1");
    }

    #[tokio::test]
    async fn cache_honors_ttl() {
        let (_dir, store) = open_store().await;
        let now = now_millis();
        store
            .cache_put(
                CacheRow {
                    fingerprint: "fp".to_string(),
                    text: "cached".to_string(),
                    thinking: None,
                    tokens: TokenUsage::new(1, 1),
                    provider_used: "stub".to_string(),
                    stored_at_ms: now.saturating_sub(10_000),
                    ttl_s: 5,
                    last_used_ms: now,
                },
                16,
                1024,
            )
            .await
            .expect("put");
        assert!(store.cache_get("fp").await.expect("get").is_none());

        store
            .cache_put(
                CacheRow {
                    fingerprint: "fp2".to_string(),
                    text: "fresh".to_string(),
                    thinking: None,
                    tokens: TokenUsage::new(1, 1),
                    provider_used: "stub".to_string(),
                    stored_at_ms: now,
                    ttl_s: 300,
                    last_used_ms: now,
                },
                16,
                1024,
            )
            .await
            .expect("put");
        let hit = store.cache_get("fp2").await.expect("get").expect("some");
        assert_eq!(hit.text, "fresh");
    }

    #[tokio::test]
    async fn cache_evicts_least_recently_used() {
        let (_dir, store) = open_store().await;
        let now = now_millis();
        for (i, fp) in ["a", "b", "c"].iter().enumerate() {
            store
                .cache_put(
                    CacheRow {
                        fingerprint: fp.to_string(),
                        text: "x".to_string(),
                        thinking: None,
                        tokens: TokenUsage::default(),
                        provider_used: "stub".to_string(),
                        stored_at_ms: now,
                        ttl_s: 300,
                        last_used_ms: now + i as u64,
                    },
                    2,
                    1024,
                )
                .await
                .expect("put");
        }
        assert!(store.cache_get("a").await.expect("get").is_none());
        assert!(store.cache_get("b").await.expect("get").is_some());
        assert!(store.cache_get("c").await.expect("get").is_some());

        let stats = store.cache_stats().await.expect("stats");
        assert_eq!(stats.entries, 2);
    }

    #[tokio::test]
    async fn cache_admin_operations() {
        let (_dir, store) = open_store().await;
        let now = now_millis();
        store
            .cache_put(
                CacheRow {
                    fingerprint: "stale".to_string(),
                    text: "x".to_string(),
                    thinking: None,
                    tokens: TokenUsage::default(),
                    provider_used: "stub".to_string(),
                    stored_at_ms: now.saturating_sub(60_000),
                    ttl_s: 1,
                    last_used_ms: now,
                },
                16,
                1024,
            )
            .await
            .expect("put");
        assert_eq!(store.cache_cleanup().await.expect("cleanup"), 1);
        assert_eq!(store.cache_clear().await.expect("clear"), 0);
        assert!(!store.cache_evict("stale").await.expect("evict"));
    }

    #[tokio::test]
    async fn api_keys_verify_only_when_active() {
        let (_dir, store) = open_store().await;
        let (record, secret) = store
            .api_key_create("ci", Some(120))
            .await
            .expect("create");
        assert!(secret.starts_with("syk-"));

        let verified = store
            .api_key_verify(&secret)
            .await
            .expect("verify")
            .expect("some");
        assert_eq!(verified.id, record.id);
        assert_eq!(verified.rpm, Some(120));

        store
            .api_key_set_status(&record.id, KeyStatus::Disabled)
            .await
            .expect("disable");
        assert!(store.api_key_verify(&secret).await.expect("verify").is_none());
        assert!(store.api_key_verify("syk-bogus").await.expect("verify").is_none());

        assert!(store.api_key_delete(&record.id).await.expect("delete"));
        assert!(store.api_key_list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn cost_aggregates_roll_up() {
        let (_dir, store) = open_store().await;
        let now = now_millis();
        for (provider, cost) in [("a", 0.5), ("a", 0.25), ("b", 1.0)] {
            store
                .cost_sample_append(&CostSample {
                    provider: provider.to_string(),
                    request_id: None,
                    model: None,
                    input_tokens: 100,
                    output_tokens: 50,
                    cost_usd: cost,
                    ts_ms: now,
                })
                .await
                .expect("append");
        }

        let summary = store.cost_summary(30).await.expect("summary");
        assert_eq!(summary.total_requests, 3);
        assert!((summary.total_cost_usd - 1.75).abs() < 1e-9);

        let by_provider = store.cost_by_provider(30).await.expect("by provider");
        assert_eq!(by_provider.len(), 2);
        assert_eq!(by_provider[0].provider, "b");

        let by_day = store.cost_by_day(7).await.expect("by day");
        assert_eq!(by_day.len(), 1);
        assert_eq!(by_day[0].request_count, 3);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_rows() {
        let (_dir, store) = open_store().await;
        let mut old = sample_request("old");
        old.submitted_at_ms = now_millis().saturating_sub(48 * 3_600_000);
        store.put_request(&old).await.expect("put");
        store.mark_processing("old", 1).await.expect("processing");
        store
            .finish(
                "old",
                RequestStatus::Processing,
                RequestStatus::Completed,
                &sample_response("old"),
            )
            .await
            .expect("finish");
        store.put_request(&sample_request("fresh")).await.expect("put");

        let removed = store.cleanup_old_requests(24).await.expect("cleanup");
        assert_eq!(removed, 1);
        assert!(store.get_request("old").await.expect("get").is_none());
        assert!(store.get_request("fresh").await.expect("get").is_some());
    }
}
