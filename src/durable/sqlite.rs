use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::error::{EngineError, EngineResult};
use crate::model::{
    Attempt, AttemptOutcome, Method, Request, RequestStatus, RequestState, ResponseSummary, Stats,
    StatusPatch,
};

use super::migrations::{ALTER_STATEMENTS, MIGRATIONS};

/// Default timeout for individual queries — a hung connection should never
/// block the engine indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = EngineResult<T>>) -> EngineResult<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Storage(sqlx::Error::PoolTimedOut)),
    }
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: String,
    url: String,
    method: String,
    headers: String,
    body: Option<Vec<u8>>,
    priority: i64,
    max_retries: i64,
    timeout_ms: i64,
    scheduled_for: Option<String>,
    metadata: String,
    created_at: String,
}

impl RequestRow {
    fn into_request(self) -> EngineResult<Request> {
        let method = match self.method.as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            other => return Err(EngineError::Validation(format!("unknown method in storage: {other}"))),
        };
        Ok(Request {
            id: self.id,
            url: self.url,
            method,
            headers: serde_json::from_str(&self.headers).unwrap_or_default(),
            body: self.body,
            priority: self.priority as u8,
            max_retries: self.max_retries as u32,
            timeout_ms: self.timeout_ms as u64,
            scheduled_for: self.scheduled_for.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
            metadata: serde_json::from_str(&self.metadata).unwrap_or(serde_json::Value::Null),
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    id: String,
    status: String,
    attempts: i64,
    last_attempt_at: Option<String>,
    next_retry_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    response_status_code: Option<i64>,
    response_duration_ms: Option<i64>,
    response_headers: Option<String>,
    updated_at: String,
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_status(s: &str) -> EngineResult<RequestStatus> {
    Ok(match s {
        "pending" => RequestStatus::Pending,
        "scheduled" => RequestStatus::Scheduled,
        "processing" => RequestStatus::Processing,
        "completed" => RequestStatus::Completed,
        "failed" => RequestStatus::Failed,
        "dead" => RequestStatus::Dead,
        "cancelled" => RequestStatus::Cancelled,
        other => return Err(EngineError::Validation(format!("unknown status in storage: {other}"))),
    })
}

impl StateRow {
    fn into_state(self) -> EngineResult<RequestState> {
        let response = match (self.response_status_code, self.response_duration_ms) {
            (Some(code), Some(dur)) => Some(ResponseSummary {
                status_code: code as u16,
                duration_ms: dur as u64,
                headers: self
                    .response_headers
                    .as_deref()
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_default(),
            }),
            _ => None,
        };
        Ok(RequestState {
            id: self.id,
            status: parse_status(&self.status)?,
            attempts: self.attempts as u32,
            last_attempt_at: self.last_attempt_at.as_deref().map(parse_ts),
            next_retry_at: self.next_retry_at.as_deref().map(parse_ts),
            completed_at: self.completed_at.as_deref().map(parse_ts),
            error: self.error,
            response,
            updated_at: parse_ts(&self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    request_id: String,
    attempt_number: i64,
    status_code: Option<i64>,
    duration_ms: Option<i64>,
    error: Option<String>,
    response_headers: Option<String>,
    created_at: String,
}

impl AttemptRow {
    fn into_attempt(self) -> Attempt {
        Attempt {
            request_id: self.request_id,
            attempt_number: self.attempt_number as u32,
            status_code: self.status_code.map(|v| v as u16),
            duration_ms: self.duration_ms.map(|v| v as u64),
            error: self.error,
            response_headers: self
                .response_headers
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
            created_at: parse_ts(&self.created_at),
        }
    }
}

/// SQLite-backed `DurableStore`. WAL mode + `NORMAL` synchronous, matching
/// the daemon's own storage setup — crash-safe without fsync-per-write cost.
#[derive(Clone)]
pub struct SqliteDurableStore {
    pool: SqlitePool,
}

impl SqliteDurableStore {
    pub async fn new(data_dir: &Path, max_connections: u32) -> EngineResult<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| EngineError::Migration(e.to_string()))?;
        let db_path = data_dir.join("queue.db");
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .map_err(EngineError::Storage)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new().max_connections(max_connections).connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory SQLite pool, for tests that don't want a file on disk.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn in_memory() -> EngineResult<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> EngineResult<()> {
        for sql in MIGRATIONS {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        for stmt in ALTER_STATEMENTS {
            if let Err(e) = sqlx::query(stmt).execute(pool).await {
                let msg = e.to_string();
                if !msg.contains("duplicate column") {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

/// Insert one request row plus its initial state inside an already-open
/// transaction. Maps a sqlite unique-constraint violation (duplicate id) to
/// `EngineError::Conflict` instead of a generic storage error.
async fn insert_request(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    request: &Request,
    initial_status: RequestStatus,
) -> EngineResult<()> {
    let headers = serde_json::to_string(&request.headers).unwrap_or_default();
    let metadata = serde_json::to_string(&request.metadata).unwrap_or_else(|_| "null".to_string());
    let scheduled_for = request.scheduled_for.map(|t| t.to_rfc3339());
    let created_at = request.created_at.to_rfc3339();

    let result = sqlx::query(
        "INSERT INTO requests (id, url, method, headers, body, priority, max_retries, timeout_ms, scheduled_for, metadata, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&request.id)
    .bind(&request.url)
    .bind(request.method.to_string())
    .bind(&headers)
    .bind(&request.body)
    .bind(request.priority as i64)
    .bind(request.max_retries as i64)
    .bind(request.timeout_ms as i64)
    .bind(&scheduled_for)
    .bind(&metadata)
    .bind(&created_at)
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => {}
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            return Err(EngineError::Conflict(request.id.clone()));
        }
        Err(e) => return Err(e.into()),
    }

    sqlx::query("INSERT INTO request_state (id, status, attempts, updated_at) VALUES (?, ?, 0, ?)")
        .bind(&request.id)
        .bind(initial_status.as_str())
        .bind(&created_at)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

#[async_trait]
impl super::DurableStore for SqliteDurableStore {
    async fn create_request(&self, request: &Request, initial_status: RequestStatus) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_request(&mut tx, request, initial_status).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_requests(&self, requests: &[(Request, RequestStatus)]) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        for (request, status) in requests {
            insert_request(&mut tx, request, *status).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_request(&self, id: &str) -> EngineResult<Option<Request>> {
        let row: Option<RequestRow> = sqlx::query_as("SELECT * FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RequestRow::into_request).transpose()
    }

    async fn get_request_state(&self, id: &str) -> EngineResult<Option<RequestState>> {
        let row: Option<StateRow> = sqlx::query_as("SELECT * FROM request_state WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(StateRow::into_state).transpose()
    }

    async fn patch_request_state(&self, id: &str, status: RequestStatus, patch: StatusPatch) -> EngineResult<()> {
        let now = Utc::now();
        let current = self
            .get_request_state(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        let attempts = patch.attempts.unwrap_or(current.attempts);
        let last_attempt_at = patch.last_attempt_at.or(current.last_attempt_at);
        let next_retry_at = patch.next_retry_at.unwrap_or(current.next_retry_at);
        let completed_at = patch.completed_at.unwrap_or(current.completed_at);
        let error = patch.error.unwrap_or(current.error);
        let response = patch.response.unwrap_or(current.response);

        let (resp_code, resp_dur, resp_headers) = match &response {
            Some(r) => (
                Some(r.status_code as i64),
                Some(r.duration_ms as i64),
                Some(serde_json::to_string(&r.headers).unwrap_or_default()),
            ),
            None => (None, None, None),
        };

        sqlx::query(
            "UPDATE request_state SET status = ?, attempts = ?, last_attempt_at = ?, next_retry_at = ?, \
             completed_at = ?, error = ?, response_status_code = ?, response_duration_ms = ?, \
             response_headers = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(attempts as i64)
        .bind(last_attempt_at.map(|t| t.to_rfc3339()))
        .bind(next_retry_at.map(|t| t.to_rfc3339()))
        .bind(completed_at.map(|t| t.to_rfc3339()))
        .bind(&error)
        .bind(resp_code)
        .bind(resp_dur)
        .bind(&resp_headers)
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_attempt(&self, request_id: &str, attempt_number: u32, host: Option<&str>, outcome: &AttemptOutcome) -> EngineResult<()> {
        let now = Utc::now().to_rfc3339();
        let (status_code, duration_ms, error, response_headers) = match outcome {
            AttemptOutcome::Response {
                status_code,
                duration_ms,
                response_headers,
            } => (
                Some(*status_code as i64),
                Some(*duration_ms as i64),
                None,
                Some(serde_json::to_string(response_headers).unwrap_or_default()),
            ),
            AttemptOutcome::Error { message } => (None, None, Some(message.clone()), None),
        };
        let _ = host; // host is reported separately via request URL; kept for future per-attempt host audit
        sqlx::query(
            "INSERT INTO attempts (request_id, attempt_number, status_code, duration_ms, error, response_headers, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(attempt_number as i64)
        .bind(status_code)
        .bind(duration_ms)
        .bind(&error)
        .bind(&response_headers)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_attempts(&self, request_id: &str) -> EngineResult<Vec<Attempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            "SELECT * FROM attempts WHERE request_id = ? ORDER BY attempt_number ASC, created_at ASC",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AttemptRow::into_attempt).collect())
    }

    async fn get_requests_by_status(
        &self,
        status: Option<RequestStatus>,
        host_contains: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<Request>> {
        let mut sql = String::from(
            "SELECT r.* FROM requests r JOIN request_state s ON s.id = r.id WHERE 1=1",
        );
        if status.is_some() {
            sql.push_str(" AND s.status = ?");
        }
        if host_contains.is_some() {
            sql.push_str(" AND r.url LIKE ?");
        }
        sql.push_str(" ORDER BY r.created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, RequestRow>(&sql);
        if let Some(s) = status {
            query = query.bind(s.as_str());
        }
        if let Some(h) = host_contains {
            query = query.bind(format!("%{h}%"));
        }
        query = query.bind(limit).bind(offset);

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(RequestRow::into_request).collect()
    }

    async fn list_dead_requests(&self, limit: i64) -> EngineResult<Vec<Request>> {
        let rows: Vec<RequestRow> = sqlx::query_as(
            "SELECT r.* FROM requests r JOIN request_state s ON s.id = r.id \
             WHERE s.status = 'dead' ORDER BY s.updated_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RequestRow::into_request).collect()
    }

    async fn list_orphaned_processing(&self, older_than_ms: i64) -> EngineResult<Vec<String>> {
        let cutoff = (Utc::now() - chrono::Duration::milliseconds(older_than_ms)).to_rfc3339();
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM request_state WHERE status = 'processing' AND last_attempt_at < ?",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_stats(&self) -> EngineResult<Stats> {
        with_timeout(async {
            let counts: Vec<(String, i64)> =
                sqlx::query_as("SELECT status, COUNT(*) FROM request_state GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?;
            let mut stats = Stats::default();
            for (status, count) in counts {
                match status.as_str() {
                    "pending" | "scheduled" => stats.pending += count as u64,
                    "processing" => stats.processing += count as u64,
                    "completed" => stats.completed += count as u64,
                    "failed" => stats.failed += count as u64,
                    "dead" => stats.dead += count as u64,
                    _ => {}
                }
            }

            let avg: Option<(f64,)> = sqlx::query_as(
                "SELECT AVG(response_duration_ms) FROM request_state WHERE response_duration_ms IS NOT NULL",
            )
            .fetch_optional(&self.pool)
            .await?;
            stats.avg_processing_time_ms = avg.map(|(v,)| v).unwrap_or(0.0);

            let total_finished = stats.completed + stats.failed + stats.dead;
            stats.success_rate = if total_finished == 0 {
                1.0
            } else {
                stats.completed as f64 / total_finished as f64
            };

            Ok(stats)
        })
        .await
    }

    async fn cleanup_completed(&self, days: u32) -> EngineResult<u64> {
        if days == 0 {
            return Ok(0);
        }
        let cutoff = (Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
        let n = sqlx::query("DELETE FROM request_state WHERE status IN ('completed','cancelled') AND updated_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(n)
    }

    async fn cleanup_dead(&self, days: u32) -> EngineResult<u64> {
        if days == 0 {
            return Ok(0);
        }
        let cutoff = (Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
        let n = sqlx::query("DELETE FROM request_state WHERE status = 'dead' AND updated_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(n)
    }
}
