//! Inline SQL migrations for the durable store.
//!
//! Statements are executed in order, split on `;`, exactly like the daemon's
//! own migration runner — except embedded as string constants rather than
//! `include_str!`'d files, since this store has no separate `migrations/`
//! directory of its own.

pub const MIGRATIONS: &[&str] = &[MIGRATION_001_REQUESTS, MIGRATION_002_ATTEMPTS];

const MIGRATION_001_REQUESTS: &str = "
CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    priority INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    timeout_ms INTEGER NOT NULL,
    scheduled_for TEXT,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS request_state (
    id TEXT PRIMARY KEY REFERENCES requests(id),
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT,
    next_retry_at TEXT,
    completed_at TEXT,
    error TEXT,
    response_status_code INTEGER,
    response_duration_ms INTEGER,
    response_headers TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_request_state_status ON request_state(status);
CREATE INDEX IF NOT EXISTS idx_request_state_next_retry ON request_state(next_retry_at);
";

const MIGRATION_002_ATTEMPTS: &str = "
CREATE TABLE IF NOT EXISTS attempts (
    request_id TEXT NOT NULL REFERENCES requests(id),
    attempt_number INTEGER NOT NULL,
    status_code INTEGER,
    duration_ms INTEGER,
    error TEXT,
    response_headers TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attempts_request ON attempts(request_id, attempt_number, created_at);
";

/// Idempotent column additions applied after the base tables exist.
/// SQLite has no `ADD COLUMN IF NOT EXISTS`, so we attempt each ALTER and
/// ignore a "duplicate column" failure.
pub const ALTER_STATEMENTS: &[&str] = &[
    "ALTER TABLE attempts ADD COLUMN host TEXT",
];
