//! `CREATE TABLE` statements for the worker-local store (§4.3). Single
//! source of truth for the schema, applied idempotently on every open.

use crate::types::Result;
use sqlx::SqlitePool;

pub(crate) async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
    sqlx::query("PRAGMA synchronous=NORMAL").execute(pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(pool).await?;
    sqlx::query("PRAGMA busy_timeout=5000").execute(pool).await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS objectives (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            hat TEXT NOT NULL,
            base_branch TEXT NOT NULL,
            token_budget INTEGER NOT NULL DEFAULT 0,
            checklist TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            completed_at TEXT
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            objective_id TEXT NOT NULL REFERENCES objectives(id),
            hat TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            iteration_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS activity (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            objective_id TEXT NOT NULL,
            iteration INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            content TEXT NOT NULL,
            tokens_input INTEGER NOT NULL DEFAULT 0,
            tokens_output INTEGER NOT NULL DEFAULT 0,
            hat TEXT,
            created_at TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0
        )"#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS activity_unsynced ON activity(synced, created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS secrets (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL,
            encrypted INTEGER NOT NULL DEFAULT 0
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS sync_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_size INTEGER NOT NULL,
            synced_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS session_state (
            session_id TEXT PRIMARY KEY,
            objective_id TEXT NOT NULL,
            hat TEXT NOT NULL,
            iteration INTEGER NOT NULL,
            tokens_input INTEGER NOT NULL,
            tokens_output INTEGER NOT NULL,
            conversation TEXT NOT NULL,
            scratchpad TEXT NOT NULL,
            done TEXT NOT NULL,
            failed TEXT NOT NULL,
            hat_history TEXT NOT NULL,
            transition_count INTEGER NOT NULL,
            previous_hat TEXT,
            status TEXT NOT NULL,
            work_dir TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
