//! Durable idempotency ledger
//!
//! Records which source log files have been processed and which JSONL
//! exports have been persisted, keyed by (server, filename) and by JSONL
//! path. Backed by an embedded SQLite file; every operation opens a
//! connection, ensures the schema, executes, and closes. Call rates are
//! batch-level, so no pooling is needed, and a single process instance is
//! assumed per ledger.

use anyhow::{Context, Result};
use chrono::{NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Executor};
use std::path::{Path, PathBuf};

/// Handle on the ledger database file
#[derive(Debug, Clone)]
pub struct StateTracker {
    db_path: PathBuf,
}

impl StateTracker {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// True if this (server, filename) pair was processed at least once
    pub async fn is_file_processed(&self, server_name: &str, filename: &str) -> Result<bool> {
        let mut conn = self.connect().await?;
        let row = sqlx::query(
            "SELECT 1 FROM processed_files WHERE server_name = ? AND filename = ? LIMIT 1",
        )
        .bind(server_name)
        .bind(filename)
        .fetch_optional(&mut conn)
        .await
        .context("Failed to query processed_files")?;
        conn.close().await.ok();
        Ok(row.is_some())
    }

    /// Mark a source file as processed (parsed + archived)
    ///
    /// Upsert: a later reprocessing refreshes every field except
    /// `first_seen_at`.
    pub async fn mark_file_processed(
        &self,
        server_name: &str,
        filename: &str,
        file_date: Option<NaiveDate>,
        hash_sha256: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.connect().await?;
        let now = timestamp();
        sqlx::query(
            r#"
            INSERT INTO processed_files
                (server_name, filename, file_date, first_seen_at, last_processed_at, hash_sha256)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(server_name, filename) DO UPDATE SET
                file_date = excluded.file_date,
                last_processed_at = excluded.last_processed_at,
                hash_sha256 = excluded.hash_sha256
            "#,
        )
        .bind(server_name)
        .bind(filename)
        .bind(file_date.map(|d| d.to_string()))
        .bind(&now)
        .bind(&now)
        .bind(hash_sha256)
        .execute(&mut conn)
        .await
        .context("Failed to upsert processed_files")?;
        conn.close().await.ok();
        Ok(())
    }

    /// True if this JSONL file was already persisted to the fact store
    pub async fn is_jsonl_persisted(&self, jsonl_path: &str) -> Result<bool> {
        let mut conn = self.connect().await?;
        let row =
            sqlx::query("SELECT 1 FROM persisted_jsonl_files WHERE jsonl_path = ? LIMIT 1")
                .bind(jsonl_path)
                .fetch_optional(&mut conn)
                .await
                .context("Failed to query persisted_jsonl_files")?;
        conn.close().await.ok();
        Ok(row.is_some())
    }

    /// Mark a JSONL file as persisted
    ///
    /// Upsert: a later persistence refreshes every field except
    /// `first_persisted_at`.
    pub async fn mark_jsonl_persisted(
        &self,
        jsonl_path: &str,
        server_name: Option<&str>,
        source_file: Option<&str>,
        rows_inserted: i64,
    ) -> Result<()> {
        let mut conn = self.connect().await?;
        let now = timestamp();
        sqlx::query(
            r#"
            INSERT INTO persisted_jsonl_files
                (jsonl_path, server_name, source_file, rows_inserted,
                 first_persisted_at, last_persisted_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(jsonl_path) DO UPDATE SET
                server_name = excluded.server_name,
                source_file = excluded.source_file,
                rows_inserted = excluded.rows_inserted,
                last_persisted_at = excluded.last_persisted_at
            "#,
        )
        .bind(jsonl_path)
        .bind(server_name)
        .bind(source_file)
        .bind(rows_inserted)
        .bind(&now)
        .bind(&now)
        .execute(&mut conn)
        .await
        .context("Failed to upsert persisted_jsonl_files")?;
        conn.close().await.ok();
        Ok(())
    }

    /// Open a connection to the ledger file, creating file and schema on
    /// first use
    async fn connect(&self) -> Result<SqliteConnection> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create ledger directory: {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.db_path)
            .create_if_missing(true);

        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .with_context(|| format!("Failed to open ledger: {}", self.db_path.display()))?;

        ensure_schema(&mut conn).await?;
        Ok(conn)
    }
}

async fn ensure_schema(conn: &mut SqliteConnection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS processed_files (
            server_name TEXT NOT NULL,
            filename TEXT NOT NULL,
            file_date TEXT,
            first_seen_at TEXT NOT NULL,
            last_processed_at TEXT NOT NULL,
            hash_sha256 TEXT,
            PRIMARY KEY (server_name, filename)
        )
        "#,
    )
    .await
    .context("Failed to create processed_files table")?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS persisted_jsonl_files (
            jsonl_path TEXT NOT NULL PRIMARY KEY,
            server_name TEXT,
            source_file TEXT,
            rows_inserted INTEGER,
            first_persisted_at TEXT NOT NULL,
            last_persisted_at TEXT NOT NULL
        )
        "#,
    )
    .await
    .context("Failed to create persisted_jsonl_files table")?;

    Ok(())
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
