//! Fact-table persistence
//!
//! Expands IP records into biometric score rows and bulk-inserts them into
//! `<schema>.biometric_scores` within a single transaction. Failures roll
//! back and propagate so the caller can keep the source JSONL retriable.

use anyhow::{Context, Result};
use regex::Regex;
use sqlx::PgPool;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::models::BiometricsRecord;
use crate::transcode::to_fact_rows;

/// Strict identifier pattern for the schema name, which is the one value
/// interpolated into SQL text rather than bound as a parameter
static SCHEMA_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid pattern"));

/// Validate the configured schema name before any DDL/DML interpolation
pub fn validate_schema_name(schema: &str) -> Result<()> {
    if SCHEMA_IDENT.is_match(schema) {
        Ok(())
    } else {
        anyhow::bail!("Invalid schema name: {:?}", schema)
    }
}

/// Create the schema, fact table, and indexes if they do not exist
pub async fn ensure_schema(pool: &PgPool, schema: &str) -> Result<()> {
    validate_schema_name(schema)?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
        .execute(pool)
        .await
        .context("Failed to create schema")?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {schema}.biometric_scores (
            id BIGSERIAL PRIMARY KEY,
            re_id TEXT NOT NULL,
            re_code INTEGER,
            rq_type TEXT NOT NULL DEFAULT 'IP',
            log_date DATE,
            server_name TEXT,
            source_file TEXT,
            modality TEXT NOT NULL,
            channel TEXT NOT NULL,
            sample_id INTEGER,
            sample_type TEXT,
            score INTEGER,
            nbpk INTEGER,
            raw_line TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#
    ))
    .execute(pool)
    .await
    .context("Failed to create biometric_scores table")?;

    for column in ["re_id", "log_date", "server_name", "modality", "channel"] {
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_biometric_scores_{column} \
             ON {schema}.biometric_scores ({column})"
        ))
        .execute(pool)
        .await
        .with_context(|| format!("Failed to create index on {column}"))?;
    }

    debug!(schema, "Fact table schema ensured");
    Ok(())
}

/// Persist a batch of records as fact rows in one transaction
///
/// Non-IP records are filtered out. Returns the number of rows inserted; on
/// any insert failure the transaction rolls back and the error propagates.
pub async fn persist_records(
    pool: &PgPool,
    schema: &str,
    records: &[BiometricsRecord],
    server_name: Option<&str>,
    source_file: Option<&str>,
) -> Result<i64> {
    validate_schema_name(schema)?;

    let rows: Vec<_> = records
        .iter()
        .filter(|r| r.is_ip())
        .flat_map(|r| to_fact_rows(r, server_name, source_file))
        .collect();

    if rows.is_empty() {
        return Ok(0);
    }

    let insert_sql = format!(
        r#"
        INSERT INTO {schema}.biometric_scores
            (re_id, re_code, rq_type, log_date, server_name, source_file,
             modality, channel, sample_id, sample_type, score, nbpk, raw_line)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#
    );

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    for row in &rows {
        sqlx::query(&insert_sql)
            .bind(&row.record_id)
            .bind(row.status_code)
            .bind(&row.request_type)
            .bind(row.log_date)
            .bind(&row.server_name)
            .bind(&row.source_file)
            .bind(row.modality.as_str())
            .bind(row.channel)
            .bind(row.sample_id)
            .bind(&row.sample_type)
            .bind(row.score)
            .bind(row.nbpk)
            .bind(&row.raw_line)
            .execute(&mut *tx)
            .await
            .context("Failed to insert biometric score row")?;
    }

    tx.commit().await.context("Failed to commit fact rows")?;

    let inserted = rows.len() as i64;
    info!(
        rows = inserted,
        server = server_name.unwrap_or("-"),
        source = source_file.unwrap_or("-"),
        "Inserted biometric score rows"
    );
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_line;

    #[test]
    fn test_validate_schema_name_accepts_identifiers() {
        assert!(validate_schema_name("public").is_ok());
        assert!(validate_schema_name("bio_mart").is_ok());
        assert!(validate_schema_name("_staging2").is_ok());
    }

    #[test]
    fn test_validate_schema_name_rejects_injection() {
        assert!(validate_schema_name("").is_err());
        assert!(validate_schema_name("2fast").is_err());
        assert!(validate_schema_name("bio-mart").is_err());
        assert!(validate_schema_name("public; DROP TABLE x").is_err());
        assert!(validate_schema_name("sch\"ema").is_err());
    }

    #[test]
    fn test_row_expansion_filters_non_ip() {
        let records = vec![
            parse_line("RqType=IP ReId=1 Face=200"),
            parse_line("RqType=QC ReId=2 Face=100"),
        ];
        let rows: Vec<_> = records
            .iter()
            .filter(|r| r.is_ip())
            .flat_map(|r| to_fact_rows(r, Some("s1"), Some("a.2026-01-01.log")))
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record_id, "1");
    }
}
