//! Biolog Ingest Library
//!
//! Ingestion pipeline for biometric-quality log files produced by remote
//! identity-verification servers.
//!
//! # Pipeline stages
//!
//! - **collector**: fetch not-yet-seen `.log` files from configured SFTP
//!   servers into the input tree
//! - **parser**: tokenize each `Key=Value` log line into a
//!   [`models::BiometricsRecord`]
//! - **processor**: export IP records as JSONL, archive consumed logs, and
//!   drive persistence of exported JSONL files
//! - **persister**: expand records to fact rows and bulk-insert them into
//!   Postgres
//! - **state**: the durable idempotency ledger consulted and updated by
//!   every stage
//!
//! Each stage is idempotent against the ledger and the archive trees: a
//! crashed or re-invoked run resumes without reprocessing or double-inserting.

pub mod collector;
pub mod config;
pub mod models;
pub mod parser;
pub mod persister;
pub mod processor;
pub mod state;
pub mod transcode;
