//! Per-file processing pipeline
//!
//! Drives every log file in the input tree through
//! `Discovered -> Parsed -> Archived`, exporting IP records as JSONL, and
//! drives every exported JSONL through persistence and archival. Both
//! drivers isolate per-file failures: a file that errors is logged, left in
//! place for the next run, and the batch continues.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::models::BiometricsRecord;
use crate::parser::parse_file;
use crate::persister;
use crate::state::StateTracker;
use crate::transcode::{from_json, log_date_from_filename, to_json};

/// Counters reported by [`process_all_logs`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    pub files_processed: usize,
    pub files_failed: usize,
    pub records_exported: usize,
}

/// Counters reported by [`persist_all_jsonl_files`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistStats {
    pub files_processed: usize,
    pub files_failed: usize,
    pub rows_inserted: i64,
}

/// Location of a file relative to its expected root
///
/// Mirror trees (output, archive) preserve the relative path when the file
/// sits under its root; anything else falls back to the bare filename at the
/// destination root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelativeSource {
    Under(PathBuf),
    Fallback(PathBuf),
}

impl RelativeSource {
    pub fn resolve(base: &Path, path: &Path) -> Self {
        match path.strip_prefix(base) {
            Ok(relative) => RelativeSource::Under(relative.to_path_buf()),
            Err(_) => RelativeSource::Fallback(
                path.file_name().map(PathBuf::from).unwrap_or_default(),
            ),
        }
    }

    pub fn as_path(&self) -> &Path {
        match self {
            RelativeSource::Under(p) | RelativeSource::Fallback(p) => p,
        }
    }

    /// Server name encoded as the first path segment under the root
    /// (`<root>/<server>/<file>.log`); None for fallback locations
    pub fn server_name(&self) -> Option<&str> {
        match self {
            RelativeSource::Under(p) => p.iter().next().and_then(|s| s.to_str()).filter(|first| {
                // A bare filename at the root has no server segment.
                p.iter().count() > 1 && !first.is_empty()
            }),
            RelativeSource::Fallback(_) => None,
        }
    }
}

/// Parse every `.log` file under the input root
///
/// Each file yields a JSONL export (IP records only), is archived, and is
/// recorded in the ledger. Empty output still archives: the file was
/// consumed, and leaving it would rescan it every run.
pub async fn process_all_logs(settings: &Settings, tracker: &StateTracker) -> Result<ProcessStats> {
    let log_files = files_with_extension(&settings.input_dir, "log");
    if log_files.is_empty() {
        info!(input_dir = %settings.input_dir.display(), "No log files to process");
        return Ok(ProcessStats::default());
    }

    let mut stats = ProcessStats::default();
    for log_path in &log_files {
        match process_log_file(settings, tracker, log_path).await {
            Ok(exported) => {
                stats.files_processed += 1;
                stats.records_exported += exported;
            },
            Err(e) => {
                // Left un-archived; it will be retried on the next run.
                error!(path = %log_path.display(), error = %e, "Failed to process log file");
                stats.files_failed += 1;
            },
        }
    }

    info!(
        files_processed = stats.files_processed,
        files_failed = stats.files_failed,
        records_exported = stats.records_exported,
        "Log processing complete"
    );
    Ok(stats)
}

/// Parse one log file, export its IP records as JSONL, and archive it
///
/// Returns the number of IP records written. Archiving happens
/// unconditionally once parsing completed, record count included zero.
pub async fn process_log_file(
    settings: &Settings,
    tracker: &StateTracker,
    log_path: &Path,
) -> Result<usize> {
    let records = parse_file(log_path)?;
    let ip_records: Vec<&BiometricsRecord> = records.iter().filter(|r| r.is_ip()).collect();

    if ip_records.is_empty() {
        info!(path = %log_path.display(), "No IP records, archiving without export");
        archive_log_file(settings, tracker, log_path).await?;
        return Ok(0);
    }

    let relative = RelativeSource::resolve(&settings.input_dir, log_path);
    let output_path = jsonl_output_path(&settings.output_json_dir, relative.as_path());
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create output directory: {}", parent.display())
        })?;
    }

    let mut lines = String::new();
    for record in &ip_records {
        let value = to_json(record);
        lines.push_str(&serde_json::to_string(&value).context("Failed to encode JSONL record")?);
        lines.push('\n');
    }
    std::fs::write(&output_path, lines)
        .with_context(|| format!("Failed to write JSONL: {}", output_path.display()))?;

    info!(
        source = %log_path.display(),
        output = %output_path.display(),
        records = ip_records.len(),
        "Exported JSONL"
    );

    archive_log_file(settings, tracker, log_path).await?;
    Ok(ip_records.len())
}

/// Persist every exported JSONL file into the fact store, then archive it
///
/// Already-persisted files (per the ledger) are archived directly. A
/// persistence failure leaves the JSONL in place so the next run retries it.
pub async fn persist_all_jsonl_files(
    settings: &Settings,
    tracker: &StateTracker,
    pool: &PgPool,
) -> Result<PersistStats> {
    let jsonl_files = files_with_extension(&settings.output_json_dir, "jsonl");
    if jsonl_files.is_empty() {
        info!(output_dir = %settings.output_json_dir.display(), "No JSONL files to persist");
        return Ok(PersistStats::default());
    }

    let mut stats = PersistStats::default();
    for jsonl_path in &jsonl_files {
        match persist_jsonl_file(settings, tracker, pool, jsonl_path).await {
            Ok(rows) => {
                stats.files_processed += 1;
                stats.rows_inserted += rows;
            },
            Err(e) => {
                error!(path = %jsonl_path.display(), error = %e, "Failed to persist JSONL file");
                stats.files_failed += 1;
            },
        }
    }

    info!(
        files_processed = stats.files_processed,
        files_failed = stats.files_failed,
        rows_inserted = stats.rows_inserted,
        "JSONL persistence complete"
    );
    Ok(stats)
}

/// Persist one JSONL file; returns the number of fact rows inserted
async fn persist_jsonl_file(
    settings: &Settings,
    tracker: &StateTracker,
    pool: &PgPool,
    jsonl_path: &Path,
) -> Result<i64> {
    let jsonl_path_str = jsonl_path.to_string_lossy().to_string();

    if tracker.is_jsonl_persisted(&jsonl_path_str).await? {
        info!(path = %jsonl_path.display(), "Already persisted, archiving directly");
        archive_jsonl_file(settings, jsonl_path)?;
        return Ok(0);
    }

    let records = read_jsonl_records(jsonl_path)?;
    if records.is_empty() {
        info!(path = %jsonl_path.display(), "No IP records in JSONL, archiving directly");
        archive_jsonl_file(settings, jsonl_path)?;
        return Ok(0);
    }

    let relative = RelativeSource::resolve(&settings.output_json_dir, jsonl_path);
    let server_name = relative.server_name().map(str::to_string);
    let source_file = source_log_name(jsonl_path);

    let rows = persister::persist_records(
        pool,
        &settings.db.schema,
        &records,
        server_name.as_deref(),
        source_file.as_deref(),
    )
    .await
    .with_context(|| format!("Persistence failed for {}", jsonl_path.display()))?;

    info!(
        path = %jsonl_path.display(),
        rows,
        "Persisted biometric score rows"
    );

    // Ledger marking is non-fatal: the rows are in, and a re-run would only
    // re-read the archive-bound file.
    if let Err(e) = tracker
        .mark_jsonl_persisted(
            &jsonl_path_str,
            server_name.as_deref(),
            source_file.as_deref(),
            rows,
        )
        .await
    {
        warn!(path = %jsonl_path.display(), error = %e, "Failed to mark JSONL as persisted");
    }

    archive_jsonl_file(settings, jsonl_path)?;
    Ok(rows)
}

/// Read a JSONL export back into IP records, skipping unreadable lines
fn read_jsonl_records(jsonl_path: &Path) -> Result<Vec<BiometricsRecord>> {
    let content = std::fs::read_to_string(jsonl_path)
        .with_context(|| format!("Failed to read JSONL: {}", jsonl_path.display()))?;

    let mut records = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<serde_json::Value>(line)
            .map_err(anyhow::Error::from)
            .and_then(from_json);
        match parsed {
            Ok(record) if record.is_ip() => records.push(record),
            Ok(_) => {},
            Err(e) => {
                warn!(path = %jsonl_path.display(), error = %e, "Skipping malformed JSONL line");
            },
        }
    }
    Ok(records)
}

/// Move a consumed log into the archive tree and record it in the ledger
///
/// The move itself must succeed; checksum computation and ledger marking are
/// named non-fatal steps, logged and skipped on failure.
async fn archive_log_file(
    settings: &Settings,
    tracker: &StateTracker,
    log_path: &Path,
) -> Result<()> {
    let relative = RelativeSource::resolve(&settings.input_dir, log_path);
    let dest_path = settings.archive_dir.join(relative.as_path());

    move_file(log_path, &dest_path)?;
    info!(source = %log_path.display(), dest = %dest_path.display(), "Archived log file");

    let hash_sha256 = match biolog_common::checksum::compute_file_sha256(&dest_path) {
        Ok(digest) => Some(digest),
        Err(e) => {
            warn!(path = %dest_path.display(), error = %e, "Failed to hash archived file");
            None
        },
    };

    let Some(server_name) = relative.server_name() else {
        debug!(path = %log_path.display(), "No server segment in path, skipping ledger mark");
        return Ok(());
    };
    let Some(filename) = log_path.file_name().and_then(|n| n.to_str()) else {
        return Ok(());
    };
    let file_date = log_date_from_filename(filename);

    if let Err(e) = tracker
        .mark_file_processed(server_name, filename, file_date, hash_sha256.as_deref())
        .await
    {
        warn!(
            server = server_name,
            filename, error = %e,
            "Failed to mark file as processed"
        );
    }

    Ok(())
}

/// Move a consumed JSONL into its archive tree
fn archive_jsonl_file(settings: &Settings, jsonl_path: &Path) -> Result<PathBuf> {
    let relative = RelativeSource::resolve(&settings.output_json_dir, jsonl_path);
    let dest_path = settings.archive_json_dir.join(relative.as_path());

    move_file(jsonl_path, &dest_path)?;
    info!(source = %jsonl_path.display(), dest = %dest_path.display(), "Archived JSONL file");
    Ok(dest_path)
}

/// Rename with a copy+remove fallback for cross-device moves
fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create archive directory: {}", parent.display()))?;
    }

    if std::fs::rename(src, dest).is_err() {
        std::fs::copy(src, dest)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
        std::fs::remove_file(src)
            .with_context(|| format!("Failed to remove source file: {}", src.display()))?;
    }
    Ok(())
}

/// Recursively list files with the given extension, sorted for stable order
fn files_with_extension(base: &Path, extension: &str) -> Vec<PathBuf> {
    if !base.exists() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = WalkDir::new(base)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(extension))
        })
        .collect();
    files.sort();
    files
}

/// Output path mirrors the input tree with `.jsonl` appended to the filename
fn jsonl_output_path(output_base: &Path, relative: &Path) -> PathBuf {
    let mut path = output_base.join(relative);
    let file_name = path
        .file_name()
        .map(|n| {
            let mut name = n.to_os_string();
            name.push(".jsonl");
            name
        })
        .unwrap_or_default();
    path.set_file_name(file_name);
    path
}

/// Original `.log` name recovered from an exported `.jsonl` path
fn source_log_name(jsonl_path: &Path) -> Option<String> {
    jsonl_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.strip_suffix(".jsonl").unwrap_or(n).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_source_under_root() {
        let relative = RelativeSource::resolve(
            Path::new("/data/inputs"),
            Path::new("/data/inputs/server1/quality.2026-01-26.log"),
        );
        assert_eq!(
            relative,
            RelativeSource::Under(PathBuf::from("server1/quality.2026-01-26.log"))
        );
        assert_eq!(relative.server_name(), Some("server1"));
    }

    #[test]
    fn test_relative_source_fallback_outside_root() {
        let relative = RelativeSource::resolve(
            Path::new("/data/inputs"),
            Path::new("/tmp/quality.2026-01-26.log"),
        );
        assert_eq!(
            relative,
            RelativeSource::Fallback(PathBuf::from("quality.2026-01-26.log"))
        );
        assert_eq!(relative.server_name(), None);
    }

    #[test]
    fn test_relative_source_no_server_segment() {
        let relative = RelativeSource::resolve(
            Path::new("/data/inputs"),
            Path::new("/data/inputs/quality.2026-01-26.log"),
        );
        assert_eq!(relative.server_name(), None);
    }

    #[test]
    fn test_jsonl_output_path_appends_suffix() {
        let path = jsonl_output_path(
            Path::new("/data/out"),
            Path::new("server1/quality.2026-01-26.log"),
        );
        assert_eq!(
            path,
            PathBuf::from("/data/out/server1/quality.2026-01-26.log.jsonl")
        );
    }

    #[test]
    fn test_source_log_name() {
        assert_eq!(
            source_log_name(Path::new("/out/s1/quality.2026-01-26.log.jsonl")).as_deref(),
            Some("quality.2026-01-26.log")
        );
    }

    #[test]
    fn test_files_with_extension_sorted_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("s2")).unwrap();
        std::fs::create_dir_all(dir.path().join("s1")).unwrap();
        std::fs::write(dir.path().join("s2/b.log"), "x").unwrap();
        std::fs::write(dir.path().join("s1/a.LOG"), "x").unwrap();
        std::fs::write(dir.path().join("s1/ignore.txt"), "x").unwrap();

        let files = files_with_extension(dir.path(), "log");
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("s1/a.LOG"));
        assert!(files[1].ends_with("s2/b.log"));

        assert!(files_with_extension(Path::new("/nonexistent"), "log").is_empty());
    }

    #[tokio::test]
    async fn test_process_log_file_exports_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::for_roots(dir.path());
        let tracker = StateTracker::new(&settings.state_db_path);

        let input = settings.input_dir.join("server1");
        std::fs::create_dir_all(&input).unwrap();
        let log_path = input.join("quality.2026-01-26.log");
        std::fs::write(
            &log_path,
            "RqType=IP ReId=1 Face=200\nRqType=QC ReId=2\nRqType=IP ReId=3 LeftEye=80 RightEye=82\n",
        )
        .unwrap();

        let exported = process_log_file(&settings, &tracker, &log_path)
            .await
            .unwrap();
        assert_eq!(exported, 2);

        // JSONL mirrors the input tree with the suffix appended.
        let jsonl = settings
            .output_json_dir
            .join("server1/quality.2026-01-26.log.jsonl");
        let content = std::fs::read_to_string(&jsonl).unwrap();
        assert_eq!(content.lines().count(), 2);

        // Source moved to the archive tree and recorded in the ledger.
        assert!(!log_path.exists());
        assert!(settings
            .archive_dir
            .join("server1/quality.2026-01-26.log")
            .exists());
        assert!(tracker
            .is_file_processed("server1", "quality.2026-01-26.log")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_empty_output_file_still_archives() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::for_roots(dir.path());
        let tracker = StateTracker::new(&settings.state_db_path);

        let input = settings.input_dir.join("server1");
        std::fs::create_dir_all(&input).unwrap();
        let log_path = input.join("quality.2026-01-25.log");
        std::fs::write(&log_path, "RqType=QC ReId=2\n").unwrap();

        let exported = process_log_file(&settings, &tracker, &log_path)
            .await
            .unwrap();
        assert_eq!(exported, 0);

        assert!(!log_path.exists());
        assert!(settings
            .archive_dir
            .join("server1/quality.2026-01-25.log")
            .exists());
        // No JSONL was produced.
        assert!(files_with_extension(&settings.output_json_dir, "jsonl").is_empty());
        assert!(tracker
            .is_file_processed("server1", "quality.2026-01-25.log")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_process_all_logs_consumes_tree_then_noops() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::for_roots(dir.path());
        let tracker = StateTracker::new(&settings.state_db_path);

        let input = settings.input_dir.join("server1");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::write(input.join("a.log"), "RqType=IP ReId=1 Face=10\n").unwrap();
        // Nested directories are scanned too, even oddly named ones.
        std::fs::create_dir_all(input.join("b.log")).unwrap();
        std::fs::write(input.join("b.log/c.log"), "RqType=IP ReId=2 Face=20\n").unwrap();

        let stats = process_all_logs(&settings, &tracker).await.unwrap();
        assert_eq!(stats.files_processed, 2);
        assert_eq!(stats.files_failed, 0);
        assert_eq!(stats.records_exported, 2);

        // Second run: everything consumed, nothing to do.
        let stats = process_all_logs(&settings, &tracker).await.unwrap();
        assert_eq!(stats, ProcessStats::default());
    }
}
