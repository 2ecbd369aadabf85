//! Remote log collection over SFTP
//!
//! Fetches not-yet-seen `.log` files from each configured server into a
//! per-server subdirectory of the input tree. Only files whose embedded
//! `YYYY-MM-DD` date is yesterday or older are taken; same-day logs may
//! still be written to and are left for a later run. Files already in the
//! ledger, the input tree, or the archive tree are never re-fetched.
//!
//! libssh2 is a blocking library, so all transport work runs inside
//! `tokio::task::spawn_blocking`. One server's failure is logged and never
//! prevents collection from the remaining servers.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{Settings, SshServer};
use crate::state::StateTracker;
use crate::transcode::log_date_from_filename;

/// Credentials and timeout shared by every server connection
#[derive(Debug, Clone)]
pub struct SftpConfig {
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
}

/// Collect new log files from every configured server
///
/// Returns the total number of files downloaded.
pub async fn collect_from_servers(settings: &Settings, tracker: &StateTracker) -> Result<usize> {
    let servers = &settings.ssh_servers;
    if servers.is_empty() {
        warn!("No SFTP servers configured, skipping collection");
        return Ok(0);
    }

    let (Some(username), Some(password)) = (&settings.ssh_user, &settings.ssh_password) else {
        error!("SSH_USER or SSH_PASSWORD not configured, skipping collection");
        return Ok(0);
    };

    let config = SftpConfig {
        username: username.clone(),
        password: password.clone(),
        connect_timeout: Duration::from_secs(settings.ssh_connect_timeout_secs),
    };

    let mut total = 0;
    for server in servers {
        match collect_from_server(settings, tracker, server, &config).await {
            Ok(downloaded) => total += downloaded,
            Err(e) => {
                error!(server = %server.name, host = %server.host, error = %e,
                       "Collection failed for server");
            },
        }
    }

    info!(downloaded = total, "Collection complete");
    Ok(total)
}

/// Collect from one server: list, filter, download
async fn collect_from_server(
    settings: &Settings,
    tracker: &StateTracker,
    server: &SshServer,
    config: &SftpConfig,
) -> Result<usize> {
    let today = Utc::now().date_naive();

    let filenames = {
        let server = server.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || list_remote_log_files(&server, &config))
            .await
            .context("SFTP listing task panicked")??
    };
    info!(server = %server.name, entries = filenames.len(), "Listed remote directory");

    let dest_dir = settings.input_dir.join(&server.name);
    std::fs::create_dir_all(&dest_dir)
        .with_context(|| format!("Failed to create input directory: {}", dest_dir.display()))?;

    let mut wanted: Vec<(String, PathBuf)> = Vec::new();
    for filename in filenames {
        if !is_collectable(&filename, today) {
            debug!(server = %server.name, filename, "Skipping (not a dated, settled .log)");
            continue;
        }

        if tracker.is_file_processed(&server.name, &filename).await? {
            debug!(server = %server.name, filename, "Skipping (already in ledger)");
            continue;
        }

        let local_path = dest_dir.join(&filename);
        let archive_path = settings.archive_dir.join(&server.name).join(&filename);
        if local_path.exists() || archive_path.exists() {
            debug!(server = %server.name, filename, "Skipping (already present locally)");
            continue;
        }

        wanted.push((remote_path(&server.remote_dir, &filename), local_path));
    }

    if wanted.is_empty() {
        info!(server = %server.name, "Nothing new to collect");
        return Ok(0);
    }

    let downloaded = {
        let server = server.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || download_files(&server, &config, &wanted))
            .await
            .context("SFTP download task panicked")??
    };

    info!(server = %server.name, downloaded, "Server collection complete");
    Ok(downloaded)
}

/// Date-threshold and suffix policy for one remote filename
///
/// Collectable means: `.log` suffix (case-insensitive) and an embedded date
/// strictly before today. Dateless, same-day, and future-dated files are
/// skipped; same-day logs may still be partially written.
pub fn is_collectable(filename: &str, today: NaiveDate) -> bool {
    if !filename.to_lowercase().ends_with(".log") {
        return false;
    }
    match log_date_from_filename(filename) {
        Some(date) => date < today,
        None => false,
    }
}

fn remote_path(remote_dir: &str, filename: &str) -> String {
    format!("{}/{}", remote_dir.trim_end_matches('/'), filename)
}

/// Open an authenticated SSH session to the server (blocking)
fn open_session(server: &SshServer, config: &SftpConfig) -> Result<Session> {
    let address = (server.host.as_str(), server.port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}:{}", server.host, server.port))?
        .next()
        .with_context(|| format!("No address for {}:{}", server.host, server.port))?;

    debug!(server = %server.name, %address, "Connecting over SSH");
    let stream = TcpStream::connect_timeout(&address, config.connect_timeout)
        .with_context(|| format!("Failed to connect to {}", address))?;

    let mut session = Session::new().context("Failed to create SSH session")?;
    session.set_tcp_stream(stream);
    session.handshake().context("SSH handshake failed")?;
    session
        .userauth_password(&config.username, &config.password)
        .with_context(|| format!("SSH authentication failed for {}", config.username))?;

    Ok(session)
}

/// List the plain filenames in the server's remote directory (blocking)
fn list_remote_log_files(server: &SshServer, config: &SftpConfig) -> Result<Vec<String>> {
    let session = open_session(server, config)?;
    let sftp = session.sftp().context("Failed to open SFTP channel")?;

    let entries = sftp
        .readdir(std::path::Path::new(&server.remote_dir))
        .with_context(|| format!("Failed to list remote directory: {}", server.remote_dir))?;

    Ok(entries
        .into_iter()
        .filter(|(_, stat)| stat.is_file())
        .filter_map(|(path, _)| path.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect())
}

/// Download each (remote, local) pair over one SFTP session (blocking)
fn download_files(
    server: &SshServer,
    config: &SftpConfig,
    files: &[(String, PathBuf)],
) -> Result<usize> {
    let session = open_session(server, config)?;
    let sftp = session.sftp().context("Failed to open SFTP channel")?;

    let mut downloaded = 0;
    for (remote, local) in files {
        info!(server = %server.name, remote = %remote, local = %local.display(), "Downloading");

        let mut remote_file = sftp
            .open(std::path::Path::new(remote))
            .with_context(|| format!("Failed to open remote file: {}", remote))?;

        let mut data = Vec::new();
        remote_file
            .read_to_end(&mut data)
            .with_context(|| format!("Failed to read remote file: {}", remote))?;

        let mut local_file = std::fs::File::create(local)
            .with_context(|| format!("Failed to create local file: {}", local.display()))?;
        local_file
            .write_all(&data)
            .with_context(|| format!("Failed to write local file: {}", local.display()))?;

        downloaded += 1;
    }

    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 27).unwrap()
    }

    #[test]
    fn test_is_collectable_date_threshold() {
        // Yesterday and older are settled.
        assert!(is_collectable("quality.2026-01-26.log", today()));
        assert!(is_collectable("quality.2025-12-31.log", today()));
        // Today and future may still be written to.
        assert!(!is_collectable("quality.2026-01-27.log", today()));
        assert!(!is_collectable("quality.2026-02-01.log", today()));
    }

    #[test]
    fn test_is_collectable_requires_embedded_date() {
        assert!(!is_collectable("quality.log", today()));
        assert!(!is_collectable("quality.2026-99-99.log", today()));
    }

    #[test]
    fn test_is_collectable_requires_log_suffix() {
        assert!(!is_collectable("quality.2026-01-26.txt", today()));
        assert!(!is_collectable("quality.2026-01-26.log.bak", today()));
        // Suffix match is case-insensitive.
        assert!(is_collectable("quality.2026-01-26.LOG", today()));
    }

    fn unreachable_server(name: &str) -> SshServer {
        SshServer {
            name: name.to_string(),
            // .invalid is reserved and never resolves.
            host: format!("{name}.invalid"),
            port: 22,
            remote_dir: "/logs".to_string(),
        }
    }

    #[tokio::test]
    async fn test_server_failure_does_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::for_roots(dir.path());
        settings.ssh_user = Some("ingest".to_string());
        settings.ssh_password = Some("secret".to_string());
        settings.ssh_connect_timeout_secs = 1;
        settings.ssh_servers = vec![unreachable_server("s1"), unreachable_server("s2")];
        let tracker = StateTracker::new(&settings.state_db_path);

        // Both servers fail to resolve; each failure is logged and isolated,
        // and the batch still completes with a zero count.
        let downloaded = collect_from_servers(&settings, &tracker).await.unwrap();
        assert_eq!(downloaded, 0);
    }

    #[tokio::test]
    async fn test_missing_credentials_skip_collection() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::for_roots(dir.path());
        settings.ssh_servers = vec![unreachable_server("s1")];
        let tracker = StateTracker::new(&settings.state_db_path);

        let downloaded = collect_from_servers(&settings, &tracker).await.unwrap();
        assert_eq!(downloaded, 0);
    }

    #[test]
    fn test_remote_path_join() {
        assert_eq!(
            remote_path("/var/log/biometrics/", "a.log"),
            "/var/log/biometrics/a.log"
        );
        assert_eq!(
            remote_path("/var/log/biometrics", "a.log"),
            "/var/log/biometrics/a.log"
        );
    }
}
