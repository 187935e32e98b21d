use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::VerifierSection;
use crate::error::ConfigError;
use crate::workflow::{Identifier, WorkflowError, WorkflowResult};

/// Chromium writes these while a download is still streaming.
const IN_PROGRESS_SUFFIXES: [&str; 3] = [".crdownload", ".tmp", ".part"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Verified,
    Failed,
}

/// One year's archive request. Status moves strictly forward; a task that
/// failed or verified never changes again, retries create a fresh task.
#[derive(Debug)]
pub struct DownloadTask {
    identifier: Identifier,
    year: u16,
    destination: PathBuf,
    min_bytes: u64,
    status: TaskStatus,
    archive_path: Option<PathBuf>,
}

impl DownloadTask {
    pub fn new(
        identifier: Identifier,
        year: u16,
        destination: impl Into<PathBuf>,
        min_bytes: u64,
    ) -> Self {
        Self {
            identifier,
            year,
            destination: destination.into(),
            min_bytes,
            status: TaskStatus::Pending,
            archive_path: None,
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Minimum plausible archive size for this request; anything smaller is
    /// treated as still downloading.
    pub fn min_bytes(&self) -> u64 {
        self.min_bytes
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn archive_path(&self) -> Option<&Path> {
        self.archive_path.as_deref()
    }

    pub fn advance(&mut self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        let allowed = matches!(
            (self.status, next),
            (Pending, Downloading)
                | (Pending, Verified)
                | (Pending, Failed)
                | (Downloading, Verified)
                | (Downloading, Failed)
        );
        if allowed {
            self.status = next;
        }
        allowed
    }
}

/// Seam between the state machine and the filesystem-facing verifier, so the
/// machine is testable without a download directory.
#[async_trait(?Send)]
pub trait ArchiveVerifier {
    /// Idempotent skip point: returns true when the destination already holds
    /// a structurally sound archive from an earlier run.
    async fn check_existing(&self, task: &mut DownloadTask) -> WorkflowResult<bool>;

    /// Waits for the download to land and settle, then runs the structural
    /// integrity check. Only after both does the task become `Verified`.
    async fn verify(&self, task: &mut DownloadTask) -> WorkflowResult<()>;
}

#[derive(Debug, Clone)]
pub struct DownloadVerifier {
    config: VerifierSection,
    pattern: Regex,
}

impl DownloadVerifier {
    pub fn new(config: VerifierSection) -> crate::error::Result<Self> {
        let pattern = Regex::new(&config.archive_pattern).map_err(|source| ConfigError::Pattern {
            source,
            pattern: config.archive_pattern.clone(),
        })?;
        Ok(Self { config, pattern })
    }

    /// Latest file in the destination matching the archive pattern, skipping
    /// in-progress download markers. Partial files are left untouched.
    fn latest_candidate(&self, dir: &Path) -> WorkflowResult<Option<(PathBuf, u64)>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(WorkflowError::Io {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };
        let mut best: Option<(PathBuf, u64, SystemTime)> = None;
        for entry in entries {
            let entry = entry.map_err(|source| WorkflowError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if IN_PROGRESS_SUFFIXES
                .iter()
                .any(|suffix| name.ends_with(suffix))
            {
                continue;
            }
            if !self.pattern.is_match(&name) {
                continue;
            }
            let metadata = entry.metadata().map_err(|source| WorkflowError::Io {
                path: path.clone(),
                source,
            })?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let newer = best
                .as_ref()
                .map(|(_, _, current)| modified > *current)
                .unwrap_or(true);
            if newer {
                best = Some((path, metadata.len(), modified));
            }
        }
        Ok(best.map(|(path, len, _)| (path, len)))
    }

    /// Reads every entry of the container in full so the central directory
    /// and all CRCs are actually checked, not just the header.
    async fn structural_check(&self, path: &Path) -> WorkflowResult<()> {
        let path_owned = path.to_path_buf();
        let spreadsheets = tokio::task::spawn_blocking(move || inspect_archive(&path_owned))
            .await
            .map_err(|err| WorkflowError::Io {
                path: path.to_path_buf(),
                source: io::Error::other(err),
            })??;
        if spreadsheets == 0 {
            warn!(path = %path.display(), "archive holds no spreadsheet entries");
        }
        Ok(())
    }
}

fn inspect_archive(path: &Path) -> WorkflowResult<usize> {
    let corrupt = |detail: String| WorkflowError::CorruptArchive {
        path: path.to_path_buf(),
        detail,
    };
    let file = File::open(path).map_err(|source| WorkflowError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|err| corrupt(err.to_string()))?;
    let mut spreadsheets = 0usize;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| corrupt(err.to_string()))?;
        if entry.name().to_lowercase().ends_with(".xlsx") {
            spreadsheets += 1;
        }
        // CRC mismatches only surface when the entry is read to the end.
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| corrupt(format!("entry {}: {err}", entry.name())))?;
    }
    Ok(spreadsheets)
}

#[async_trait(?Send)]
impl ArchiveVerifier for DownloadVerifier {
    async fn check_existing(&self, task: &mut DownloadTask) -> WorkflowResult<bool> {
        let Some((path, size)) = self.latest_candidate(task.destination())? else {
            return Ok(false);
        };
        if size < task.min_bytes() {
            return Ok(false);
        }
        if self.structural_check(&path).await.is_err() {
            debug!(path = %path.display(), "existing archive failed integrity check, will re-download");
            return Ok(false);
        }
        info!(
            identifier = %task.identifier(),
            year = task.year(),
            path = %path.display(),
            "archive already verified, skipping"
        );
        task.archive_path = Some(path);
        task.advance(TaskStatus::Verified);
        Ok(true)
    }

    async fn verify(&self, task: &mut DownloadTask) -> WorkflowResult<()> {
        task.advance(TaskStatus::Downloading);
        let deadline = Instant::now() + self.config.poll_timeout();
        let mut observed: Option<(PathBuf, u64, Instant)> = None;

        let settled = loop {
            let candidate = self.latest_candidate(task.destination())?;
            let now = Instant::now();
            match candidate {
                Some((path, size)) => {
                    let stable_since = match &observed {
                        Some((seen_path, seen_size, since))
                            if *seen_path == path && *seen_size == size =>
                        {
                            *since
                        }
                        _ => {
                            observed = Some((path.clone(), size, now));
                            now
                        }
                    };
                    // Two polls with identical size, separated by the quiet
                    // interval, before the file counts as complete.
                    if now.duration_since(stable_since) >= self.config.quiet_interval()
                        && size >= task.min_bytes()
                    {
                        break path;
                    }
                    if now >= deadline {
                        task.advance(TaskStatus::Failed);
                        return Err(WorkflowError::SlowDownload(format!(
                            "{} ({size} bytes, still settling)",
                            path.display()
                        )));
                    }
                }
                None => {
                    if now >= deadline {
                        task.advance(TaskStatus::Failed);
                        return Err(WorkflowError::Timeout(format!(
                            "archive for {} year {}",
                            task.identifier(),
                            task.year()
                        )));
                    }
                }
            }
            sleep(self.config.poll_interval()).await;
        };

        if let Err(err) = self.structural_check(&settled).await {
            task.advance(TaskStatus::Failed);
            return Err(err);
        }
        task.archive_path = Some(settled.clone());
        task.advance(TaskStatus::Verified);
        info!(
            identifier = %task.identifier(),
            year = task.year(),
            path = %settled.display(),
            "archive verified"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ident() -> Identifier {
        Identifier::parse("7707083893").unwrap()
    }

    fn section(poll_timeout_secs: u64, quiet_ms: u64, poll_ms: u64, min_bytes: u64) -> VerifierSection {
        VerifierSection {
            poll_timeout_secs,
            quiet_interval_ms: quiet_ms,
            poll_interval_ms: poll_ms,
            min_archive_bytes: min_bytes,
            archive_pattern: r"(?i)\.zip$".to_string(),
        }
    }

    fn write_valid_zip(path: &Path) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        writer.start_file("report_2023.xlsx", options).unwrap();
        writer.write_all(&vec![0u8; 4096]).unwrap();
        writer.start_file("notes.txt", options).unwrap();
        writer.write_all(b"annual disclosure").unwrap();
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn valid_archive_reaches_verified() {
        let dir = tempfile::tempdir().unwrap();
        write_valid_zip(&dir.path().join("BFO_7707083893.zip"));

        let verifier = DownloadVerifier::new(section(5, 50, 20, 64)).unwrap();
        let mut task = DownloadTask::new(ident(), 2023, dir.path(), 64);
        verifier.verify(&mut task).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Verified);
        assert!(task.archive_path().is_some());
    }

    #[tokio::test]
    async fn truncated_archive_is_corrupt_never_verified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BFO_7707083893.zip");
        write_valid_zip(&path);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let verifier = DownloadVerifier::new(section(5, 50, 20, 64)).unwrap();
        let mut task = DownloadTask::new(ident(), 2023, dir.path(), 64);
        let err = verifier.verify(&mut task).await.unwrap_err();
        assert!(matches!(err, WorkflowError::CorruptArchive { .. }));
        assert_eq!(task.status(), TaskStatus::Failed);
        // Partial files are never auto-deleted.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn missing_download_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = DownloadVerifier::new(section(1, 50, 20, 64)).unwrap();
        let mut task = DownloadTask::new(ident(), 2023, dir.path(), 64);
        let err = verifier.verify(&mut task).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Timeout(_)));
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn in_progress_markers_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("archive.zip.crdownload"), b"partial").unwrap();

        let verifier = DownloadVerifier::new(section(1, 50, 20, 4)).unwrap();
        let mut task = DownloadTask::new(ident(), 2023, dir.path(), 4);
        let err = verifier.verify(&mut task).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Timeout(_)));
    }

    #[tokio::test]
    async fn growing_file_is_not_checked_until_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BFO_7707083893.zip");

        // Simulate a streaming download: garbage prefix first, then the full
        // valid archive replaces it while the verifier is already polling.
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            std::fs::write(&writer_path, b"PK\x03\x04 partial").unwrap();
            for _ in 0..4 {
                tokio::time::sleep(std::time::Duration::from_millis(60)).await;
                let mut file = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&writer_path)
                    .unwrap();
                file.write_all(&vec![0u8; 512]).unwrap();
            }
            write_valid_zip(&writer_path);
        });

        let verifier = DownloadVerifier::new(section(10, 200, 40, 64)).unwrap();
        let mut task = DownloadTask::new(ident(), 2023, dir.path(), 64);
        verifier.verify(&mut task).await.unwrap();
        writer.await.unwrap();
        // Verification only succeeds once the final, stable content landed;
        // the growing garbage prefix was never handed to the checker.
        assert_eq!(task.status(), TaskStatus::Verified);
    }

    #[tokio::test]
    async fn check_existing_skips_verified_archive() {
        let dir = tempfile::tempdir().unwrap();
        write_valid_zip(&dir.path().join("BFO_7707083893.zip"));

        let verifier = DownloadVerifier::new(section(1, 50, 20, 64)).unwrap();
        let mut task = DownloadTask::new(ident(), 2023, dir.path(), 64);
        assert!(verifier.check_existing(&mut task).await.unwrap());
        assert_eq!(task.status(), TaskStatus::Verified);

        let mut fresh = DownloadTask::new(ident(), 2022, dir.path().join("missing"), 64);
        assert!(!verifier.check_existing(&mut fresh).await.unwrap());
        assert_eq!(fresh.status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn task_minimum_size_governs_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_valid_zip(&dir.path().join("BFO_7707083893.zip"));

        // The section carries a small default, but the task asks for more
        // than the archive holds.
        let verifier = DownloadVerifier::new(section(1, 50, 20, 4)).unwrap();
        let mut task = DownloadTask::new(ident(), 2023, dir.path(), 1 << 20);
        assert!(!verifier.check_existing(&mut task).await.unwrap());
        assert_eq!(task.status(), TaskStatus::Pending);

        let err = verifier.verify(&mut task).await.unwrap_err();
        assert!(matches!(err, WorkflowError::SlowDownload(_)));
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[test]
    fn broken_archive_pattern_is_a_config_error() {
        let mut bad = section(1, 50, 20, 64);
        bad.archive_pattern = "([".to_string();
        let err = DownloadVerifier::new(bad).unwrap_err();
        assert!(matches!(err, ConfigError::Pattern { .. }));
    }

    #[test]
    fn status_never_moves_backward() {
        let mut task = DownloadTask::new(ident(), 2023, "/tmp/x", 64);
        assert!(task.advance(TaskStatus::Downloading));
        assert!(task.advance(TaskStatus::Verified));
        assert!(!task.advance(TaskStatus::Failed));
        assert!(!task.advance(TaskStatus::Downloading));
        assert_eq!(task.status(), TaskStatus::Verified);
    }
}
