// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Append-only telemetry log
//!
//! One JSON object per line. Each sample is keyed by the controller clock in
//! milliseconds; keys are forced strictly increasing so that a client can
//! poll with the last key it has seen and never receive a sample twice.
//! Rolling the log renames the live file to a timestamped archive and starts
//! an empty one.
//!
//! A line is recorded only once it is completely written. A write that fails
//! or is cancelled halfway is cut off again before anything else is written,
//! and a partial last line found on open is removed.

use chrono::NaiveDateTime;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Telemetry storage failures. Never fatal to the control loop.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("telemetry storage I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode telemetry sample: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("telemetry storage did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid archive name '{0}'")]
    InvalidArchiveName(String),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One logged control cycle. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub key: u64,
    pub datetime: NaiveDateTime,
    /// Target per tank, °C
    pub target: Vec<f64>,
    /// Calibrated reading per tank, `None` when the sensor failed
    pub actual: Vec<Option<f64>>,
}

/// Result of an incremental query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBatch {
    pub samples: Vec<Sample>,
    /// Cursor for the next query: key of the last returned sample, or the
    /// requested cursor when nothing newer exists
    pub next: u64,
}

/// An archived log file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub name: String,
    pub size: u64,
}

/// Telemetry log shared between the control loop and the web server
pub type SharedTelemetryLog = Arc<Mutex<TelemetryLog>>;

/// The live telemetry store
#[derive(Debug)]
pub struct TelemetryLog {
    path: PathBuf,
    file: File,
    samples: Vec<Sample>,
    last_key: u64,
    /// Length of the file up to the last complete line
    len_bytes: u64,
    /// A write may have left a partial line past `len_bytes`
    torn: bool,
}

impl TelemetryLog {
    /// Open the log at `path`, reloading the samples it already holds
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::io(parent, e))?;
            }
        }

        let mut samples: Vec<Sample> = Vec::new();
        let mut complete = 0;
        let mut partial_tail = false;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                complete = content.rfind('\n').map_or(0, |i| i + 1);
                partial_tail = complete < content.len();
                if partial_tail {
                    warn!(
                        "Dropping {} bytes of partial line at the end of {}",
                        content.len() - complete,
                        path.display()
                    );
                }
                for (index, line) in content[..complete].lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Sample>(line) {
                        Ok(sample) if samples.last().map_or(true, |s| sample.key > s.key) => {
                            samples.push(sample)
                        }
                        Ok(sample) => warn!(
                            "Skipping out of order telemetry key {} at {}:{}",
                            sample.key,
                            path.display(),
                            index + 1
                        ),
                        Err(e) => warn!(
                            "Skipping corrupt telemetry line {}:{}: {}",
                            path.display(),
                            index + 1,
                            e
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(&path, e)),
        }

        let file = Self::open_append(&path).await?;
        if partial_tail {
            file.set_len(complete as u64)
                .await
                .map_err(|e| StorageError::io(&path, e))?;
        }
        let last_key = samples.last().map(|s| s.key).unwrap_or(0);
        info!(
            "Telemetry log {} opened with {} samples",
            path.display(),
            samples.len()
        );

        Ok(Self {
            path,
            file,
            samples,
            last_key,
            len_bytes: complete as u64,
            torn: false,
        })
    }

    async fn open_append(path: &Path) -> Result<File, StorageError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Highest key ever issued
    pub fn last_key(&self) -> u64 {
        self.last_key
    }

    /// Append a sample stamped `datetime`. On failure nothing is recorded.
    pub async fn append(
        &mut self,
        datetime: NaiveDateTime,
        target: Vec<f64>,
        actual: Vec<Option<f64>>,
    ) -> Result<Sample, StorageError> {
        let clock_key = datetime.and_utc().timestamp_millis().max(0) as u64;
        let sample = Sample {
            key: clock_key.max(self.last_key + 1),
            datetime,
            target,
            actual,
        };

        let mut line = serde_json::to_string(&sample)?;
        line.push('\n');

        if self.torn {
            self.cut_partial_line().await?;
        }
        // Stays set if this future is dropped before the line is complete
        self.torn = true;
        if let Err(e) = self.write_line(line.as_bytes()).await {
            if let Err(cut) = self.cut_partial_line().await {
                warn!("Partial telemetry line left in place: {}", cut);
            }
            return Err(e);
        }
        self.torn = false;
        self.len_bytes += line.len() as u64;

        self.last_key = sample.key;
        self.samples.push(sample.clone());
        Ok(sample)
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<(), StorageError> {
        self.file
            .write_all(line)
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| StorageError::io(&self.path, e))
    }

    /// Truncate back to the last complete line. Waits for a write still in
    /// flight before truncating.
    async fn cut_partial_line(&mut self) -> Result<(), StorageError> {
        self.file
            .set_len(self.len_bytes)
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;
        self.torn = false;
        debug!(
            "Telemetry log {} cut back to {} bytes",
            self.path.display(),
            self.len_bytes
        );
        Ok(())
    }

    /// Samples with key greater than `since`, oldest first, at most `max`
    pub fn query(&self, since: u64, max: usize) -> TelemetryBatch {
        let first = self.samples.partition_point(|s| s.key <= since);
        let samples: Vec<Sample> = self.samples[first..].iter().take(max).cloned().collect();
        let next = samples.last().map(|s| s.key).unwrap_or(since);
        TelemetryBatch { samples, next }
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.last()
    }

    fn stem(&self) -> String {
        log_stem(&self.path)
    }

    fn directory(&self) -> PathBuf {
        log_directory(&self.path)
    }

    /// Archive the current store and start an empty one.
    ///
    /// Returns the archive path. On failure the current store is left in
    /// place and keeps receiving appends.
    pub async fn roll(&mut self, now: NaiveDateTime) -> Result<PathBuf, StorageError> {
        if self.torn {
            self.cut_partial_line().await?;
        }
        self.file
            .sync_all()
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;

        let directory = self.directory();
        let base = format!("{}-{}", self.stem(), now.format("%Y%m%d-%H%M%S"));
        let mut archive = directory.join(format!("{}.jsonl", base));
        let mut suffix = 1;
        while tokio::fs::try_exists(&archive).await.unwrap_or(false) {
            archive = directory.join(format!("{}-{}.jsonl", base, suffix));
            suffix += 1;
        }

        tokio::fs::rename(&self.path, &archive)
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;

        match Self::open_append(&self.path).await {
            Ok(file) => {
                self.file = file;
                self.samples.clear();
                self.len_bytes = 0;
                info!("Telemetry log rolled to {}", archive.display());
                Ok(archive)
            }
            Err(err) => {
                // Put the live file back so appends keep landing in it
                if let Err(e) = tokio::fs::rename(&archive, &self.path).await {
                    warn!("Failed to restore {} after roll failure: {}", self.path.display(), e);
                }
                Err(err)
            }
        }
    }

    /// Archived logs belonging to this store, sorted by name
    pub async fn archives(&self) -> Result<Vec<ArchiveInfo>, StorageError> {
        archives(&self.path).await
    }

    /// Read back an archive listed by [`TelemetryLog::archives`]
    pub async fn read_archive(&self, name: &str) -> Result<Vec<Sample>, StorageError> {
        read_archive(&self.path, name).await
    }
}

fn log_stem(log_path: &Path) -> String {
    log_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "log".to_string())
}

fn log_directory(log_path: &Path) -> PathBuf {
    log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Archives of the live log at `log_path`, sorted by name.
///
/// Archives are never written again once rolled, so this needs no access to
/// the live [`TelemetryLog`] and does not hold up appends.
pub async fn archives(log_path: &Path) -> Result<Vec<ArchiveInfo>, StorageError> {
    let directory = log_directory(log_path);
    let prefix = format!("{}-", log_stem(log_path));
    let mut entries = tokio::fs::read_dir(&directory)
        .await
        .map_err(|e| StorageError::io(&directory, e))?;

    let mut archives = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StorageError::io(&directory, e))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name.ends_with(".jsonl") {
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            archives.push(ArchiveInfo { name, size });
        }
    }
    archives.sort_by(|a, b| a.name.cmp(&b.name));
    debug!("Found {} telemetry archives", archives.len());
    Ok(archives)
}

/// Read back an archive of the live log at `log_path`
pub async fn read_archive(log_path: &Path, name: &str) -> Result<Vec<Sample>, StorageError> {
    let valid = name.starts_with(&format!("{}-", log_stem(log_path)))
        && name.ends_with(".jsonl")
        && !name.contains(['/', '\\'])
        && !name.contains("..");
    if !valid {
        return Err(StorageError::InvalidArchiveName(name.to_string()));
    }

    let path = log_directory(log_path).join(name);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| StorageError::io(&path, e))?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use tempfile::tempdir;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 1)
            .unwrap()
            .and_hms_opt(13, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_keys_strictly_increase() {
        let dir = tempdir().unwrap();
        let mut log = TelemetryLog::open(dir.path().join("log.jsonl")).await.unwrap();

        let a = log.append(t0(), vec![30.0], vec![Some(29.9)]).await.unwrap();
        // Same timestamp and a clock that went backwards
        let b = log.append(t0(), vec![30.0], vec![None]).await.unwrap();
        let c = log
            .append(t0() - Duration::hours(1), vec![30.0], vec![Some(30.1)])
            .await
            .unwrap();
        assert!(a.key < b.key && b.key < c.key);
    }

    #[tokio::test]
    async fn test_query_is_bounded_and_exclusive() {
        let dir = tempdir().unwrap();
        let mut log = TelemetryLog::open(dir.path().join("log.jsonl")).await.unwrap();
        for i in 0..10 {
            log.append(t0() + Duration::seconds(i), vec![30.0], vec![Some(30.0)])
                .await
                .unwrap();
        }

        let first = log.query(0, 4);
        assert_eq!(first.samples.len(), 4);
        let second = log.query(first.next, 100);
        assert_eq!(second.samples.len(), 6);
        assert!(second.samples.iter().all(|s| s.key > first.next));

        let empty = log.query(second.next, 100);
        assert!(empty.samples.is_empty());
        assert_eq!(empty.next, second.next);
    }

    #[tokio::test]
    async fn test_reopen_reloads_and_skips_corrupt_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        {
            let mut log = TelemetryLog::open(&path).await.unwrap();
            log.append(t0(), vec![30.0], vec![Some(30.0)]).await.unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n");
        std::fs::write(&path, content).unwrap();

        let mut log = TelemetryLog::open(&path).await.unwrap();
        assert_eq!(log.len(), 1);
        let next = log.append(t0(), vec![31.0], vec![None]).await.unwrap();
        assert!(next.key > log.query(0, 1).samples[0].key);
    }

    #[tokio::test]
    async fn test_partial_last_line_is_cut_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        {
            let mut log = TelemetryLog::open(&path).await.unwrap();
            log.append(t0(), vec![30.0], vec![Some(30.0)]).await.unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"key\":17198");
        std::fs::write(&path, &content).unwrap();

        let mut log = TelemetryLog::open(&path).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
        log.append(t0() + Duration::seconds(1), vec![31.0], vec![None])
            .await
            .unwrap();
        drop(log);

        let log = TelemetryLog::open(&path).await.unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_append_leaves_no_partial_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut log = TelemetryLog::open(&path).await.unwrap();
        log.append(t0(), vec![30.0], vec![Some(30.0)]).await.unwrap();

        // Dropped at its first suspension point, before the flush completes
        let _ = tokio::time::timeout(
            std::time::Duration::ZERO,
            log.append(t0() + Duration::seconds(1), vec![30.5], vec![Some(30.2)]),
        )
        .await;
        log.append(t0() + Duration::seconds(2), vec![31.0], vec![Some(30.4)])
            .await
            .unwrap();
        let in_memory: Vec<u64> = log.query(0, 100).samples.iter().map(|s| s.key).collect();
        drop(log);

        let reopened = TelemetryLog::open(&path).await.unwrap();
        let on_disk: Vec<u64> = reopened.query(0, 100).samples.iter().map(|s| s.key).collect();
        assert_eq!(on_disk, in_memory);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), in_memory.len());
    }

    #[tokio::test]
    async fn test_read_archive_rejects_foreign_names() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::open(dir.path().join("log.jsonl")).await.unwrap();
        assert!(matches!(
            read_archive(log.path(), "../secret.jsonl").await,
            Err(StorageError::InvalidArchiveName(_))
        ));
        assert!(matches!(
            log.read_archive("other-20240701-130000.jsonl").await,
            Err(StorageError::InvalidArchiveName(_))
        ));
    }
}
