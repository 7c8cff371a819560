//! Per-job append-only log files.
//!
//! Each job's combined process output lives in `<dir>/<job_id>.log`. The
//! file is created on first append, never rewritten, and kept after the
//! job record itself has been pruned.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::types::JobId;

/// Block size used when scanning a log backwards for its last lines.
const TAIL_BLOCK_SIZE: u64 = 8 * 1024;

/// Largest chunk a single [`JobLogSink::read_range`] call returns.
pub const MAX_RANGE_BYTES: u64 = 1024 * 1024;

/// Error type for job log operations.
#[derive(Debug, thiserror::Error)]
pub enum JobLogError {
    #[error("No log exists for job {0}")]
    NotFound(JobId),

    #[error("Invalid job id for log path: {0:?}")]
    InvalidId(String),

    #[error("Job log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes read from a log starting at some offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    /// Raw bytes appended since the requested offset.
    pub data: Vec<u8>,
    /// Offset to pass to the next incremental read.
    pub next_offset: u64,
}

/// File-backed log sink keyed by job id.
///
/// Appends for the same job are serialized through a per-job lock so that
/// chunks coming from a process's stdout and stderr readers never
/// interleave mid-chunk.
pub struct JobLogSink {
    dir: PathBuf,
    locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobLogSink {
    /// Create a sink rooted at `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding the log files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for a job.
    pub fn path_for(&self, job_id: &str) -> Result<PathBuf, JobLogError> {
        if !is_safe_job_id(job_id) {
            return Err(JobLogError::InvalidId(job_id.to_string()));
        }
        Ok(self.dir.join(format!("{job_id}.log")))
    }

    /// Append raw bytes to a job's log, creating it on first write.
    pub async fn append(&self, job_id: &str, chunk: &[u8]) -> Result<(), JobLogError> {
        let path = self.path_for(job_id)?;
        let lock = self.lock_for(job_id);
        let _guard = lock.lock().await;

        fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(chunk).await?;
        file.flush().await?;
        Ok(())
    }

    /// Whether any output has been written for a job.
    pub async fn exists(&self, job_id: &str) -> bool {
        match self.path_for(job_id) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Return the last `max_lines` lines of a job's log.
    ///
    /// Lines are split on `\n` (a preceding `\r` is dropped) and joined back
    /// with `\n`. A trailing newline does not count as an extra empty line.
    pub async fn read_tail(&self, job_id: &str, max_lines: usize) -> Result<String, JobLogError> {
        let mut file = self.open_existing(job_id).await?;
        if max_lines == 0 {
            return Ok(String::new());
        }

        let len = file.metadata().await?.len();
        let mut start = len;
        let mut buf: Vec<u8> = Vec::new();

        // Scan backwards until the buffer holds more line breaks than needed.
        while start > 0 {
            let block = TAIL_BLOCK_SIZE.min(start);
            start -= block;
            file.seek(SeekFrom::Start(start)).await?;
            let mut chunk = vec![0u8; block as usize];
            file.read_exact(&mut chunk).await?;
            chunk.extend_from_slice(&buf);
            buf = chunk;

            let newlines = buf.iter().filter(|b| **b == b'\n').count();
            if newlines > max_lines {
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let body = text.strip_suffix('\n').unwrap_or(&text);
        let lines: Vec<&str> = body
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .collect();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines[skip..].join("\n"))
    }

    /// Return the bytes appended at or after `offset`, at most
    /// [`MAX_RANGE_BYTES`] of them.
    ///
    /// An offset past the end of the log yields an empty chunk whose
    /// `next_offset` is the current log length. A chunk that stops short of
    /// the end is continued by reading again from its `next_offset`.
    pub async fn read_range(&self, job_id: &str, offset: u64) -> Result<LogChunk, JobLogError> {
        self.read_range_limited(job_id, offset, MAX_RANGE_BYTES).await
    }

    /// [`read_range`](Self::read_range) with a caller-chosen chunk limit.
    pub async fn read_range_limited(
        &self,
        job_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<LogChunk, JobLogError> {
        let mut file = self.open_existing(job_id).await?;
        let len = file.metadata().await?.len();
        if offset >= len {
            return Ok(LogChunk {
                data: Vec::new(),
                next_offset: len,
            });
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let wanted = (len - offset).min(limit);
        let mut data = Vec::with_capacity(wanted as usize);
        file.take(wanted).read_to_end(&mut data).await?;
        let next_offset = offset + data.len() as u64;
        Ok(LogChunk { data, next_offset })
    }

    /// Return at most the last `max_bytes` of a job's log as text.
    pub async fn read_tail_bytes(&self, job_id: &str, max_bytes: u64) -> Result<String, JobLogError> {
        let len = fs::metadata(self.path_for(job_id)?)
            .await
            .map_err(|e| not_found_or_io(job_id, e))?
            .len();
        let chunk = self
            .read_range_limited(job_id, len.saturating_sub(max_bytes), max_bytes)
            .await?;
        Ok(String::from_utf8_lossy(&chunk.data).into_owned())
    }

    /// Drop the append lock for a job once its writer has finished.
    pub fn release(&self, job_id: &str) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(job_id);
        }
    }

    fn lock_for(&self, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(job_id.to_string()).or_default())
    }

    async fn open_existing(&self, job_id: &str) -> Result<fs::File, JobLogError> {
        let path = self.path_for(job_id)?;
        fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(job_id, e))
    }
}

fn not_found_or_io(job_id: &str, err: std::io::Error) -> JobLogError {
    if err.kind() == std::io::ErrorKind::NotFound {
        JobLogError::NotFound(job_id.to_string())
    } else {
        JobLogError::Io(err)
    }
}

/// Job ids become file names, so only a conservative character set is allowed.
fn is_safe_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= 128
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
