//! Append-only per-instance log files.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::warn;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Source tag used for lines written by the supervisor itself.
pub const SUPERVISOR_SOURCE: &str = "apphost";

/// Default number of lines returned by [`LogSink::tail`] callers.
pub const DEFAULT_TAIL_LIMIT: usize = 200;

/// Append-only log stream for one instance.
///
/// Lines go to disk and the most recent ones are also kept in memory so an exit
/// report can carry a diagnostic tail without re-reading the file.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
    source: String,
    recent: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>, source: impl Into<String>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a line produced by the hosted process.
    pub async fn write_line(&self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        {
            let mut recent = self.recent.lock().await;
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(line.to_string());
        }
        self.append(&self.source, line).await;
    }

    /// Append a supervisor note.
    pub async fn note(&self, message: &str) {
        self.append(SUPERVISOR_SOURCE, message).await;
    }

    /// Most recent process output lines kept in memory.
    pub async fn recent(&self) -> Vec<String> {
        self.recent.lock().await.iter().cloned().collect()
    }

    async fn append(&self, source: &str, line: &str) {
        let stamped = format!(
            "[{}] [{}] {}\n",
            Utc::now().format("%Y/%m/%d, %H:%M:%S"),
            source,
            line
        );

        if let Err(e) = self.append_raw(&stamped).await {
            warn!("Failed to write log line to {}: {}", self.path.display(), e);
        }
    }

    async fn append_raw(&self, text: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await
    }

    /// Read the last `limit` lines of the log file.
    ///
    /// A missing file reads as empty.
    pub async fn tail(&self, limit: usize) -> std::io::Result<Vec<String>> {
        read_tail(&self.path, limit).await
    }
}

/// Read the last `limit` lines of a file.
pub async fn read_tail(path: &Path, limit: usize) -> std::io::Result<Vec<String>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(limit);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}
