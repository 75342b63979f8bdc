//! Daemon output capture.
//!
//! Lines go into an in-memory ring buffer and are appended to
//! `<logs_dir>/<app>.log` by a background writer task, so output survives
//! engine restarts.

use crate::error::Result;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type SyncMutex<T> = parking_lot::Mutex<T>;

/// Default maximum number of log lines kept in memory per daemon.
pub const DEFAULT_MAX_LOG_LINES: usize = 10_000;

pub struct LogCapture {
    app: String,
    /// Uses SyncMutex - pushed to from the synchronous output callback.
    lines: SyncMutex<VecDeque<String>>,
    max_lines: usize,
    dropped_count: AtomicUsize,
    file_path: Option<PathBuf>,
    writer_tx: SyncMutex<Option<mpsc::UnboundedSender<String>>>,
    writer: SyncMutex<Option<JoinHandle<()>>>,
}

impl LogCapture {
    /// Memory-only capture.
    pub fn in_memory(app: &str, max_lines: usize) -> Arc<Self> {
        Arc::new(Self {
            app: app.to_string(),
            lines: SyncMutex::new(VecDeque::new()),
            max_lines: max_lines.max(1),
            dropped_count: AtomicUsize::new(0),
            file_path: None,
            writer_tx: SyncMutex::new(None),
            writer: SyncMutex::new(None),
        })
    }

    /// Capture that also appends to `file_path`. Must be called inside a
    /// tokio runtime.
    pub fn with_file(app: &str, file_path: PathBuf, max_lines: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(app.to_string(), file_path.clone(), rx));
        Arc::new(Self {
            app: app.to_string(),
            lines: SyncMutex::new(VecDeque::new()),
            max_lines: max_lines.max(1),
            dropped_count: AtomicUsize::new(0),
            file_path: Some(file_path),
            writer_tx: SyncMutex::new(Some(tx)),
            writer: SyncMutex::new(Some(writer)),
        })
    }

    pub fn push(&self, line: &str, is_stderr: bool) {
        let line = if is_stderr {
            format!("[stderr] {}", line)
        } else {
            line.to_string()
        };
        if let Some(tx) = self.writer_tx.lock().as_ref() {
            let _ = tx.send(line.clone());
        }
        let mut lines = self.lines.lock();
        lines.push_back(line);
        if lines.len() > self.max_lines {
            lines.pop_front();
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Last `tail` lines (all lines when `None`).
    pub fn tail(&self, tail: Option<usize>) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = tail.map(|n| lines.len().saturating_sub(n)).unwrap_or(0);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Flush pending lines to disk and stop the writer.
    pub async fn shutdown(&self) {
        self.writer_tx.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::debug!(app = %self.app, "Log writer ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
    }
}

async fn write_lines(app: String, path: PathBuf, mut rx: mpsc::UnboundedReceiver<String>) {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(app = %app, "Cannot open log file '{}': {}", path.display(), e);
            return;
        }
    };
    while let Some(line) = rx.recv().await {
        if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
            tracing::warn!(app = %app, "Failed writing log file: {}", e);
            return;
        }
    }
    let _ = file.flush().await;
}

/// Last `tail` lines of a log file on disk.
pub async fn read_file_tail(path: &Path, tail: Option<usize>) -> Result<Vec<String>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let lines: Vec<&str> = content.lines().collect();
    let skip = tail.map(|n| lines.len().saturating_sub(n)).unwrap_or(0);
    Ok(lines[skip..].iter().map(|s| s.to_string()).collect())
}
