//! File tailer - follows the worker log file across rotation and truncation.
//!
//! Polling based. Each poll compares the path's current identity (device and
//! inode on unix) and size against the open handle:
//!
//! - identity changed: drain what is left in the old handle, then reopen the
//!   new file at offset 0
//! - size shrank, or the first bytes changed: the file was truncated in place,
//!   restart at offset 0
//! - path missing: drain and release the handle, report `waiting`, retry on the
//!   next poll forever
//!
//! A trailing line without its newline is held back until the newline shows up.

use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::TailerConfig;
use crate::logs::publisher::LogPublisher;

/// Bytes compared at the start of the file to catch truncate-and-rewrite.
const HEAD_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TailState {
    /// File open and being followed
    Attached,
    /// File missing or unreadable; retrying
    Waiting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TailerStatus {
    pub path: PathBuf,
    pub state: TailState,
    pub offset: u64,
    pub rotations: u64,
    pub lines_read: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn identity_of(meta: &Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn identity_of(_meta: &Metadata) -> Option<FileIdentity> {
    None
}

/// Blocking half of the tailer; runs on the blocking pool.
#[derive(Debug)]
struct TailCursor {
    path: PathBuf,
    from_start: bool,
    file: Option<File>,
    identity: Option<FileIdentity>,
    offset: u64,
    partial: Vec<u8>,
    head: Vec<u8>,
    /// Set after the first poll; later attaches always read from offset 0.
    initialized: bool,
    ever_attached: bool,
    rotations: u64,
    lines_read: u64,
    last_error: Option<String>,
}

impl TailCursor {
    fn new(config: &TailerConfig) -> Self {
        Self {
            path: config.path.clone(),
            from_start: config.from_start,
            file: None,
            identity: None,
            offset: 0,
            partial: Vec::new(),
            head: Vec::new(),
            initialized: false,
            ever_attached: false,
            rotations: 0,
            lines_read: 0,
            last_error: None,
        }
    }

    fn status(&self) -> TailerStatus {
        TailerStatus {
            path: self.path.clone(),
            state: if self.file.is_some() {
                TailState::Attached
            } else {
                TailState::Waiting
            },
            offset: self.offset,
            rotations: self.rotations,
            lines_read: self.lines_read,
            last_error: self.last_error.clone(),
        }
    }

    fn poll(&mut self) -> io::Result<Vec<String>> {
        let result = self.poll_inner();
        self.initialized = true;
        result
    }

    fn poll_inner(&mut self) -> io::Result<Vec<String>> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) => {
                self.last_error = Some(e.to_string());
                return Ok(self.release());
            }
        };

        let mut lines = Vec::new();
        if self.file.is_some() {
            if identity_of(&meta) != self.identity {
                lines = self.release();
            } else if meta.len() < self.offset || self.head_changed()? {
                self.restart_from_zero();
            }
        }

        if self.file.is_none() {
            self.attach(&meta)?;
        }

        lines.extend(self.read_new()?);
        self.last_error = None;
        Ok(lines)
    }

    fn attach(&mut self, path_meta: &Metadata) -> io::Result<()> {
        let file = File::open(&self.path)?;
        let meta = file.metadata().unwrap_or_else(|_| path_meta.clone());

        self.offset = if !self.initialized && !self.from_start {
            meta.len()
        } else {
            0
        };
        if self.ever_attached {
            self.rotations += 1;
        }
        self.identity = identity_of(&meta);
        self.partial.clear();
        self.file = Some(file);
        self.ever_attached = true;
        self.head = self.read_head()?;

        tracing::info!(
            path = %self.path.display(),
            offset = self.offset,
            rotations = self.rotations,
            "Tailer attached"
        );
        Ok(())
    }

    /// Drain the old handle and drop it. The unterminated tail of the old
    /// file is emitted as a final line.
    fn release(&mut self) -> Vec<String> {
        if self.file.is_none() {
            return Vec::new();
        }
        let mut lines = self.read_new().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to drain rotated log file");
            Vec::new()
        });
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            lines.push(decode_line(&rest));
            self.lines_read += 1;
        }
        self.file = None;
        self.identity = None;
        self.offset = 0;
        self.head.clear();
        tracing::info!(path = %self.path.display(), "Tailer released file");
        lines
    }

    fn restart_from_zero(&mut self) {
        tracing::info!(
            path = %self.path.display(),
            previous_offset = self.offset,
            "Log file truncated, restarting from offset 0"
        );
        self.offset = 0;
        self.partial.clear();
        self.head.clear();
        self.rotations += 1;
    }

    fn read_new(&mut self) -> io::Result<Vec<String>> {
        let Some(file) = self.file.as_mut() else {
            return Ok(Vec::new());
        };

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        let n = file.read_to_end(&mut buf)?;
        self.offset += n as u64;
        self.partial.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            lines.push(decode_line(&raw));
        }
        self.lines_read += lines.len() as u64;

        if self.head.len() < HEAD_BYTES {
            self.head = self.read_head()?;
        }
        Ok(lines)
    }

    fn read_head(&mut self) -> io::Result<Vec<u8>> {
        let Some(file) = self.file.as_mut() else {
            return Ok(Vec::new());
        };
        file.seek(SeekFrom::Start(0))?;
        let mut head = Vec::with_capacity(HEAD_BYTES);
        (&mut *file).take(HEAD_BYTES as u64).read_to_end(&mut head)?;
        // Only bytes already consumed are trusted as a fingerprint.
        head.truncate(self.offset.min(HEAD_BYTES as u64) as usize);
        Ok(head)
    }

    fn head_changed(&mut self) -> io::Result<bool> {
        if self.head.is_empty() {
            return Ok(false);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };
        file.seek(SeekFrom::Start(0))?;
        let mut current = Vec::with_capacity(self.head.len());
        (&mut *file).take(self.head.len() as u64).read_to_end(&mut current)?;
        Ok(current != self.head)
    }
}

fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Async front of the tailer: polls on the blocking pool and publishes status.
pub struct FileTailer {
    config: TailerConfig,
    cursor: Option<TailCursor>,
    status_tx: watch::Sender<TailerStatus>,
}

impl FileTailer {
    pub fn new(config: TailerConfig) -> Self {
        let cursor = TailCursor::new(&config);
        let (status_tx, _) = watch::channel(cursor.status());
        Self {
            config,
            cursor: Some(cursor),
            status_tx,
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TailerStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> TailerStatus {
        self.status_tx.borrow().clone()
    }

    /// Read whatever was appended since the last poll. Missing files are not
    /// an error; they yield no lines and a `waiting` status.
    pub async fn poll(&mut self) -> io::Result<Vec<String>> {
        let mut cursor = self
            .cursor
            .take()
            .unwrap_or_else(|| TailCursor::new(&self.config));

        let (cursor, result) = tokio::task::spawn_blocking(move || {
            let result = cursor.poll();
            (cursor, result)
        })
        .await
        .map_err(io::Error::other)?;

        let status = cursor.status();
        self.cursor = Some(cursor);

        let previous = self.status_tx.borrow().state;
        if previous != status.state && status.state == TailState::Waiting {
            tracing::warn!(
                path = %status.path.display(),
                error = status.last_error.as_deref().unwrap_or("unknown"),
                "Log file unavailable, tailer waiting"
            );
        }
        self.status_tx.send_replace(status);
        result
    }

    /// Poll until cancelled, handing every line to the publisher.
    pub async fn run(mut self, publisher: LogPublisher, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            path = %self.config.path.display(),
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Tailer started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll().await {
                        Ok(lines) => {
                            for line in lines {
                                publisher.publish_line(&line);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Tailer poll failed");
                        }
                    }
                }
            }
        }

        tracing::info!("Tailer stopped");
    }
}
