//! Bounded audit trail with best-effort persistence.
//!
//! Entries live in a fixed-capacity ring buffer; the oldest entry is dropped
//! once it is full. [`AuditLog::flush`] appends pending entries to a JSON-lines
//! file and never fails the caller: I/O errors are logged and swallowed.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 1000;
pub const AUDIT_FILE: &str = ".stepwise/audit.log";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditLogEntry {
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub event: String,
    pub detail: Map<String, Value>,
}

#[derive(Debug)]
pub struct AuditLog {
    entries: VecDeque<AuditLogEntry>,
    capacity: usize,
    /// Entries appended since the last flush, capped at `capacity`.
    unflushed: usize,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// In-memory only.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity: capacity.max(1),
            unflushed: 0,
            path: None,
        }
    }

    /// Ring buffer that flushes to `<root>/.stepwise/audit.log`.
    pub fn for_repo(root: &Path) -> Self {
        let mut log = Self::new(DEFAULT_CAPACITY);
        log.path = Some(root.join(AUDIT_FILE));
        log
    }

    pub fn record<I, K>(&mut self, event: &str, detail: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let entry = AuditLogEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event: event.to_string(),
            detail: detail.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        };
        debug!(event, "audit");
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.unflushed = (self.unflushed + 1).min(self.capacity);
    }

    pub fn entries(&self) -> impl Iterator<Item = &AuditLogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append unflushed entries to the audit file. Never fails.
    pub fn flush(&mut self) {
        let Some(path) = self.path.clone() else {
            self.unflushed = 0;
            return;
        };
        if self.unflushed == 0 {
            return;
        }
        match self.append(&path) {
            Ok(()) => self.unflushed = 0,
            Err(err) => warn!(path = %path.display(), err = %err, "audit flush failed"),
        }
    }

    fn append(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut buf = String::new();
        let start = self.entries.len() - self.unflushed;
        for entry in self.entries.iter().skip(start) {
            buf.push_str(&serde_json::to_string(entry).map_err(std::io::Error::other)?);
            buf.push('\n');
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(buf.as_bytes())
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        self.flush();
    }
}
