//! Typed execution log entries and the versioned blob they are stored in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::Result;

/// Maximum number of entries retained per job. Oldest entries are evicted first.
pub const MAX_LOG_ENTRIES: usize = 20_000;

/// Current version of the stored log blob.
pub const LOG_BLOB_VERSION: u16 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A single line of automation output.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "type")]
    pub stream: LogStream,
    pub content: String,
}

impl LogEntry {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new(LogStream::Stdout, content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new(LogStream::Stderr, content)
    }

    /// Lines that must be persisted without waiting for the next batch.
    pub fn is_urgent(&self) -> bool {
        self.stream == LogStream::Stderr || self.content.contains("ERROR!")
    }
}

/// Ordered, capped log of a job.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecutionLog {
    entries: VecDeque<LogEntry>,
}

#[derive(Serialize)]
struct StoredLogRef<'a> {
    version: u16,
    entries: &'a VecDeque<LogEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredLog {
    Versioned {
        version: u16,
        entries: Vec<LogEntry>,
    },
    Legacy(Vec<LogEntry>),
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = LogEntry>) -> Self {
        let mut log = Self::new();
        log.extend(entries);
        log
    }

    /// Appends in order, then drops the oldest entries beyond the cap.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        self.entries.extend(entries);
        while self.entries.len() > MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.extend(std::iter::once(entry));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries.into()
    }

    pub fn to_blob(&self) -> Result<String> {
        Ok(serde_json::to_string(&StoredLogRef {
            version: LOG_BLOB_VERSION,
            entries: &self.entries,
        })?)
    }

    /// Decodes a stored blob. Un-versioned arrays from older records are
    /// accepted as version 0; empty input decodes to an empty log.
    pub fn from_blob(blob: &str) -> Result<Self> {
        if blob.trim().is_empty() || blob.trim() == "null" {
            return Ok(Self::new());
        }
        let entries = match serde_json::from_str::<StoredLog>(blob)? {
            StoredLog::Versioned { version, entries } => {
                if version > LOG_BLOB_VERSION {
                    tracing::warn!(
                        version,
                        "decoding execution log written by a newer version"
                    );
                }
                entries
            }
            StoredLog::Legacy(entries) => entries,
        };
        Ok(Self::from_entries(entries))
    }
}
