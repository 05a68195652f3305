//! Streaming sink that turns raw process output into batched, retried log
//! writes.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::domain::{JobId, LogEntry, LogStream};
use crate::error::{BitorError, Result};
use crate::ports::JobStore;

/// When buffered entries are written to the job store.
#[derive(Clone, Debug)]
pub struct FlushPolicy {
    /// Flush once this many entries are buffered.
    pub max_batch: usize,
    /// Flush once this much time has passed since the last flush.
    pub max_interval: Duration,
    pub retry_attempts: u32,
    /// Linear backoff unit: attempt `n` waits `n * retry_base`.
    pub retry_base: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_batch: 100,
            max_interval: Duration::from_secs(1),
            retry_attempts: 3,
            retry_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct Buffer {
    pending: Vec<LogEntry>,
    stdout_partial: Vec<u8>,
    stderr_partial: Vec<u8>,
    last_flush: Instant,
}

impl Buffer {
    fn partial(&mut self, stream: LogStream) -> &mut Vec<u8> {
        match stream {
            LogStream::Stdout => &mut self.stdout_partial,
            LogStream::Stderr => &mut self.stderr_partial,
        }
    }
}

/// Per-run log sink shared by the stdout and stderr pumps of one process.
///
/// Entries leave the in-memory buffer only after the store accepted them,
/// so a failed write is retried on the next flush instead of lost. Lines
/// may be written twice if the process restarts between a successful write
/// and the buffer drain.
pub struct LogCheckpointer {
    job_id: JobId,
    store: Arc<dyn JobStore>,
    policy: FlushPolicy,
    buffer: Mutex<Buffer>,
    flush_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for LogCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCheckpointer")
            .field("job_id", &self.job_id)
            .field("policy", &self.policy)
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl LogCheckpointer {
    pub fn new(
        job_id: JobId,
        store: Arc<dyn JobStore>,
        policy: FlushPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_id,
            store,
            policy,
            buffer: Mutex::new(Buffer {
                pending: Vec::new(),
                stdout_partial: Vec::new(),
                stderr_partial: Vec::new(),
                last_flush: Instant::now(),
            }),
            flush_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Entries buffered and not yet persisted.
    pub fn pending_len(&self) -> usize {
        self.buffer.lock().pending.len()
    }

    /// Feeds raw output. Complete lines become entries; an incomplete
    /// trailing line is kept until its newline arrives.
    pub async fn ingest(&self, stream: LogStream, bytes: &[u8]) {
        let lines = {
            let mut buffer = self.buffer.lock();
            let partial = buffer.partial(stream);
            partial.extend_from_slice(bytes);
            split_complete_lines(partial)
        };

        for line in lines {
            self.push(LogEntry::new(stream, line)).await;
        }
    }

    /// Appends an already formed entry, flushing when a trigger fires.
    pub async fn push(&self, entry: LogEntry) {
        let urgent = entry.is_urgent();
        let due = {
            let mut buffer = self.buffer.lock();
            buffer.pending.push(entry);
            urgent
                || buffer.pending.len() >= self.policy.max_batch
                || buffer.last_flush.elapsed() >= self.policy.max_interval
        };

        if due && let Err(err) = self.flush().await {
            error!(job_id = %self.job_id, "log checkpoint failed: {err}");
        }
    }

    /// Flushes when the interval has elapsed and something is buffered.
    pub async fn flush_if_due(&self) -> Result<()> {
        let due = {
            let buffer = self.buffer.lock();
            !buffer.pending.is_empty()
                && buffer.last_flush.elapsed() >= self.policy.max_interval
        };
        if due { self.flush().await } else { Ok(()) }
    }

    /// Persists the current buffer, retrying with linear backoff.
    pub async fn flush(&self) -> Result<()> {
        let _gate = self.flush_gate.lock().await;

        let snapshot: Vec<LogEntry> = self.buffer.lock().pending.clone();
        if snapshot.is_empty() {
            return Ok(());
        }

        let attempts = self.policy.retry_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.persist(&snapshot).await {
                Ok(()) => {
                    let mut buffer = self.buffer.lock();
                    buffer.pending.drain(..snapshot.len());
                    buffer.last_flush = Instant::now();
                    debug!(
                        job_id = %self.job_id,
                        entries = snapshot.len(),
                        "checkpointed log entries"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        job_id = %self.job_id,
                        attempt,
                        "log persistence failed: {err}"
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.retry_base * attempt).await;
                    }
                }
            }
        }

        Err(BitorError::persistence(format!(
            "giving up on {} log entries after {attempts} attempts: {}",
            snapshot.len(),
            last_error.map(|err| err.to_string()).unwrap_or_default()
        )))
    }

    async fn persist(&self, entries: &[LogEntry]) -> Result<()> {
        let mut log = self.store.load_log(self.job_id).await?;
        log.extend(entries.iter().cloned());
        self.store.store_log(self.job_id, &log).await
    }

    /// Emits any unterminated trailing lines and flushes everything.
    pub async fn finish(&self) -> Result<()> {
        let tails = {
            let mut buffer = self.buffer.lock();
            [LogStream::Stdout, LogStream::Stderr]
                .into_iter()
                .filter_map(|stream| {
                    let partial = std::mem::take(buffer.partial(stream));
                    let line = clean_line(&partial);
                    (!line.is_empty()).then_some((stream, line))
                })
                .collect::<Vec<_>>()
        };
        for (stream, line) in tails {
            self.buffer.lock().pending.push(LogEntry::new(stream, line));
        }
        self.flush().await
    }

    /// Periodically flushes idle tails until the handle is aborted.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let checkpointer = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(checkpointer.policy.max_interval);
            interval.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                interval.tick().await;
                if let Err(err) = checkpointer.flush_if_due().await {
                    error!(
                        job_id = %checkpointer.job_id,
                        "periodic log checkpoint failed: {err}"
                    );
                }
            }
        })
    }
}

/// Drains every newline-terminated line from `partial`, skipping blanks.
fn split_complete_lines(partial: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = partial.iter().rposition(|b| *b == b'\n') else {
        return Vec::new();
    };
    let complete: Vec<u8> = partial.drain(..=last_newline).collect();
    complete
        .split(|b| *b == b'\n')
        .map(clean_line)
        .filter(|line| !line.is_empty())
        .collect()
}

fn clean_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}
