//! Execution log for deterministic inspection of a simulation run
//!
//! Every stage of the engine appends a [`LogEntry`]. Entries are never
//! mutated after they are appended; sequence numbers are strictly
//! increasing. The persisted form is one JSON object per line.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Category tag of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    /// A definition was registered with the engine
    Registration,
    /// A state path was written
    State,
    /// A condition watch was registered, fired, disarmed or removed
    Watch,
    /// An event was dispatched to its tasks
    Dispatch,
    /// A task effect ran
    Task,
    /// An event injection was scheduled or delivered
    Injection,
    /// A re-entrant dispatch was skipped
    Skip,
    /// A scene state machine changed state
    SceneTransition,
    /// A scenario step or result
    Scenario,
    /// A scenario execution started or finished
    Execution,
    /// Pause, play, speed or stop
    Control,
    /// Any error surfaced to a caller
    Error,
}

/// One append-only record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic sequence number, starting at 1
    pub seq: u64,
    /// Milliseconds since the logger was created
    pub when: u64,
    /// Category tag
    pub what: LogCategory,
    /// Subject: event, scene, scenario or watch name
    pub who: String,
    /// Human-readable summary
    pub summary: String,
    /// Structured context
    pub trace: Value,
}

/// Append-only structured trace shared by every engine component
#[derive(Debug)]
pub struct ExecutionLogger {
    entries: Mutex<Vec<LogEntry>>,
    next_seq: AtomicU64,
    started: Instant,
    mirror_to_tracing: bool,
}

impl ExecutionLogger {
    /// Create a logger that mirrors entries to `tracing`
    pub fn new() -> Self {
        Self::with_mirroring(true)
    }

    /// Create a logger, choosing whether entries are mirrored to `tracing`
    pub fn with_mirroring(mirror_to_tracing: bool) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(1),
            started: Instant::now(),
            mirror_to_tracing,
        }
    }

    /// Append an entry and return its sequence number
    pub fn record(
        &self,
        what: LogCategory,
        who: impl Into<String>,
        summary: impl Into<String>,
        trace: Value,
    ) -> u64 {
        let who = who.into();
        let summary = summary.into();
        if self.mirror_to_tracing {
            mirror(what, &who, &summary, &trace);
        }

        // seq is assigned under the lock so entries stay ordered by seq
        let mut entries = self.entries.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        entries.push(LogEntry {
            seq,
            when: self.started.elapsed().as_millis() as u64,
            what,
            who,
            summary,
            trace,
        });
        seq
    }

    /// All entries in sequence order
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Entries of a single category
    pub fn entries_by_category(&self, what: LogCategory) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.what == what)
            .cloned()
            .collect()
    }

    /// Entries about a single subject
    pub fn entries_for(&self, who: &str) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.who == who)
            .cloned()
            .collect()
    }

    /// Entries appended after sequence number `seq`
    pub fn entries_since(&self, seq: u64) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.seq > seq)
            .cloned()
            .collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been logged yet
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Export as JSON lines
    pub fn to_json_lines(&self) -> String {
        let entries = self.entries.lock();
        let mut out = String::new();
        for entry in entries.iter() {
            if let Ok(line) = serde_json::to_string(entry) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }

    /// Write JSON lines to `writer`
    pub fn write_json_lines(&self, mut writer: impl Write) -> std::io::Result<()> {
        let entries = self.entries();
        for entry in &entries {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()
    }
}

impl Default for ExecutionLogger {
    fn default() -> Self {
        Self::new()
    }
}

fn mirror(what: LogCategory, who: &str, summary: &str, trace: &Value) {
    match what {
        LogCategory::Error => {
            tracing::warn!(category = ?what, subject = %who, trace = %trace, "{summary}");
        }
        LogCategory::Skip => {
            tracing::info!(category = ?what, subject = %who, trace = %trace, "{summary}");
        }
        LogCategory::Registration | LogCategory::Control | LogCategory::Execution => {
            tracing::debug!(category = ?what, subject = %who, trace = %trace, "{summary}");
        }
        _ => {
            tracing::trace!(category = ?what, subject = %who, trace = %trace, "{summary}");
        }
    }
}
