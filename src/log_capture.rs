//! In-memory capture of recent log events.
//!
//! [`LogBufferLayer`] is a `tracing_subscriber` layer that copies every event it
//! sees into a bounded [`LogBuffer`]. The control surface reads the buffer to
//! show operators what happened recently without tailing a file.

use chrono::{DateTime, Local};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Default number of entries kept.
pub const DEFAULT_CAPACITY: usize = 1000;

/// One captured event.
#[derive(Clone, Debug)]
pub struct LogEntry {
    /// When the event was recorded
    pub timestamp: DateTime<Local>,
    /// Event level
    pub level: Level,
    /// Module path of the emitter
    pub target: String,
    /// Message followed by the event's fields
    pub message: String,
}

/// Serializable view of a [`LogEntry`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// RFC 3339 local time
    pub timestamp: String,
    /// Level name
    pub level: String,
    /// Module path of the event
    pub target: String,
    /// Message and structured fields
    pub message: String,
}

impl From<&LogEntry> for LogLine {
    fn from(entry: &LogEntry) -> Self {
        Self {
            timestamp: entry.timestamp.to_rfc3339(),
            level: entry.level.to_string(),
            target: entry.target.clone(),
            message: entry.message.clone(),
        }
    }
}

/// Bounded, shared ring of log entries. Cloning shares the same buffer.
#[derive(Clone, Debug)]
pub struct LogBuffer {
    entries: Arc<RwLock<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    /// Buffer with [`DEFAULT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Buffer keeping at most `capacity` entries (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.min(4096)))),
            capacity,
        }
    }

    /// Maximum number of entries kept
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read access to the entries, oldest first.
    pub fn read(&self) -> RwLockReadGuard<'_, VecDeque<LogEntry>> {
        self.entries.read()
    }

    /// Append an entry, dropping the oldest once full.
    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of entries held
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing was captured yet
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// The newest `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogLine> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).map(LogLine::from).collect()
    }

    /// Layer feeding this buffer.
    pub fn layer(&self) -> LogBufferLayer {
        LogBufferLayer {
            buffer: self.clone(),
        }
    }
}

/// Subscriber layer writing events into a [`LogBuffer`].
#[derive(Clone, Debug)]
pub struct LogBufferLayer {
    buffer: LogBuffer,
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.buffer.push(LogEntry {
            timestamp: Local::now(),
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}
