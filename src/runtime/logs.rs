use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub const DEFAULT_LOG_CAPACITY: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Level of a line read from the child's stdout.
    pub fn classify_stdout(line: &str) -> Self {
        let lower = line.to_lowercase();
        if lower.contains("error") {
            LogLevel::Error
        } else if lower.contains("warn") {
            LogLevel::Warn
        } else {
            LogLevel::Info
        }
    }
}

/// Which pipe of the child process a line came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn level_for(self, line: &str) -> LogLevel {
        match self {
            OutputStream::Stderr => LogLevel::Error,
            OutputStream::Stdout => LogLevel::classify_stdout(line),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

type LogCallback = Arc<dyn Fn(&LogEntry) + Send + Sync>;

struct Subscriber {
    id: u64,
    filter: Option<LogLevel>,
    callback: LogCallback,
}

struct BufferInner {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
}

/// Fixed-capacity, level-tagged line buffer for one dev server.
///
/// Cloning is cheap and every clone shares the same entries, so reader tasks can
/// append while callers snapshot.
#[derive(Clone)]
pub struct LogRingBuffer {
    inner: Arc<BufferInner>,
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(BufferInner {
                capacity,
                entries: Mutex::new(VecDeque::with_capacity(capacity)),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Store a timestamped entry, evicting the oldest ones beyond capacity, then
    /// notify matching subscribers.
    pub fn append(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        {
            let mut entries = lock(&self.inner.entries);
            entries.push_back(entry.clone());
            while entries.len() > self.inner.capacity {
                entries.pop_front();
            }
        }

        // Snapshot callbacks so a subscriber can unsubscribe from inside its callback.
        let callbacks: Vec<LogCallback> = lock(&self.inner.subscribers)
            .iter()
            .filter(|s| s.filter.map_or(true, |f| f == level))
            .map(|s| s.callback.clone())
            .collect();
        for callback in callbacks {
            callback(&entry);
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.append(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(LogLevel::Error, message);
    }

    /// Snapshot of the buffered entries, oldest first.
    pub fn get_logs(&self, filter: Option<LogLevel>) -> Vec<LogEntry> {
        lock(&self.inner.entries)
            .iter()
            .filter(|e| filter.map_or(true, |f| f == e.level))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.inner.entries).clear();
    }

    /// Register `callback` for every future entry matching `filter`. The callback
    /// stays registered until the returned handle is dropped or unsubscribed.
    pub fn subscribe<F>(&self, filter: Option<LogLevel>, callback: F) -> LogSubscription
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).push(Subscriber {
            id,
            filter,
            callback: Arc::new(callback),
        });
        LogSubscription {
            id,
            buffer: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }
}

/// Handle returned by [`LogRingBuffer::subscribe`].
pub struct LogSubscription {
    id: u64,
    buffer: Weak<BufferInner>,
}

impl LogSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.buffer.upgrade() {
            lock(&inner.subscribers).retain(|s| s.id != self.id);
        }
    }
}

// A panicking subscriber must not take the log buffer down with it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
