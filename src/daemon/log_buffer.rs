//! Per-process ring buffer for captured stdout/stderr lines.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

const DEFAULT_CAPACITY: usize = 10_000;

pub struct LogBuffer {
    capacity: usize,
    lines: RwLock<HashMap<String, VecDeque<String>>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: RwLock::new(HashMap::new()),
        }
    }

    /// Append a line for the named process, evicting the oldest if full.
    pub fn push(&self, name: &str, line: String) {
        let mut lines = self.lines.write().expect("log buffer lock poisoned");
        let entries = lines.entry(name.to_string()).or_default();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(line);
    }

    /// Last `n` lines for a process, oldest first.
    pub fn tail(&self, name: &str, n: usize) -> Vec<String> {
        let lines = self.lines.read().expect("log buffer lock poisoned");
        let Some(entries) = lines.get(name) else {
            return Vec::new();
        };
        entries
            .iter()
            .skip(entries.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    /// Drop everything captured for a process.
    pub fn clear(&self, name: &str) {
        self.lines
            .write()
            .expect("log buffer lock poisoned")
            .remove(name);
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
