//! Thread-safe ring buffer holding the most recent N log lines, with
//! incremental reads and a run id that increments on every reset so clients
//! can detect gateway restarts.

use std::sync::RwLock;

pub struct LogBuffer {
    inner: RwLock<Inner>,
}

struct Inner {
    lines: Vec<String>,
    cap: usize,
    /// Total lines appended in the current run.
    total: usize,
    run_id: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                lines: Vec::with_capacity(capacity),
                cap: capacity.max(1),
                total: 0,
                run_id: 0,
            }),
        }
    }

    /// Append a line, overwriting the oldest slot once full.
    pub fn append(&self, line: impl Into<String>) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let slot = inner.total % inner.cap;
        if inner.lines.len() < inner.cap {
            inner.lines.push(line.into());
        } else {
            inner.lines[slot] = line.into();
        }
        inner.total += 1;
    }

    /// Clear the buffer and bump the run id. Called when a new gateway
    /// process starts.
    pub fn reset(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.lines.clear();
        inner.total = 0;
        inner.run_id += 1;
    }

    /// Lines appended after `offset`, plus the current total and run id.
    /// `offset >= total` yields nothing; an offset pointing at evicted lines
    /// yields the whole buffer (best-effort tail).
    pub fn lines_since(&self, offset: usize) -> (Vec<String>, usize, u64) {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if offset >= inner.total {
            return (Vec::new(), inner.total, inner.run_id);
        }

        let buffered = inner.lines.len();
        let new_count = (inner.total - offset).min(buffered);
        let mut result = Vec::with_capacity(new_count);

        if inner.total <= inner.cap {
            // Not wrapped yet: a straight slice off the end.
            result.extend_from_slice(&inner.lines[buffered - new_count..]);
        } else {
            let start = (inner.total - new_count) % inner.cap;
            for i in 0..new_count {
                result.push(inner.lines[(start + i) % inner.cap].clone());
            }
        }

        (result, inner.total, inner.run_id)
    }

    pub fn run_id(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .run_id
    }

    pub fn total(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .total
    }
}
