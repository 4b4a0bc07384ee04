//! Bounded console capture for sandboxed script runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::store::types::{ConsoleLevel, ConsoleLine};

/// Marker line appended when the buffer dropped output to stay in budget.
pub const TRUNCATION_MARKER: &str = "[output truncated]";

/// Bounded, ordered console line buffer.
///
/// Accounts the UTF-8 byte length of each message against an aggregate
/// budget. When a push would exceed the budget, the oldest lines are
/// dropped first; the final line list then ends with a synthetic
/// [`TRUNCATION_MARKER`] entry.
#[derive(Debug)]
pub struct ConsoleBuffer {
    lines: VecDeque<ConsoleLine>,
    bytes: usize,
    max_bytes: usize,
    truncated: bool,
}

impl ConsoleBuffer {
    /// Create a buffer with the given aggregate byte budget.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes,
            truncated: false,
        }
    }

    /// Append a console line, evicting oldest lines when over budget.
    pub fn push(&mut self, level: ConsoleLevel, message: String) {
        let cost = message.len();
        self.lines.push_back(ConsoleLine {
            level,
            timestamp: Utc::now(),
            message,
        });
        self.bytes += cost;

        while self.bytes > self.max_bytes {
            let Some(evicted) = self.lines.pop_front() else {
                break;
            };
            self.bytes -= evicted.message.len();
            self.truncated = true;
        }
    }

    /// Number of retained lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns `true` when no lines are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Consume the buffer into its ordered line list, appending the
    /// truncation marker when output was dropped.
    #[must_use]
    pub fn into_lines(mut self) -> Vec<ConsoleLine> {
        if self.truncated {
            self.lines.push_back(ConsoleLine {
                level: ConsoleLevel::Warn,
                timestamp: Utc::now(),
                message: TRUNCATION_MARKER.to_owned(),
            });
        }
        self.lines.into()
    }
}

/// Console buffer shared between the executor and the running script host.
pub type SharedConsole = Arc<Mutex<ConsoleBuffer>>;

/// Create a shared console buffer with the given budget.
#[must_use]
pub fn shared_console(max_bytes: usize) -> SharedConsole {
    Arc::new(Mutex::new(ConsoleBuffer::new(max_bytes)))
}

/// Drain a shared console into its line list. A poisoned lock yields the
/// lines captured before the panic.
#[must_use]
pub fn drain_console(console: SharedConsole) -> Vec<ConsoleLine> {
    match Arc::try_unwrap(console) {
        Ok(mutex) => match mutex.into_inner() {
            Ok(buffer) => buffer.into_lines(),
            Err(poisoned) => poisoned.into_inner().into_lines(),
        },
        // The host still holds a clone (cancelled mid-run): copy out.
        Err(shared) => {
            let Ok(mut guard) = shared.lock() else {
                return Vec::new();
            };
            let buffer = std::mem::replace(&mut *guard, ConsoleBuffer::new(0));
            buffer.into_lines()
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn preserves_order_under_budget() {
        let mut buffer = ConsoleBuffer::new(1024);
        buffer.push(ConsoleLevel::Log, "first".to_owned());
        buffer.push(ConsoleLevel::Error, "second".to_owned());

        let lines = buffer.into_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "first");
        assert_eq!(lines[1].message, "second");
        assert_eq!(lines[1].level, ConsoleLevel::Error);
    }

    #[test]
    fn one_byte_over_budget_drops_oldest_and_marks() {
        let mut buffer = ConsoleBuffer::new(1024 * 1024);
        let chunk = "x".repeat(1024);
        for _ in 0..1024 {
            buffer.push(ConsoleLevel::Log, chunk.clone());
        }
        // Exactly at budget: nothing dropped yet.
        assert_eq!(buffer.len(), 1024);

        buffer.push(ConsoleLevel::Log, "y".to_owned());
        let lines = buffer.into_lines();
        let last = lines.last().unwrap();
        assert_eq!(last.message, TRUNCATION_MARKER);
        assert_eq!(lines[lines.len() - 2].message, "y");
        // Oldest chunk was evicted.
        assert!(lines.len() < 1026);
    }

    #[test]
    fn oversized_single_line_leaves_marker_only() {
        let mut buffer = ConsoleBuffer::new(16);
        buffer.push(ConsoleLevel::Log, "x".repeat(64));
        let lines = buffer.into_lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, TRUNCATION_MARKER);
    }

    #[test]
    fn drain_copies_when_host_still_holds_clone() {
        let shared = shared_console(1024);
        let host_clone = Arc::clone(&shared);
        host_clone
            .lock()
            .unwrap()
            .push(ConsoleLevel::Log, "kept".to_owned());

        let lines = drain_console(shared);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "kept");
    }
}
