use sandbox::{LogEntry, LogKind};

use crate::timeline::RunClock;

/// Destination of the restricted `console` object for a single run.
#[derive(Debug)]
pub struct ConsoleSink {
    clock: RunClock,
    entries: Vec<LogEntry>,
}

impl ConsoleSink {
    pub fn new(clock: RunClock) -> Self {
        Self {
            clock,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, kind: LogKind, text: String) {
        let timestamp_ms = self.clock.elapsed_ms();
        self.entries.push(LogEntry {
            kind,
            text,
            timestamp_ms,
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}
