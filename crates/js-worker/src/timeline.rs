use std::time::Instant;

use sandbox::TraceEvent;

/// Monotonic start instant of one run. All per-run timestamps are measured
/// from it.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    start: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// Append-only trace buffer for a single run.
#[derive(Debug)]
pub struct Timeline {
    clock: RunClock,
    events: Vec<TraceEvent>,
}

impl Timeline {
    pub fn new(clock: RunClock) -> Self {
        Self {
            clock,
            events: Vec::new(),
        }
    }

    pub fn record(&mut self, line: u32, snippet: String) {
        let timestamp_ms = self.clock.elapsed_ms();
        self.events.push(TraceEvent {
            timestamp_ms,
            line,
            snippet,
        });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events recorded so far, or `None` if nothing was reached.
    pub fn into_events(self) -> Option<Vec<TraceEvent>> {
        if self.events.is_empty() {
            None
        } else {
            Some(self.events)
        }
    }
}
