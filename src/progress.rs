use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    /// Known once counting finishes
    pub total_items: Option<u64>,
    pub processed_items: u64,
    /// Advisory, for display only
    pub current_path: String,
}

impl ScanProgress {
    /// Completion in percent, clamped to [0, 100]. The two walks can
    /// disagree when the filesystem changes in between, so processed may
    /// overshoot the total.
    pub fn percentage(&self) -> f64 {
        match self.total_items {
            None => 0.0,
            Some(0) => 100.0,
            Some(total) => (self.processed_items as f64 / total as f64 * 100.0).clamp(0.0, 100.0),
        }
    }
}

/// Single-writer progress accumulator.
///
/// The walker records every entry here; the sink sees at most one update
/// per interval. Counts recorded between flushes are carried into the next
/// flush, never dropped, and `finish` always delivers a final update.
pub struct ProgressThrottle<F: FnMut(&ScanProgress)> {
    interval: Duration,
    last_flush: Instant,
    pending: u64,
    progress: ScanProgress,
    sink: F,
}

impl<F: FnMut(&ScanProgress)> ProgressThrottle<F> {
    pub fn new(interval: Duration, sink: F) -> Self {
        Self {
            interval,
            last_flush: Instant::now(),
            pending: 0,
            progress: ScanProgress::default(),
            sink,
        }
    }

    pub fn progress(&self) -> &ScanProgress {
        &self.progress
    }

    /// Count one processed entry.
    pub fn record(&mut self, path: &Path) {
        self.pending += 1;
        if self.due() {
            self.progress.current_path = path.display().to_string();
            self.flush();
        }
    }

    /// Update the current-path marker without counting anything.
    pub fn touch(&mut self, path: &Path) {
        if self.due() {
            self.progress.current_path = path.display().to_string();
            self.flush();
        }
    }

    pub fn set_total(&mut self, total: u64) {
        self.progress.total_items = Some(total);
        self.flush();
    }

    /// Mandatory final flush: the sink always ends up seeing 100%.
    pub fn finish(&mut self) {
        self.progress.processed_items += self.pending;
        self.pending = 0;
        if let Some(total) = self.progress.total_items {
            self.progress.processed_items = self.progress.processed_items.max(total);
        }
        self.progress.current_path.clear();
        self.emit();
    }

    fn due(&self) -> bool {
        self.last_flush.elapsed() >= self.interval
    }

    fn flush(&mut self) {
        self.progress.processed_items += self.pending;
        self.pending = 0;
        self.emit();
    }

    fn emit(&mut self) {
        self.last_flush = Instant::now();
        (self.sink)(&self.progress);
    }
}
