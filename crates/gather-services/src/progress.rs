//! Transfer progress — how many chunks have landed out of how many assigned.

use std::io::Write;

/// Width of the console bar in characters.
pub const BAR_WIDTH: usize = 30;

/// Receives a callback after every accepted chunk.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, received: usize, total: usize);

    /// Called once when reception completes.
    fn finish(&self) {}
}

/// Render `[#####-----] r/t chunks received`.
pub fn render_bar(received: usize, total: usize, width: usize) -> String {
    let filled = if total == 0 {
        width
    } else {
        (received.min(total) * width) / total
    };
    format!(
        "[{}{}] {}/{} chunks received",
        "#".repeat(filled),
        "-".repeat(width - filled),
        received,
        total
    )
}

/// Redraws a single progress line on stderr.
pub struct ConsoleProgress {
    width: usize,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self { width: BAR_WIDTH }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ConsoleProgress {
    fn report(&self, received: usize, total: usize) {
        let mut err = std::io::stderr().lock();
        let _ = write!(
            err,
            "\rProgress: {}",
            render_bar(received, total, self.width)
        );
        let _ = err.flush();
    }

    fn finish(&self) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err);
    }
}

/// Discards progress. For tests and non-interactive runs.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _received: usize, _total: usize) {}
}
