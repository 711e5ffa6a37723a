//! Coarse progress for long-running build batches.
//!
//! A commit build takes minutes, so there is nothing to animate: the
//! status line is redrawn whenever a build finishes and wiped before the
//! closing summary prints. Inert when stderr is not a terminal or
//! `JHIST_PROGRESS=0`.

use std::env;
use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

// Status lines are padded to this width so a shorter redraw fully covers
// the previous one.
const LINE_WIDTH: usize = 72;

/// Counts completed work items on stderr.
pub struct BuildTicker {
    label: String,
    total: usize,
    done: AtomicUsize,
    started: Instant,
    live: bool,
}

impl BuildTicker {
    pub fn new(label: impl Into<String>, total: usize) -> Self {
        let live = total > 0
            && match env::var("JHIST_PROGRESS") {
                Ok(value) => value != "0",
                Err(_) => io::stderr().is_terminal(),
            };
        let ticker = Self {
            label: label.into(),
            total,
            done: AtomicUsize::new(0),
            started: Instant::now(),
            live,
        };
        ticker.redraw(0);
        ticker
    }

    /// Marks one item complete and refreshes the status line.
    pub fn tick(&self) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        self.redraw(done.min(self.total));
    }

    /// Wipes the status line and prints the closing summary with the
    /// elapsed wall time.
    pub fn close(mut self, message: impl Into<String>) {
        self.wipe();
        self.live = false;
        let elapsed = self.started.elapsed().as_secs();
        eprintln!(
            "jhist ▸ {} [{}m{:02}s]",
            message.into(),
            elapsed / 60,
            elapsed % 60
        );
    }

    fn redraw(&self, done: usize) {
        if !self.live {
            return;
        }
        let line = format!("jhist ▸ {} {done}/{}", self.label, self.total);
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r{line:<LINE_WIDTH$}");
        let _ = stderr.flush();
    }

    fn wipe(&self) {
        if !self.live {
            return;
        }
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r{:<LINE_WIDTH$}\r", "");
        let _ = stderr.flush();
    }
}

impl Drop for BuildTicker {
    fn drop(&mut self) {
        // An abandoned ticker (infrastructure error mid-pack) must not
        // leave a half-drawn line under the error output.
        self.wipe();
    }
}
