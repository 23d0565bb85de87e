//! Progress sinks for long-running object sweeps.

use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};

/// Receives progress reports from the bulk throttle. Reports are purely
/// observational; a sink must never fail the operation it observes.
pub trait ProgressContext: Send + Sync {
    fn update_progress(&self, done: u64, total: u64);

    fn finish(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressContext for NoProgress {
    fn update_progress(&self, _done: u64, _total: u64) {}
}

/// Terminal progress bar.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(message: impl Into<String>) -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(message.into());
        Self { bar }
    }
}

impl ProgressContext for BarProgress {
    fn update_progress(&self, done: u64, total: u64) {
        if self.bar.length() != Some(total) {
            self.bar.set_length(total);
        }
        self.bar.set_position(done);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Keeps every report; handy when asserting on what a sweep reported.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    reports: Mutex<Vec<(u64, u64)>>,
}

impl RecordingProgress {
    pub fn reports(&self) -> Vec<(u64, u64)> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl ProgressContext for RecordingProgress {
    fn update_progress(&self, done: u64, total: u64) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push((done, total));
        }
    }
}
