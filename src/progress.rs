//! Progress bars with a log-only fallback.
//!
//! In log-only mode bars are hidden and progress is emitted as periodic log
//! lines instead, which keeps output readable under `tail -f`.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Global flag for log-only mode (set from args in main)
static LOG_ONLY: AtomicBool = AtomicBool::new(false);

pub fn set_log_only(value: bool) {
    LOG_ONLY.store(value, Ordering::Relaxed);
}

pub fn is_log_only() -> bool {
    LOG_ONLY.load(Ordering::Relaxed)
}

/// Format duration in human-readable format
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.1}m", secs / 60.0)
    }
}

/// A stage's progress: a bar on a terminal, periodic log lines otherwise.
pub struct StageProgress {
    bar: ProgressBar,
    phase: &'static str,
    total: u64,
    log_every: u64,
}

impl StageProgress {
    pub fn new(phase: &'static str, total: u64) -> Self {
        let bar = ProgressBar::new(total);
        if is_log_only() {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        } else if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta})")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(phase);
        Self {
            bar,
            phase,
            total,
            log_every: (total / 20).max(1),
        }
    }

    /// Spinner for work of unknown size.
    pub fn spinner(phase: &'static str) -> Self {
        let bar = ProgressBar::new_spinner();
        if is_log_only() {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        } else {
            if let Ok(style) = ProgressStyle::default_spinner().template("{msg} {spinner} [{elapsed_precise}]") {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(100));
        }
        bar.set_message(phase);
        Self {
            bar,
            phase,
            total: 0,
            log_every: u64::MAX,
        }
    }

    pub fn inc(&self) {
        self.bar.inc(1);
        let current = self.bar.position();
        if is_log_only() && self.total > 0 && (current % self.log_every == 0 || current == self.total) {
            let pct = 100.0 * current as f64 / self.total as f64;
            info!("[{}] {}/{} ({:.1}%)", self.phase, current, self.total, pct);
        }
    }

    pub fn finish(&self, msg: String) {
        if is_log_only() {
            info!("[{}] {}", self.phase, msg);
        }
        self.bar.finish_with_message(msg);
    }
}
