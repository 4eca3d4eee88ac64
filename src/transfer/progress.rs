//! Throughput estimation and progress reporting.

use indicatif::{ProgressBar, ProgressStyle};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples older than this stop counting toward the rate.
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(10);

/// Rolling throughput over the last few seconds of samples.
#[derive(Debug, Clone)]
pub struct Throughput {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new(THROUGHPUT_WINDOW)
    }
}

impl Throughput {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn add(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.trim(now);
    }

    fn trim(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the retained samples.
    pub fn rate(&self, now: Instant) -> f64 {
        let Some(&(first, _)) = self.samples.front() else {
            return 0.0;
        };
        let total: u64 = self.samples.iter().map(|&(_, b)| b).sum();
        let elapsed = now.duration_since(first).as_secs_f64().max(1.0);
        total as f64 / elapsed
    }
}

/// One progress report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub bytes_so_far: u64,
    pub total_bytes: u64,
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
}

impl Progress {
    pub fn new(bytes_so_far: u64, total_bytes: u64, bytes_per_second: f64) -> Self {
        let remaining = total_bytes.saturating_sub(bytes_so_far);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if bytes_per_second > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / bytes_per_second))
        } else {
            None
        };
        Self {
            bytes_so_far,
            total_bytes,
            bytes_per_second,
            eta,
        }
    }
}

/// Receives progress for individual files and for the whole transfer.
pub trait ProgressObserver: Send {
    fn file_progress(&mut self, _name: &str, _progress: Progress) {}
    fn transfer_progress(&mut self, _progress: Progress) {}
    fn file_done(&mut self, _name: &str, _error: Option<&str>) {}
    fn transfer_done(&mut self, _failures: &[String]) {}
}

pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Renders aggregate progress as an indicatif bar on stderr.
pub struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg:30!} [{bar:30}] {bytes}/{total_bytes} {binary_bytes_per_sec} eta {eta}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        Self { bar }
    }
}

impl Default for BarObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for BarObserver {
    fn file_progress(&mut self, name: &str, _progress: Progress) {
        self.bar.set_message(name.to_string());
    }

    fn transfer_progress(&mut self, progress: Progress) {
        self.bar.set_length(progress.total_bytes);
        self.bar.set_position(progress.bytes_so_far);
    }

    fn file_done(&mut self, name: &str, error: Option<&str>) {
        if let Some(err) = error {
            self.bar.println(format!("{}: {}", name, err));
        }
    }

    fn transfer_done(&mut self, _failures: &[String]) {
        self.bar.finish_and_clear();
    }
}
