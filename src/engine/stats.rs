//! Processor self-reporting: hourly-bucketed counters and running averages.
//!
//! Nothing here feeds back into dispatch decisions.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use crate::model::{Status, WorkItem};

/// Trailing windows reported by [`QueueProcessorStats::summary`], in hours.
pub const SUMMARY_WINDOWS: [u32; 4] = [24, 12, 6, 1];

/// Hourly buckets older than the widest window are discarded.
const BUCKET_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub dequeued: u64,
    pub processed: u64,
    pub failed: u64,
}

impl Counts {
    fn add(&mut self, other: &Counts) {
        self.dequeued += other.dequeued;
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

/// A reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Lifetime,
    /// The current hour plus the `n - 1` hours before it.
    Hours(u32),
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Window::Lifetime => write!(f, "lifetime"),
            Window::Hours(h) => write!(f, "{h}h"),
        }
    }
}

/// Incrementally maintained mean.
#[derive(Debug, Clone, Copy, Default)]
struct RunningAverage {
    mean_ms: f64,
    samples: u64,
}

impl RunningAverage {
    fn add(&mut self, sample_ms: f64) {
        let n = self.samples as f64;
        self.mean_ms = (sample_ms + self.mean_ms * n) / (n + 1.0);
        self.samples += 1;
    }

    fn get(&self) -> Option<f64> {
        (self.samples > 0).then_some(self.mean_ms)
    }
}

#[derive(Debug, Default)]
struct CategoryStats {
    lifetime: Counts,
    hourly: BTreeMap<DateTime<Utc>, Counts>,
    time_in_queue: RunningAverage,
    time_in_processing: RunningAverage,
}

impl CategoryStats {
    fn bucket(&mut self, now: DateTime<Utc>) -> &mut Counts {
        self.hourly.entry(hour_of(now)).or_default()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let oldest = hour_of(now) - TimeDelta::hours(BUCKET_RETENTION_HOURS - 1);
        self.hourly = self.hourly.split_off(&oldest);
    }

    fn window(&self, window: Window, now: DateTime<Utc>) -> Counts {
        match window {
            Window::Lifetime => self.lifetime,
            Window::Hours(h) => {
                let from = hour_of(now) - TimeDelta::hours(i64::from(h.max(1)) - 1);
                let mut total = Counts::default();
                for counts in self.hourly.range(from..).map(|(_, c)| c) {
                    total.add(counts);
                }
                total
            }
        }
    }
}

/// Per-category counters kept by one processor instance.
#[derive(Debug)]
pub struct QueueProcessorStats {
    started: DateTime<Utc>,
    categories: BTreeMap<String, CategoryStats>,
}

impl QueueProcessorStats {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            started: now,
            categories: BTreeMap::new(),
        }
    }

    /// Count a dequeued item and fold its time in queue into the average.
    pub fn record_dequeued(&mut self, item: &WorkItem, now: DateTime<Utc>) {
        let stats = self.categories.entry(item.category.clone()).or_default();
        stats.prune(now);
        stats.lifetime.dequeued += 1;
        stats.bucket(now).dequeued += 1;
        if let Some(waited) = item.time_in_queue() {
            stats.time_in_queue.add(waited.num_milliseconds() as f64);
        }
    }

    /// Count a finished item as processed or failed and fold its processing
    /// time into the average.
    pub fn record_processed(&mut self, item: &WorkItem, now: DateTime<Utc>) {
        let stats = self.categories.entry(item.category.clone()).or_default();
        stats.prune(now);
        let failed = item.status == Status::Failed;
        if failed {
            stats.lifetime.failed += 1;
            stats.bucket(now).failed += 1;
        } else {
            stats.lifetime.processed += 1;
            stats.bucket(now).processed += 1;
        }
        if let Some(took) = item.time_in_processing() {
            stats.time_in_processing.add(took.num_milliseconds() as f64);
        }
    }

    /// Totals across all categories.
    pub fn totals(&self, window: Window, now: DateTime<Utc>) -> Counts {
        let mut total = Counts::default();
        for stats in self.categories.values() {
            total.add(&stats.window(window, now));
        }
        total
    }

    pub fn category_totals(&self, category: &str, window: Window, now: DateTime<Utc>) -> Counts {
        self.categories
            .get(category)
            .map(|s| s.window(window, now))
            .unwrap_or_default()
    }

    /// Mean time between enqueue and dequeue, in milliseconds.
    pub fn average_time_in_queue_ms(&self, category: &str) -> Option<f64> {
        self.categories.get(category)?.time_in_queue.get()
    }

    /// Mean time spent in the processor, in milliseconds.
    pub fn average_time_in_processing_ms(&self, category: &str) -> Option<f64> {
        self.categories.get(category)?.time_in_processing.get()
    }

    /// Hours the window actually covers, never less than a minute's worth.
    fn window_hours(&self, window: Window, now: DateTime<Utc>) -> f64 {
        let up = (now - self.started).num_seconds().max(60) as f64 / 3600.0;
        match window {
            Window::Lifetime => up,
            Window::Hours(h) => up.min(f64::from(h)),
        }
    }

    /// Multi-line report: lifetime totals, then totals, hourly rate and
    /// per-category share for each window.
    pub fn summary(&self, now: DateTime<Utc>) -> String {
        let mut out = String::new();
        let lifetime = self.totals(Window::Lifetime, now);
        let _ = writeln!(
            out,
            "queue processor stats since {}: dequeued={} processed={} failed={}",
            self.started.format("%Y-%m-%d %H:%M:%S"),
            lifetime.dequeued,
            lifetime.processed,
            lifetime.failed
        );

        for (name, stats) in &self.categories {
            let avg_queue = stats.time_in_queue.get().unwrap_or(0.0);
            let avg_proc = stats.time_in_processing.get().unwrap_or(0.0);
            let _ = writeln!(
                out,
                "  {name}: avg_in_queue={avg_queue:.0}ms avg_in_processing={avg_proc:.0}ms"
            );
        }

        let windows =
            std::iter::once(Window::Lifetime).chain(SUMMARY_WINDOWS.iter().map(|h| Window::Hours(*h)));
        for window in windows {
            let total = self.totals(window, now);
            let hours = self.window_hours(window, now);
            let _ = write!(
                out,
                "  [{window}] dequeued={} processed={} failed={} rate={:.1}/h",
                total.dequeued,
                total.processed,
                total.failed,
                total.dequeued as f64 / hours
            );
            if total.dequeued > 0 {
                let shares: Vec<String> = self
                    .categories
                    .iter()
                    .map(|(name, stats)| {
                        let n = stats.window(window, now).dequeued;
                        format!("{name}={:.1}%", n as f64 * 100.0 / total.dequeued as f64)
                    })
                    .collect();
                let _ = write!(out, " [{}]", shares.join(", "));
            }
            out.push('\n');
        }
        out
    }
}

fn hour_of(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(TimeDelta::hours(1)).unwrap_or(t)
}
