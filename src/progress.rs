//! Progress side channel and optional stage timing.
//!
//! Nothing here feeds back into the data path: a hidden bar and a disabled
//! timer behave exactly like visible ones as far as results go.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use indicatif::{ProgressBar, ProgressStyle};

/// Counts completed batches and the records they carried.
pub struct ProgressReporter {
    bar: ProgressBar,
    records: AtomicU64,
}

impl ProgressReporter {
    pub fn new(label: &str, visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::new_spinner();
            let style = ProgressStyle::with_template(
                "{spinner:.green} {prefix:.bold.cyan} {pos} batches [{elapsed_precise}] {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
            bar.set_style(style);
            bar.set_prefix(label.to_string());
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            bar,
            records: AtomicU64::new(0),
        }
    }

    /// Called by a worker after it finished a batch.
    pub fn batch_done(&self, records: u64) {
        let total = self.records.fetch_add(records, Ordering::Relaxed) + records;
        self.bar.inc(1);
        self.bar.set_message(format!("{total} records"));
    }

    pub fn batches(&self) -> u64 {
        self.bar.position()
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Runs `f` as a named stage. With the `profiling` feature the wall-clock time
/// is logged and recorded in `timings`.
#[cfg(feature = "profiling")]
pub fn time_stage<T>(timings: &mut BTreeMap<String, u64>, name: &str, f: impl FnOnce() -> T) -> T {
    let start = std::time::Instant::now();
    let out = f();
    let millis = start.elapsed().as_millis() as u64;
    log::info!("stage {name} took {millis} ms");
    *timings.entry(name.to_string()).or_insert(0) += millis;
    out
}

/// Runs `f` as a named stage. With the `profiling` feature the wall-clock time
/// is logged and recorded in `timings`.
#[cfg(not(feature = "profiling"))]
#[inline(always)]
pub fn time_stage<T>(_timings: &mut BTreeMap<String, u64>, _name: &str, f: impl FnOnce() -> T) -> T {
    f()
}
