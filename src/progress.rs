//! Counters shared by the workers and the sink, and the task that prints them.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tracing::info;

use crate::terminal_colors::*;

#[derive(Default, Debug)]
pub struct ScanCounters {
    /// Targets that finished probing, whatever the result.
    pub attempted: AtomicU64,
    /// Servers that replied with a valid status and weren't filtered.
    pub found: AtomicU64,
    /// Servers that replied but were filtered out.
    pub filtered: AtomicU64,
    /// Records that were new to the store.
    pub inserted: AtomicU64,
    /// Records that replaced an existing document.
    pub updated: AtomicU64,
    /// Records dropped after the store kept failing.
    pub lost: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub attempted: u64,
    pub found: u64,
    pub filtered: u64,
    pub inserted: u64,
    pub updated: u64,
    pub lost: u64,
}

impl ScanCounters {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            attempted: self.attempted.load(Ordering::Relaxed),
            found: self.found.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }
}

impl Snapshot {
    pub fn stored(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Like `1234 addrs/s` or `12 kaddrs/s`.
pub fn format_rate(per_second: f64) -> String {
    if per_second > 10_000_000. {
        format!("{} maddrs/s", (per_second / 1_000_000.).round() as u64)
    } else if per_second > 10_000. {
        format!("{} kaddrs/s", (per_second / 1_000.).round() as u64)
    } else {
        format!("{} addrs/s", per_second.round() as u64)
    }
}

/// Print a progress line every `interval` until `has_ended` is set. Never
/// modifies the counters.
pub async fn report_progress(
    counters: Arc<ScanCounters>,
    total: u64,
    interval: Duration,
    has_ended: Arc<AtomicBool>,
) {
    let start = Instant::now();
    let mut last = counters.snapshot();
    let mut last_time = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if has_ended.load(Ordering::Relaxed) {
            break;
        }

        let now = counters.snapshot();
        let rate = (now.attempted - last.attempted) as f64 / last_time.elapsed().as_secs_f64();
        let percent = if total == 0 {
            100.
        } else {
            now.attempted as f64 / total as f64 * 100.
        };

        println!(
            "{GRAY}attempted {BOLD}{}{RESET}{GRAY}/{total} ({percent:.1}%), {RESET}{GREEN}found {BOLD}{}{RESET}{GRAY}, filtered {}, stored {}, lost {}, {}{RESET}",
            now.attempted,
            now.found,
            now.filtered,
            now.stored(),
            now.lost,
            format_rate(rate),
        );
        info!(
            "Progress after {:?}: attempted {}/{total}, found {}, filtered {}, stored {}, lost {}, {}",
            start.elapsed(),
            now.attempted,
            now.found,
            now.filtered,
            now.stored(),
            now.lost,
            format_rate(rate),
        );

        last = now;
        last_time = Instant::now();
    }
}

/// Print the final summary of a scan.
pub fn print_summary(snapshot: &Snapshot, elapsed: Duration) {
    let elapsed_secs = elapsed.as_secs_f64();
    let rate = if elapsed_secs > 0. {
        snapshot.attempted as f64 / elapsed_secs
    } else {
        0.
    };
    println!(
        "ok finished after {BOLD}{elapsed_secs:.1}{RESET} seconds ({YELLOW}attempted {BOLD}{}{RESET}, {GREEN}found {BOLD}{}{RESET}, {BLUE}added {}{RESET}, updated {}, filtered {}, {RED}lost {}{RESET}, {})",
        snapshot.attempted,
        snapshot.found,
        snapshot.inserted,
        snapshot.updated,
        snapshot.filtered,
        snapshot.lost,
        format_rate(rate),
    );
    info!(
        "Finished after {elapsed_secs:.1} seconds. Attempted {}, found {}, added {}, updated {}, filtered {}, lost {}",
        snapshot.attempted,
        snapshot.found,
        snapshot.inserted,
        snapshot.updated,
        snapshot.filtered,
        snapshot.lost,
    );
}
