pub mod probe;
pub mod protocols;
pub mod targets;
pub mod throttle;

use std::{
    net::SocketAddrV4,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use perfect_rand::PerfectRng;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::Config,
    database::{ServerStore, sink::ResultSink},
    processing::ServerRecord,
    progress::{ScanCounters, Snapshot, print_summary, report_progress},
    terminal_colors::*,
};

use self::{
    probe::{ProbeOutcome, Prober},
    targets::{Ipv4Ranges, ScanRanges, StaticScanRanges, Targets},
    throttle::Throttler,
};

/// The state shared by everything taking part in a scan.
#[derive(Clone)]
pub struct ScanContext {
    pub config: Arc<Config>,
    pub counters: Arc<ScanCounters>,
    /// Set when we're asked to stop (usually by ctrl+c).
    pub has_ended: Arc<AtomicBool>,
}

impl ScanContext {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            counters: Arc::new(ScanCounters::default()),
            has_ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start counting from zero, for when the same context is used for
    /// several scans.
    pub fn reset_counters(&mut self) {
        self.counters = Arc::new(ScanCounters::default());
    }

    pub fn has_ended(&self) -> bool {
        self.has_ended.load(Ordering::Relaxed)
    }
}

/// The targets of one scan.
pub struct ScanSession {
    pub rng: Option<PerfectRng>,
    pub ranges: StaticScanRanges,
}

impl ScanSession {
    /// If `shuffle` is false the targets are produced in ascending order of
    /// address and then port.
    pub fn new(ranges: ScanRanges, shuffle: bool) -> Self {
        let count = ranges.count();
        Self {
            // PerfectRng doesn't like tiny ranges and there's nothing to
            // shuffle anyways
            rng: (shuffle && count > 1).then(|| PerfectRng::from_range(count as u64)),
            ranges: ranges.to_static(),
        }
    }

    pub fn count(&self) -> usize {
        self.ranges.count
    }

    pub fn into_targets(self) -> Targets {
        Targets::new(self.ranges, self.rng)
    }
}

/// Probe every target in the session and store what we find. Returns once
/// every target has been attempted (or we were told to stop) and every
/// record has been written.
pub async fn run_scan<S: ServerStore>(
    ctx: &ScanContext,
    session: ScanSession,
    store: Arc<S>,
) -> eyre::Result<Snapshot> {
    let start = Instant::now();
    let config = &ctx.config;
    let prober = Arc::new(Prober::new(config)?);
    let worker_count = config.scanner.workers.max(1);
    let total = session.count() as u64;

    info!("Scanning {total} targets with {worker_count} workers");

    let (target_tx, target_rx) = mpsc::channel::<SocketAddrV4>(worker_count * 2);
    let (record_tx, record_rx) = mpsc::channel::<ServerRecord>(worker_count * 2);

    let sink = ResultSink::new(store, ctx.counters.clone(), &config.storage);
    let sink_task = tokio::spawn(sink.run(record_rx));

    let scan_done = Arc::new(AtomicBool::new(false));
    let reporter = if config.progress.interval_secs > 0 {
        Some(tokio::spawn(report_progress(
            ctx.counters.clone(),
            total,
            Duration::from_secs(config.progress.interval_secs),
            scan_done.clone(),
        )))
    } else {
        None
    };

    let feeder = tokio::spawn(feed_targets(
        session.into_targets(),
        target_tx,
        config.scanner.rate,
        ctx.has_ended.clone(),
    ));

    let target_rx = Arc::new(Mutex::new(target_rx));
    let mut workers = JoinSet::new();
    for _ in 0..worker_count {
        workers.spawn(worker(
            target_rx.clone(),
            prober.clone(),
            record_tx.clone(),
            ctx.counters.clone(),
        ));
    }
    // the workers hold the only references now, so the channels close when
    // they're done
    drop(target_rx);
    drop(record_tx);

    while !workers.is_empty() {
        if ctx.has_ended() {
            // dropping the tasks closes their sockets
            workers.abort_all();
        }
        if let Ok(Some(Err(err))) =
            tokio::time::timeout(Duration::from_millis(100), workers.join_next()).await
            && err.is_panic()
        {
            error!("Worker panicked: {err}");
        }
    }

    let fed = feeder.await?;
    debug!("fed {fed} targets");
    sink_task.await?;

    scan_done.store(true, Ordering::Relaxed);
    if let Some(reporter) = reporter {
        reporter.abort();
        let _ = reporter.await;
    }

    let snapshot = ctx.counters.snapshot();
    if ctx.has_ended() {
        warn!(
            "Scan interrupted after {:?} with {}/{total} targets attempted",
            start.elapsed(),
            snapshot.attempted
        );
    }
    Ok(snapshot)
}

/// Remove the excluded addresses, scan what's left, and print a summary.
pub async fn scan_ranges<S: ServerStore>(
    ctx: &ScanContext,
    mut ranges: ScanRanges,
    exclude_ranges: &Ipv4Ranges,
    store: Arc<S>,
) -> eyre::Result<Snapshot> {
    let count_before_exclude = ranges.count();
    ranges.apply_exclude(exclude_ranges);

    let target_count = ranges.count();
    let range_count = ranges.ranges().len();
    println!("scanning {target_count} targets ({range_count} ranges)");
    if count_before_exclude > target_count {
        println!(
            "excluded {} targets from this scan",
            count_before_exclude - target_count
        );
    }

    let start = Instant::now();
    let session = ScanSession::new(ranges, ctx.config.scanner.shuffle);
    let snapshot = run_scan(ctx, session, store).await?;
    print_summary(&snapshot, start.elapsed());
    Ok(snapshot)
}

/// Send targets to the workers, at most `rate` per second if it's set.
/// Returns the number of targets sent.
async fn feed_targets(
    mut targets: Targets,
    tx: mpsc::Sender<SocketAddrV4>,
    rate: Option<u64>,
    has_ended: Arc<AtomicBool>,
) -> u64 {
    let mut throttler = rate.map(Throttler::new);
    let mut fed: u64 = 0;

    'feed: loop {
        let batch_size = match &mut throttler {
            Some(throttler) => throttler.next_batch().await,
            // the channel does the throttling
            None => 1024,
        };
        for _ in 0..batch_size {
            if has_ended.load(Ordering::Relaxed) {
                break 'feed;
            }
            let Some(target) = targets.next() else {
                break 'feed;
            };
            if tx.send(target).await.is_err() {
                // the workers are gone
                break 'feed;
            }
            fed += 1;
        }
    }

    fed
}

async fn worker(
    targets: Arc<Mutex<mpsc::Receiver<SocketAddrV4>>>,
    prober: Arc<Prober>,
    records: mpsc::Sender<ServerRecord>,
    counters: Arc<ScanCounters>,
) {
    loop {
        let Some(target) = targets.lock().await.recv().await else {
            break;
        };

        let outcome = prober.probe_target(target).await;
        counters.attempted.fetch_add(1, Ordering::Relaxed);

        match outcome {
            ProbeOutcome::Found(record) => {
                counters.found.fetch_add(1, Ordering::Relaxed);
                print_found(&record);
                if records.send(*record).await.is_err() {
                    warn!("record channel closed, dropping {target}");
                }
            }
            ProbeOutcome::Filtered(reason) => {
                counters.filtered.fetch_add(1, Ordering::Relaxed);
                debug!("skipping {target}: {reason}");
            }
            ProbeOutcome::NotFound => {}
            ProbeOutcome::Failed(err) => {
                trace!("{target}: {err}");
            }
        }
    }
}

fn print_found(record: &ServerRecord) {
    let motd = record.motd_formatted.replace('\n', " ");
    println!(
        "{GREEN}[ONLINE]{RESET} {BOLD}{}{RESET} » {motd} {GRAY}| {}/{} | {}{RESET}",
        record.target, record.players_online, record.players_max, record.version_name
    );
    info!(
        "found {} ({}, {}/{} players)",
        record.target, record.version_name, record.players_online, record.players_max
    );
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::{targets::ScanRange, *};

    fn ranges() -> ScanRanges {
        let mut ranges = ScanRanges::new();
        ranges.extend(vec![ScanRange::single_port(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::new(10, 0, 0, 255),
            25565,
        )]);
        ranges
    }

    #[test]
    fn test_session_ascending() {
        let targets = ScanSession::new(ranges(), false)
            .into_targets()
            .collect::<Vec<_>>();
        assert_eq!(targets.len(), 256);
        assert_eq!(
            targets[0],
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 0), 25565)
        );
        assert!(targets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_session_shuffled_has_same_targets() {
        let mut shuffled = ScanSession::new(ranges(), true)
            .into_targets()
            .collect::<Vec<_>>();
        shuffled.sort();
        let ascending = ScanSession::new(ranges(), false)
            .into_targets()
            .collect::<Vec<_>>();
        assert_eq!(shuffled, ascending);
    }

    #[tokio::test]
    async fn test_feeder_stops_when_ended() {
        let (tx, mut rx) = mpsc::channel(8);
        let has_ended = Arc::new(AtomicBool::new(true));
        let fed = feed_targets(
            ScanSession::new(ranges(), false).into_targets(),
            tx,
            None,
            has_ended,
        )
        .await;
        assert_eq!(fed, 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_feeder_sends_everything() {
        let (tx, mut rx) = mpsc::channel(8);
        let feeder = tokio::spawn(feed_targets(
            ScanSession::new(ranges(), false).into_targets(),
            tx,
            Some(100_000),
            Arc::new(AtomicBool::new(false)),
        ));
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 256);
        assert_eq!(feeder.await.unwrap(), 256);
    }
}
