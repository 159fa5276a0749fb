use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::{
    config::RescanConfig,
    database::{CollectServersFilter, ServerStore},
    scanner::targets::ScanRange,
};

/// Servers that were seen within `last_ping_ago_max_secs` but not in the last
/// `rescan_every_secs`.
///
/// Windows that reach further back than chrono can represent start at the
/// earliest representable time.
pub fn rescan_filter(opts: &RescanConfig, now: DateTime<Utc>) -> CollectServersFilter {
    CollectServersFilter {
        seen_after: secs_before(now, opts.last_ping_ago_max_secs),
        seen_before: secs_before(now, opts.rescan_every_secs),
        limit: opts.limit,
    }
}

fn secs_before(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|ago| now.checked_sub_signed(ago))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub async fn get_ranges<S: ServerStore>(
    store: &S,
    opts: &RescanConfig,
) -> eyre::Result<Vec<ScanRange>> {
    let filter = rescan_filter(opts, Utc::now());
    let servers = store.collect_servers(&filter).await?;
    debug!("Got {} servers to rescan", servers.len());

    Ok(servers
        .into_iter()
        .map(|addr| ScanRange::single(*addr.ip(), addr.port()))
        .collect())
}
