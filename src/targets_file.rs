//! Scanning the neighborhoods of known servers listed in a file.
//!
//! Every line is an IP, an `IP:PORT`, or a domain. Lines are removed from the
//! file as they're picked up so several processes can share one file, and we
//! keep going until it's empty.

use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    net::{IpAddr, Ipv4Addr, SocketAddrV4},
    path::Path,
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, TargetsFileConfig},
    database::ServerStore,
    scanner::{
        ScanContext, scan_ranges,
        targets::{Ipv4Range, Ipv4Ranges, ScanRange, ScanRanges},
    },
    terminal_colors::*,
};

/// How many times removing a line from the file is tried.
const REMOVE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetLine {
    Addr(SocketAddrV4),
    Domain { host: String, port: Option<u16> },
    /// We can't scan these.
    Ipv6,
}

/// Parse a line from the targets file. The port defaults to `default_port`
/// for addresses, domains keep `None` so the resolver can pick one.
pub fn parse_target_line(line: &str, default_port: u16) -> Option<TargetLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Ok(ip) = line.parse::<IpAddr>() {
        return Some(match ip {
            IpAddr::V4(ip) => TargetLine::Addr(SocketAddrV4::new(ip, default_port)),
            IpAddr::V6(_) => TargetLine::Ipv6,
        });
    }
    if let Ok(addr) = line.parse::<SocketAddrV4>() {
        return Some(TargetLine::Addr(addr));
    }
    if line.starts_with('[') || line.matches(':').count() > 1 {
        return Some(TargetLine::Ipv6);
    }

    let (host, port) = match line.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => return None,
        },
        None => (line, None),
    };
    if host.is_empty() {
        return None;
    }
    Some(TargetLine::Domain {
        host: host.to_lowercase(),
        port,
    })
}

/// The fields we care about from mcsrvstat-like status APIs.
#[derive(Deserialize, Debug, Default)]
struct StatusApiResponse {
    ip: Option<String>,
    hostname: Option<String>,
    address: Option<String>,
    port: Option<u16>,
}

pub struct Resolver {
    client: reqwest::Client,
    resolve_urls: Vec<String>,
    default_port: u16,
}

impl Resolver {
    pub fn new(config: &TargetsFileConfig, default_port: u16) -> eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.resolve_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            resolve_urls: config.resolve_urls.clone(),
            default_port,
        })
    }

    /// Turn a line into an IPv4 address and port, or None if it can't be
    /// resolved or isn't IPv4.
    pub async fn resolve(&self, line: &str) -> Option<SocketAddrV4> {
        match parse_target_line(line, self.default_port)? {
            TargetLine::Addr(addr) => Some(addr),
            TargetLine::Ipv6 => {
                println!("{RED}[SKIP] IPv6 not supported: {line}{RESET}");
                None
            }
            TargetLine::Domain { host, port } => self.resolve_domain(&host, port).await,
        }
    }

    async fn resolve_domain(&self, host: &str, port: Option<u16>) -> Option<SocketAddrV4> {
        for url in &self.resolve_urls {
            let url = url.replace("{}", host);
            match self.query_status_api(&url).await {
                Ok(r) => {
                    let port = r.port.or(port).unwrap_or(self.default_port);
                    let Some(ip) = r.ip.or(r.hostname).or(r.address) else {
                        continue;
                    };
                    // sometimes the api gives us the port along with the ip
                    let (ip, port) = match ip.rsplit_once(':') {
                        Some((ip, p)) if !ip.contains(':') => {
                            (ip.to_string(), p.parse().unwrap_or(port))
                        }
                        _ => (ip, port),
                    };
                    if let Some(addr) = lookup_ipv4(&ip, port).await {
                        return Some(addr);
                    }
                }
                Err(err) => debug!("{url} failed: {err}"),
            }
        }

        lookup_ipv4(host, port.unwrap_or(self.default_port)).await
    }

    async fn query_status_api(&self, url: &str) -> eyre::Result<StatusApiResponse> {
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<StatusApiResponse>()
            .await?)
    }
}

/// Resolve with DNS, ignoring AAAA records.
async fn lookup_ipv4(host: &str, port: u16) -> Option<SocketAddrV4> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(SocketAddrV4::new(ip, port));
    }
    let addrs = tokio::net::lookup_host((host, port)).await.ok()?;
    addrs.into_iter().find_map(|addr| match addr {
        std::net::SocketAddr::V4(addr) => Some(addr),
        std::net::SocketAddr::V6(_) => None,
    })
}

/// An exclusive advisory lock on a file, released when dropped.
struct FileLock<'a> {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> io::Result<Self> {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if res == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// All non-empty lines in the file, trimmed.
pub fn read_targets(path: &Path) -> eyre::Result<Vec<String>> {
    let file = File::open(path)?;
    let _lock = FileLock::exclusive(&file)?;
    let mut contents = String::new();
    (&file).read_to_string(&mut contents)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Remove the first line equal to `target` from the file. Returns false if it
/// was already gone (probably taken by another process).
pub fn remove_target(path: &Path, target: &str) -> eyre::Result<bool> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let _lock = FileLock::exclusive(&file)?;

    let mut contents = String::new();
    (&file).read_to_string(&mut contents)?;

    let mut found = false;
    let mut new_contents = String::with_capacity(contents.len());
    for line in contents.lines() {
        if !found && line.trim() == target {
            found = true;
            continue;
        }
        new_contents.push_str(line);
        new_contents.push('\n');
    }
    if !found {
        return Ok(false);
    }

    file.set_len(0)?;
    (&file).seek(SeekFrom::Start(0))?;
    (&file).write_all(new_contents.as_bytes())?;
    file.sync_all()?;
    Ok(true)
}

/// The ranges to scan around the resolved targets, with overlapping
/// neighborhoods merged.
pub fn neighborhood_ranges(addrs: &[SocketAddrV4], prefix: u8) -> ScanRanges {
    let mut ranges = ScanRanges::new();
    ranges.extend(
        addrs
            .iter()
            .map(|addr| ScanRange::from_ipv4_range(Ipv4Range::hosts(*addr.ip(), prefix), addr.port()))
            .collect(),
    );
    ranges.merge_overlapping();
    ranges
}

/// Remove the resolved lines from the file and return the addresses to scan
/// around. A line that can't be removed is still scanned and added to
/// `unremovable`.
async fn take_targets(
    path: &Path,
    resolved: Vec<(String, Option<SocketAddrV4>)>,
    prefix: u8,
    unremovable: &mut HashSet<String>,
) -> Vec<SocketAddrV4> {
    let mut addrs = Vec::new();
    for (line, addr) in resolved {
        // unresolvable lines are removed too, otherwise we'd retry them forever
        match remove_target_with_retry(path, &line).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Couldn't remove {line}, it was probably taken by another process");
                if addr.is_some() {
                    println!("{YELLOW}[WARN] {line} was already removed, scanning it anyways{RESET}");
                }
            }
            Err(err) => {
                error!("Couldn't remove {line} from {}: {err}", path.display());
                println!("{RED}[REMOVE ERROR] {line}: {err}{RESET}");
                unremovable.insert(line.clone());
            }
        }
        match addr {
            Some(addr) => {
                println!("{BLUE}[START] {line} is {addr}, scanning its /{prefix}{RESET}");
                addrs.push(addr);
            }
            None => println!("{RED}[RESOLVE FAIL] {line}{RESET}"),
        }
    }
    addrs
}

async fn remove_target_with_retry(path: &Path, target: &str) -> eyre::Result<bool> {
    let mut attempt = 1;
    loop {
        match remove_target(path, target) {
            Ok(removed) => return Ok(removed),
            Err(err) if attempt >= REMOVE_ATTEMPTS => return Err(err),
            Err(err) => {
                debug!("removing {target} failed (attempt {attempt}): {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                attempt += 1;
            }
        }
    }
}

/// Keep taking targets from the file and scanning around them until it's
/// empty or we're told to stop.
///
/// Lines are taken a batch at a time and only removed right before their
/// neighborhoods are scanned, so stopping early leaves the rest of the file
/// alone.
pub async fn run<S: ServerStore>(
    ctx: &mut ScanContext,
    path: &Path,
    store: Arc<S>,
    exclude_ranges: &Ipv4Ranges,
) -> eyre::Result<()> {
    let config: &Config = &ctx.config;
    let resolver = Resolver::new(&config.targets_file, config.target.port)?;
    let prefix = config.targets_file.subnet_prefix;
    let batch_size = config.targets_file.batch_size.max(1);
    // lines we failed to remove stay in the file, they're only scanned once
    let mut unremovable = HashSet::new();

    while !ctx.has_ended() {
        if !path.exists() {
            println!("{GREEN}{} not found, exiting.{RESET}", path.display());
            break;
        }
        let mut lines = read_targets(path)?;
        lines.retain(|line| !unremovable.contains(line));
        if lines.is_empty() {
            println!("{GREEN}No targets left in {}, exiting.{RESET}", path.display());
            break;
        }
        lines.shuffle(&mut rand::thread_rng());
        println!("{BLUE}{} targets left in {}{RESET}", lines.len(), path.display());

        for batch in lines.chunks(batch_size) {
            if ctx.has_ended() {
                break;
            }
            let resolved = join_all(batch.iter().map(|line| {
                let resolver = &resolver;
                async move { (line.clone(), resolver.resolve(line).await) }
            }))
            .await;
            // nothing in this batch was removed yet
            if ctx.has_ended() {
                break;
            }

            let addrs = take_targets(path, resolved, prefix, &mut unremovable).await;
            if addrs.is_empty() {
                continue;
            }

            let ranges = neighborhood_ranges(&addrs, prefix);
            info!(
                "Scanning around {} targets ({} addresses)",
                addrs.len(),
                ranges.count()
            );

            ctx.reset_counters();
            scan_ranges(ctx, ranges, exclude_ranges, store.clone()).await?;
        }
    }

    Ok(())
}
