use std::{env, fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where discovered servers are stored. If this isn't set, servers are
    /// only kept in memory for the duration of the run (and printed).
    #[serde(default)]
    pub mongodb_uri: Option<String>,
    #[serde(default = "default_database_name")]
    pub database_name: String,
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Write debug logs to a daily rotating file in this directory.
    #[serde(default)]
    pub logging_dir: Option<String>,

    /// A file with ranges that should never be scanned, one per line. Lines
    /// look like `10.0.0.0/8`, `10.0.0.1-10.0.0.5`, or `10.0.0.1`, and
    /// everything after a `#` is ignored.
    #[serde(default)]
    pub exclude_file: Option<String>,

    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub opt_out: OptOutConfig,
    #[serde(default)]
    pub targets_file: TargetsFileConfig,
    #[serde(default)]
    pub rescan: RescanConfig,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct TargetConfig {
    pub port: u16,
    /// The protocol version sent in the handshake. Servers reply to the
    /// status request regardless of the version, 47 is 1.8.
    pub protocol_version: i32,
    /// The hostname sent in the handshake. Defaults to the target's IP.
    pub addr: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct ScannerConfig {
    /// The number of targets being probed at the same time.
    pub workers: usize,
    /// How long a single probe (connect, request, and response) may take.
    pub timeout_ms: u64,
    /// The maximum number of targets started per second. Unlimited if unset.
    pub rate: Option<u64>,
    /// Scan the targets in a pseudo-random order instead of ascending.
    pub shuffle: bool,
    /// Try the pre-1.7 ping if a server connects but doesn't understand the
    /// modern one.
    pub legacy_fallback: bool,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct ProgressConfig {
    pub interval_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    /// The maximum number of upserts in flight at once.
    pub max_concurrent_writes: usize,
    /// The maximum size of the MongoDB connection pool.
    pub max_pool_size: u32,
    /// How many times an upsert is tried before the record is dropped.
    pub max_attempts: u32,
    /// The delay before the first retry, doubled for every retry after that.
    pub backoff_ms: u64,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct OptOutConfig {
    /// Include the built-in list of placeholder MOTDs and versions from
    /// hosting providers and servers that asked to be excluded.
    pub builtin: bool,
    /// Case-insensitive substrings, a server whose MOTD contains any of them
    /// is skipped.
    pub motd_contains: Vec<String>,
    /// Case-insensitive substrings matched against the version name.
    pub version_contains: Vec<String>,
    /// Regexes matched against the plaintext MOTD.
    pub motd_patterns: Vec<String>,
    /// If set, only servers with exactly this version name are kept.
    pub version_filter: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct TargetsFileConfig {
    /// The size of the block scanned around every target.
    pub subnet_prefix: u8,
    /// How many lines are resolved, removed, and scanned together.
    pub batch_size: usize,
    /// Status APIs used to resolve domains, `{}` is replaced with the
    /// domain. They're tried in order before falling back to DNS.
    pub resolve_urls: Vec<String>,
    pub resolve_timeout_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct RescanConfig {
    /// Only rescan servers that weren't seen in this many seconds.
    pub rescan_every_secs: u64,
    /// The maximum number of seconds since a server was last seen to consider
    /// it for rescanning.
    pub last_ping_ago_max_secs: u64,
    pub limit: Option<usize>,
}

/// About 100 years, far more than anyone needs but still fits in a
/// `chrono::Duration` subtracted from now.
pub const MAX_RESCAN_SECS: u64 = 60 * 60 * 24 * 365 * 100;

fn default_database_name() -> String {
    "mcscanner".to_string()
}
fn default_collection() -> String {
    "servers".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mongodb_uri: None,
            database_name: default_database_name(),
            collection: default_collection(),
            logging_dir: None,
            exclude_file: None,
            target: TargetConfig::default(),
            scanner: ScannerConfig::default(),
            progress: ProgressConfig::default(),
            storage: StorageConfig::default(),
            opt_out: OptOutConfig::default(),
            targets_file: TargetsFileConfig::default(),
            rescan: RescanConfig::default(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            port: 25565,
            protocol_version: 47,
            addr: None,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            workers: 500,
            timeout_ms: 1600,
            rate: None,
            shuffle: false,
            legacy_fallback: false,
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_concurrent_writes: 16,
            max_pool_size: 16,
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

impl Default for OptOutConfig {
    fn default() -> Self {
        Self {
            builtin: true,
            motd_contains: Vec::new(),
            version_contains: Vec::new(),
            motd_patterns: Vec::new(),
            version_filter: None,
        }
    }
}

impl Default for TargetsFileConfig {
    fn default() -> Self {
        Self {
            subnet_prefix: 21,
            batch_size: 16,
            resolve_urls: vec!["https://api.mcsrvstat.us/2/{}".to_string()],
            resolve_timeout_secs: 6,
        }
    }
}

impl Default for RescanConfig {
    fn default() -> Self {
        Self {
            rescan_every_secs: 60 * 60,
            last_ping_ago_max_secs: 60 * 60 * 24 * 7,
            limit: None,
        }
    }
}

impl Config {
    /// Read the config at the given path, or use the defaults if it doesn't
    /// exist. Environment variables are applied on top.
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let mut config = if path.exists() {
            println!(
                "parsing config at {}",
                path.as_os_str().to_string_lossy()
            );
            toml::from_str::<Config>(&fs::read_to_string(path)?)?
        } else {
            println!(
                "no config at {}, using defaults",
                path.as_os_str().to_string_lossy()
            );
            Config::default()
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override values from environment variables. `lookup` is `env::var`
    /// outside of tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> eyre::Result<()> {
        if let Some(uri) = lookup("MONGODB_URI").filter(|s| !s.is_empty()) {
            self.mongodb_uri = Some(uri);
        }
        if let Some(port) = lookup("MCSWEEP_PORT") {
            self.target.port = parse_env("MCSWEEP_PORT", &port)?;
        }
        if let Some(timeout) = lookup("MCSWEEP_TIMEOUT_MS") {
            self.scanner.timeout_ms = parse_env("MCSWEEP_TIMEOUT_MS", &timeout)?;
        }
        if let Some(workers) = lookup("MCSWEEP_WORKERS") {
            self.scanner.workers = parse_env("MCSWEEP_WORKERS", &workers)?;
        }
        if let Some(rate) = lookup("MCSWEEP_RATE") {
            self.scanner.rate = Some(parse_env("MCSWEEP_RATE", &rate)?);
        }
        if let Some(interval) = lookup("MCSWEEP_PROGRESS_INTERVAL_SECS") {
            self.progress.interval_secs = parse_env("MCSWEEP_PROGRESS_INTERVAL_SECS", &interval)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.scanner.workers == 0 {
            eyre::bail!("scanner.workers must be at least 1");
        }
        if self.scanner.timeout_ms == 0 {
            eyre::bail!("scanner.timeout_ms must be at least 1");
        }
        if self.storage.max_attempts == 0 {
            eyre::bail!("storage.max_attempts must be at least 1");
        }
        if self.storage.max_concurrent_writes == 0 {
            eyre::bail!("storage.max_concurrent_writes must be at least 1");
        }
        if self.targets_file.subnet_prefix > 32 {
            eyre::bail!("targets_file.subnet_prefix must be 0-32");
        }
        for (name, secs) in [
            ("rescan.rescan_every_secs", self.rescan.rescan_every_secs),
            ("rescan.last_ping_ago_max_secs", self.rescan.last_ping_ago_max_secs),
        ] {
            if secs > MAX_RESCAN_SECS {
                eyre::bail!("{name} must be at most {MAX_RESCAN_SECS}");
            }
        }
        Ok(())
    }

    /// Log the settings that matter most. Called once tracing is set up.
    pub fn log_summary(&self) {
        if self.mongodb_uri.is_none() {
            warn!("mongodb_uri isn't set, results won't be persisted");
        }
        info!(
            "workers = {}, timeout = {:?}, port = {}",
            self.scanner.workers,
            self.ping_timeout(),
            self.target.port
        );
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.scanner.timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> eyre::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| eyre::eyre!("invalid value {value:?} for {key}: {e}"))
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.target.port, 25565);
        assert_eq!(config.target.protocol_version, 47);
        assert_eq!(config.scanner.workers, 500);
        assert_eq!(config.scanner.timeout_ms, 1600);
        assert_eq!(config.database_name, "mcscanner");
        assert_eq!(config.collection, "servers");
        assert!(config.opt_out.builtin);
        assert_eq!(config.targets_file.subnet_prefix, 21);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            mongodb_uri = "mongodb://localhost:27017"

            [scanner]
            workers = 64
            shuffle = true

            [opt_out]
            motd_contains = ["protect", "invalid"]
            "#,
        )
        .unwrap();
        assert_eq!(config.mongodb_uri.as_deref(), Some("mongodb://localhost:27017"));
        assert_eq!(config.scanner.workers, 64);
        assert_eq!(config.scanner.timeout_ms, 1600);
        assert!(config.scanner.shuffle);
        assert_eq!(config.opt_out.motd_contains, vec!["protect", "invalid"]);
        assert!(config.opt_out.builtin);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(toml::from_str::<Config>("[scanner]\nthreads = 10").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("MONGODB_URI", "mongodb://db:27017"),
            ("MCSWEEP_PORT", "25566"),
            ("MCSWEEP_WORKERS", " 8 "),
            ("MCSWEEP_PROGRESS_INTERVAL_SECS", "1"),
        ]);
        let mut config = Config::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.mongodb_uri.as_deref(), Some("mongodb://db:27017"));
        assert_eq!(config.target.port, 25566);
        assert_eq!(config.scanner.workers, 8);
        assert_eq!(config.progress.interval_secs, 1);
        assert_eq!(config.scanner.timeout_ms, 1600);

        let mut config = Config::default();
        assert!(
            config
                .apply_env(|key| (key == "MCSWEEP_PORT").then(|| "70000".to_string()))
                .is_err()
        );
    }

    #[test]
    fn test_huge_rescan_window_is_invalid() {
        let mut config = Config::default();
        config.rescan.last_ping_ago_max_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rescan.rescan_every_secs = MAX_RESCAN_SECS;
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_workers_is_invalid() {
        let mut config = Config::default();
        config.scanner.workers = 0;
        assert!(config.validate().is_err());
    }
}
