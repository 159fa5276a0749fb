use regex::Regex;

use crate::{config::OptOutConfig, processing::FilterReason};

use super::PingResponse;

const BUILTIN_DESCRIPTIONS: &[&str] = &[
    "Craftserve.pl - wydajny hosting Minecraft!",
    "Pay for the server on https://craftserve.com to be able to log in.",
    "Craftserve: Error finding route. Please contact support.",
    "Nie znaleziono serwera o podanym adresie, zakup go na https://craftserve.com",
    //
    "Ochrona DDoS: Przekroczono limit polaczen.",
    "¨ |  ",
    "Start the server at FalixNodes.net/start",
    "This server is offline Powered by FalixNodes.net",
    "Serwer jest aktualnie wy",
    "Blad pobierania statusu. Polacz sie bezposrednio!",
    "Error connecting to server#",
    // asked to be excluded
    "The hub for all Devlencio servers",
    "Players World — равноправие",
];
const BUILTIN_VERSIONS: &[&str] = &["COSMIC GUARD", "TCPShield.com", "â  Error", "⚠ Error"];

/// Decides which servers we don't keep even though they replied.
pub struct OptOutFilter {
    /// Lowercase.
    motd_contains: Vec<String>,
    /// Lowercase.
    version_contains: Vec<String>,
    motd_patterns: Vec<Regex>,
    version_filter: Option<String>,
}

impl OptOutFilter {
    pub fn new(config: &OptOutConfig) -> eyre::Result<Self> {
        let mut motd_contains = Vec::new();
        let mut version_contains = Vec::new();
        if config.builtin {
            motd_contains.extend(BUILTIN_DESCRIPTIONS.iter().map(|s| s.to_lowercase()));
            version_contains.extend(BUILTIN_VERSIONS.iter().map(|s| s.to_lowercase()));
        }
        motd_contains.extend(
            config
                .motd_contains
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_lowercase()),
        );
        version_contains.extend(
            config
                .version_contains
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_lowercase()),
        );

        let motd_patterns = config
            .motd_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| eyre::eyre!("invalid opt_out.motd_patterns entry {p:?}: {e}")))
            .collect::<eyre::Result<Vec<_>>>()?;

        Ok(Self {
            motd_contains,
            version_contains,
            motd_patterns,
            version_filter: config.version_filter.clone().filter(|v| !v.is_empty()),
        })
    }

    /// Returns why the server should be skipped, or None if it should be
    /// stored.
    pub fn check(&self, r: &PingResponse) -> Option<FilterReason> {
        let motd = r.description_plaintext.to_lowercase();
        if self.motd_contains.iter().any(|s| motd.contains(s.as_str()))
            || self
                .motd_patterns
                .iter()
                .any(|p| p.is_match(&r.description_plaintext))
        {
            return Some(FilterReason::OptOut);
        }

        if let Some(version_name) = &r.version_name {
            let version_name = version_name.to_lowercase();
            if self
                .version_contains
                .iter()
                .any(|s| version_name.contains(s.as_str()))
            {
                return Some(FilterReason::OptOut);
            }
        }

        if let Some(version_filter) = &self.version_filter
            && r.version_name.as_deref() != Some(version_filter.as_str())
        {
            return Some(FilterReason::VersionMismatch);
        }

        None
    }
}
