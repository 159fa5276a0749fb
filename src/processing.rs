pub mod minecraft;

use std::{collections::BTreeSet, fmt, net::SocketAddrV4};

use chrono::{DateTime, Utc};

use crate::scanner::protocols::{self, Protocol};

use self::minecraft::{PingResponse, legacy::parse_legacy_response, parse_ping_response_json};

/// A server that completed a status exchange and passed the filters. This is
/// the unit that gets upserted, keyed on `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRecord {
    pub target: SocketAddrV4,
    /// The description exactly as the server sent it (usually JSON).
    pub motd_raw: String,
    /// The description as plain text, with formatting codes removed.
    pub motd_formatted: String,
    pub players_online: i32,
    pub players_max: i32,
    /// Names from the player sample, in the order the server sent them. This
    /// is usually truncated to 12 players and may be empty even if players
    /// are online. Empty if the sample looks fake.
    pub player_list: Vec<String>,
    pub mods: BTreeSet<String>,
    pub version_name: String,
    pub version_protocol: Option<i32>,
    pub favicon_hash: Option<String>,
    pub is_online_mode: Option<bool>,
    pub enforces_secure_chat: Option<bool>,
    pub prevents_chat_reports: Option<bool>,
    /// Whether the server only answered the pre-1.7 ping.
    pub is_legacy: bool,
    pub last_seen: DateTime<Utc>,
}

impl ServerRecord {
    pub fn new(target: SocketAddrV4, r: PingResponse, last_seen: DateTime<Utc>) -> Self {
        Self {
            target,
            motd_raw: r.description_raw,
            motd_formatted: r.description_plaintext,
            players_online: r.online_players.unwrap_or_default(),
            players_max: r.max_players.unwrap_or_default(),
            // randomized or anonymized samples aren't real players
            player_list: if r.is_fake_sample {
                Vec::new()
            } else {
                r.player_sample.into_iter().map(|p| p.name).collect()
            },
            mods: r.mods,
            version_name: r.version_name.unwrap_or_else(|| "Unknown".to_string()),
            version_protocol: r.version_protocol,
            favicon_hash: r.favicon_hash,
            is_online_mode: r.is_online_mode,
            enforces_secure_chat: r.enforces_secure_chat,
            prevents_chat_reports: r.prevents_chat_reports,
            is_legacy: r.is_legacy,
            last_seen,
        }
    }

    /// The `_id` of the document, like `1.2.3.4:25565`.
    pub fn key(&self) -> String {
        self.target.to_string()
    }
}

/// Why a server that replied was still discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// The MOTD or version matched the opt-out denylist.
    OptOut,
    /// `opt_out.version_filter` is set and the version didn't match.
    VersionMismatch,
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterReason::OptOut => write!(f, "opted out"),
            FilterReason::VersionMismatch => write!(f, "version mismatch"),
        }
    }
}

/// A protocol whose framed response can be turned into a [`PingResponse`].
pub trait ProcessableProtocol: Protocol {
    fn parse_status(data: &[u8]) -> eyre::Result<PingResponse>;
}

impl ProcessableProtocol for protocols::Minecraft {
    fn parse_status(data: &[u8]) -> eyre::Result<PingResponse> {
        parse_ping_response_json(data)
    }
}

impl ProcessableProtocol for protocols::LegacyMinecraft {
    fn parse_status(data: &[u8]) -> eyre::Result<PingResponse> {
        parse_legacy_response(&String::from_utf8_lossy(data))
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    fn record(json: &str) -> ServerRecord {
        ServerRecord::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 25565),
            parse_ping_response_json(json.as_bytes()).unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn test_real_sample_is_kept() {
        let r = record(
            r#"{"description":"hi","players":{"max":20,"online":2,"sample":[
                {"name":"Notch","id":"069a79f4-44e9-4726-a5be-fca90e38aaf5"},
                {"name":"jeb_","id":"853c80ef-3c37-49fd-aa49-938b674adae6"}
            ]}}"#,
        );
        assert_eq!(r.player_list, vec!["Notch", "jeb_"]);
        assert_eq!(r.is_online_mode, Some(true));
    }

    #[test]
    fn test_fake_sample_is_dropped() {
        // duplicate uuid
        let r = record(
            r#"{"description":"hi","players":{"max":20,"online":2,"sample":[
                {"name":"Notch","id":"069a79f4-44e9-4726-a5be-fca90e38aaf5"},
                {"name":"Notch2","id":"069a79f4-44e9-4726-a5be-fca90e38aaf5"}
            ]}}"#,
        );
        assert!(r.player_list.is_empty());
        assert_eq!(r.players_online, 2);

        // not a v3 or v4 uuid
        let r = record(
            r#"{"description":"hi","players":{"max":20,"online":1,"sample":[
                {"name":"Steve","id":"00000000-0000-1000-8000-000000000001"}
            ]}}"#,
        );
        assert!(r.player_list.is_empty());
    }
}
