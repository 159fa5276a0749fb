pub mod legacy;
pub mod opt_out;

use std::collections::{BTreeSet, HashSet};

use eyre::bail;
use serde::Deserialize;
use serde_json::Value;
use sha2::Digest;
use uuid::Uuid;

pub struct PingResponse {
    pub description_raw: String,
    pub description_plaintext: String,
    pub version_name: Option<String>,
    pub version_protocol: Option<i32>,

    pub favicon_hash: Option<String>,

    pub online_players: Option<i32>,
    pub max_players: Option<i32>,
    pub is_online_mode: Option<bool>,
    pub player_sample: Vec<SamplePlayer>,
    /// Whether the sample doesn't seem real.
    pub is_fake_sample: bool,

    pub enforces_secure_chat: Option<bool>,

    // non-vanilla fields

    // nochatreports and similar mods
    pub prevents_chat_reports: Option<bool>,
    /// Mod ids from forge's `forgeData` or the older `modinfo`.
    pub mods: BTreeSet<String>,

    pub is_legacy: bool,
}

#[derive(Clone, Debug)]
pub struct SamplePlayer {
    pub name: String,
    pub uuid: Uuid,
}

pub const ANONYMOUS_PLAYER_NAME: &str = "Anonymous Player";

pub fn parse_ping_response_json(d: &[u8]) -> eyre::Result<PingResponse> {
    let v: Value = match serde_json::from_slice(d) {
        Ok(v) => v,
        Err(_) => {
            bail!("Failed to parse JSON: {:?}", String::from_utf8_lossy(d));
        }
    };
    if !v.is_object() {
        bail!("Status response isn't an object");
    }

    let description = v.get("description");
    let version = v.get("version");
    let players = v.get("players");

    if description.is_none() && version.is_none() && players.is_none() {
        // some servers are missing one of these fields (even description isn't
        // technically required), but if they're missing all three then it's
        // probably not even a minecraft server
        bail!("Missing description, version, and players fields");
    }

    let description_raw = match description {
        Some(Value::String(s)) => s.clone(),
        Some(description) => serde_json::to_string(description)?,
        None => String::new(),
    };
    let description_plaintext = description
        .map(|description| {
            strip_formatting_codes(
                &azalea_chat::FormattedText::deserialize(description)
                    .unwrap_or_default()
                    .to_string(),
            )
        })
        .unwrap_or_default();

    let version_name = version
        .and_then(|v| v.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let version_protocol = version.and_then(|v| get_i32(v, "protocol"));

    let favicon = v
        .get("favicon")
        .and_then(Value::as_str)
        // filter out bad favicons
        .filter(|f| f.starts_with("data:image/png;base64,"));
    let favicon_hash = favicon.map(make_favicon_hash);

    let online_players = players.and_then(|p| get_i32(p, "online"));
    let max_players = players.and_then(|p| get_i32(p, "max"));
    let mut is_online_mode = None;
    let mut seen_uuids = HashSet::new();

    // servers with this motd randomize the online players
    let mut is_fake_sample = description_plaintext
        == "To protect the privacy of this server and its\nusers, you must log in once to see ping data.";

    let player_sample = players
        .and_then(|p| p.get("sample"))
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|v| {
                    let Some(name) = v.get("name").and_then(Value::as_str) else {
                        // name is required
                        is_fake_sample = true;
                        return None;
                    };
                    let uuid_str = v.get("id").and_then(Value::as_str);
                    let Some(uuid) = uuid_str.and_then(|s| Uuid::parse_str(s).ok()) else {
                        // uuid is required
                        is_fake_sample = true;
                        return None;
                    };
                    if !seen_uuids.insert(uuid) {
                        // no duplicate uuids allowed
                        is_fake_sample = true;
                        return None;
                    }

                    match uuid.get_version_num() {
                        4 => is_online_mode = Some(true),
                        3 => {
                            if is_online_mode.is_none() {
                                is_online_mode = Some(false);
                            }
                        }
                        _ if uuid.is_nil() && name == ANONYMOUS_PLAYER_NAME => {
                            // anonymous player doesn't give us any info
                        }
                        _ => is_fake_sample = true,
                    }

                    Some(SamplePlayer {
                        name: name.to_string(),
                        uuid,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let enforces_secure_chat = v.get("enforcesSecureChat").and_then(Value::as_bool);
    let prevents_chat_reports = v.get("preventsChatReports").and_then(Value::as_bool);

    Ok(PingResponse {
        description_raw,
        description_plaintext,

        version_name,
        version_protocol,
        favicon_hash,

        online_players,
        max_players,
        player_sample,
        is_online_mode,
        is_fake_sample,

        enforces_secure_chat,

        prevents_chat_reports,
        mods: collect_mods(&v),

        is_legacy: false,
    })
}

/// Forge 1.13+ sends `forgeData.mods[].modId`, older Forge sends
/// `modinfo.modList[].modid`.
fn collect_mods(v: &Value) -> BTreeSet<String> {
    let forge_mods = v
        .get("forgeData")
        .and_then(|f| f.get("mods"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|m| m.get("modId").and_then(Value::as_str));
    let legacy_forge_mods = v
        .get("modinfo")
        .and_then(|f| f.get("modList"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|m| m.get("modid").and_then(Value::as_str));

    forge_mods
        .chain(legacy_forge_mods)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn get_i32(v: &Value, key: &str) -> Option<i32> {
    v.get(key)
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok())
}

/// Remove `§` formatting codes (and the character after each one).
pub fn strip_formatting_codes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '§' {
            chars.next();
            continue;
        }
        out.push(c);
    }
    out
}

fn make_favicon_hash(favicon: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(favicon.as_bytes());
    let result = hasher.finalize();
    result[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_vanilla_response() {
        let r = parse_ping_response_json(
            br#"{
                "version": {"name": "1.20.4", "protocol": 765},
                "enforcesSecureChat": true,
                "description": {"text": "A Minecraft Server"},
                "players": {
                    "max": 20,
                    "online": 2,
                    "sample": [
                        {"name": "Notch", "id": "069a79f4-44e9-4726-a5be-fca90e38aaf5"},
                        {"name": "jeb_", "id": "853c80ef-3c37-49fd-aa49-938b674adae6"}
                    ]
                },
                "favicon": "data:image/png;base64,iVBORw0KGgo="
            }"#,
        )
        .unwrap();

        assert_eq!(r.description_plaintext, "A Minecraft Server");
        assert_eq!(r.description_raw, r#"{"text":"A Minecraft Server"}"#);
        assert_eq!(r.version_name.as_deref(), Some("1.20.4"));
        assert_eq!(r.version_protocol, Some(765));
        assert_eq!(r.online_players, Some(2));
        assert_eq!(r.max_players, Some(20));
        assert_eq!(
            r.player_sample
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>(),
            vec!["Notch", "jeb_"]
        );
        assert_eq!(r.is_online_mode, Some(true));
        assert!(!r.is_fake_sample);
        assert_eq!(r.enforces_secure_chat, Some(true));
        assert_eq!(r.favicon_hash.as_ref().map(String::len), Some(32));
        assert!(r.mods.is_empty());
    }

    #[test]
    fn test_parse_string_description_with_codes() {
        let r = parse_ping_response_json(
            r#"{"description": "§aGreen §lbold", "players": {"max": 10, "online": 0}}"#
                .as_bytes(),
        )
        .unwrap();
        assert_eq!(r.description_raw, "§aGreen §lbold");
        assert_eq!(r.description_plaintext, "Green bold");
        assert_eq!(r.version_name, None);
        assert!(r.player_sample.is_empty());
    }

    #[test]
    fn test_parse_forge_mods() {
        let r = parse_ping_response_json(
            br#"{
                "description": "modded",
                "version": {"name": "1.20.1", "protocol": 763},
                "forgeData": {
                    "channels": [],
                    "mods": [
                        {"modId": "minecraft", "modmarker": "1.20.1"},
                        {"modId": "forge", "modmarker": "47.2.0"},
                        {"modId": "create", "modmarker": "0.5.1"}
                    ],
                    "fmlNetworkVersion": 3
                }
            }"#,
        )
        .unwrap();
        assert_eq!(
            r.mods.into_iter().collect::<Vec<_>>(),
            vec!["create", "forge", "minecraft"]
        );

        let r = parse_ping_response_json(
            br#"{
                "description": "old modded",
                "modinfo": {"type": "FML", "modList": [{"modid": "mcp", "version": "9.19"}, {"modid": "FML", "version": "8.0"}]}
            }"#,
        )
        .unwrap();
        assert_eq!(r.mods.into_iter().collect::<Vec<_>>(), vec!["FML", "mcp"]);
    }

    #[test]
    fn test_fake_sample() {
        let r = parse_ping_response_json(
            br#"{
                "description": "",
                "players": {"max": 100, "online": 50, "sample": [
                    {"name": "a", "id": "00000000-0000-0000-0000-000000000000"},
                    {"name": "no id"}
                ]}
            }"#,
        )
        .unwrap();
        assert!(r.is_fake_sample);
        assert_eq!(r.player_sample.len(), 1);
    }

    #[test]
    fn test_not_a_minecraft_server() {
        assert!(parse_ping_response_json(br#"{"hello": "world"}"#).is_err());
        assert!(parse_ping_response_json(br#"{"description": "#).is_err());
        assert!(parse_ping_response_json(b"[1, 2, 3]").is_err());
    }

    #[test]
    fn test_strip_formatting_codes() {
        assert_eq!(strip_formatting_codes("§4§lRed"), "Red");
        assert_eq!(strip_formatting_codes("trailing §"), "trailing ");
        assert_eq!(strip_formatting_codes("plain"), "plain");
    }
}
