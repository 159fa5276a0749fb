use std::collections::BTreeSet;

use eyre::{bail, eyre};

use super::{PingResponse, strip_formatting_codes};

/// Parse the string from a legacy kick packet.
///
/// 1.4+ servers reply with `§1\0protocol\0version\0motd\0online\0max`, older
/// ones with `motd§online§max`.
pub fn parse_legacy_response(s: &str) -> eyre::Result<PingResponse> {
    let (version_name, version_protocol, motd, online, max) =
        if let Some(rest) = s.strip_prefix("§1\0") {
            let parts = rest.split('\0').collect::<Vec<_>>();
            let [protocol, version, motd, online, max] = parts[..] else {
                bail!("Expected 6 fields in legacy response, got {}", parts.len() + 1);
            };
            (
                Some(version.to_string()),
                protocol.parse::<i32>().ok(),
                motd,
                online,
                max,
            )
        } else {
            let mut parts = s.rsplitn(3, '§');
            let max = parts.next().ok_or_else(|| eyre!("Missing max players"))?;
            let online = parts.next().ok_or_else(|| eyre!("Missing online players"))?;
            let motd = parts.next().ok_or_else(|| eyre!("Missing MOTD"))?;
            (None, None, motd, online, max)
        };

    let online_players = online
        .trim()
        .parse::<i32>()
        .map_err(|_| eyre!("Invalid online player count {online:?}"))?;
    let max_players = max
        .trim()
        .parse::<i32>()
        .map_err(|_| eyre!("Invalid max player count {max:?}"))?;

    Ok(PingResponse {
        description_raw: motd.to_string(),
        description_plaintext: strip_formatting_codes(motd),
        version_name,
        version_protocol,
        favicon_hash: None,
        online_players: Some(online_players),
        max_players: Some(max_players),
        is_online_mode: None,
        player_sample: Vec::new(),
        is_fake_sample: false,
        enforces_secure_chat: None,
        prevents_chat_reports: None,
        mods: BTreeSet::new(),
        is_legacy: true,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_1_4_response() {
        let r = parse_legacy_response("§1\x0051\x001.4.7\x00§bA §lLegacy Server\x003\x0020").unwrap();
        assert_eq!(r.version_name.as_deref(), Some("1.4.7"));
        assert_eq!(r.version_protocol, Some(51));
        assert_eq!(r.description_raw, "§bA §lLegacy Server");
        assert_eq!(r.description_plaintext, "A Legacy Server");
        assert_eq!(r.online_players, Some(3));
        assert_eq!(r.max_players, Some(20));
        assert!(r.is_legacy);
    }

    #[test]
    fn test_parse_beta_response() {
        let r = parse_legacy_response("Beta server §with§ section signs§0§16").unwrap();
        assert_eq!(r.description_raw, "Beta server §with§ section signs");
        assert_eq!(r.online_players, Some(0));
        assert_eq!(r.max_players, Some(16));
        assert_eq!(r.version_name, None);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_legacy_response("nothing useful").is_err());
        assert!(parse_legacy_response("§1\x0051\x001.4.7").is_err());
        assert!(parse_legacy_response("motd§lots§many").is_err());
    }
}
