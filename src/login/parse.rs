//! QR payload validation and challenge extraction.
//!
//! Two independent payload forms are recognized, URL form first:
//!
//! - URL form: a login URL of at least 50 characters naming a known service
//!   host, carrying `ticket=<alphanumeric>` and usually a game path segment.
//! - fixed-offset form: an opaque payload of at least 85 characters with a
//!   3-character game magic tag at byte offset 79 and the ticket as the last
//!   24 characters.
//!
//! Anything else is noise, not an error: QR codes in the wild (stream
//! overlays, chat stickers) routinely decode to unrelated text.

use crate::types::{GameType, LoginChallenge, TICKET_LEN};

/// Hostname fragments that mark a payload URL as a login URL.
const SERVICE_HOSTS: [&str; 4] = ["mihoyo.com", "miyoushe.com", "api-sdk", "hk4e-sdk"];

/// Minimum length of a URL-form payload.
const MIN_URL_LEN: usize = 50;
/// Minimum length of a fixed-offset payload.
const MIN_FIXED_LEN: usize = 85;
/// Byte offset of the 3-character game magic tag.
const TAG_OFFSET: usize = 79;

/// Game path segments that may appear in a URL-form payload.
const URL_GAME_SEGMENTS: [(&str, GameType); 4] = [
    ("bh3_cn", GameType::Bh3),
    ("hk4e_cn", GameType::Hk4e),
    ("hkrpg_cn", GameType::Hkrpg),
    ("nap_cn", GameType::Zzz),
];

/// Extract a login challenge from decoded QR text, trying the URL form
/// first, then the fixed-offset form. Returns `None` for noise.
pub fn extract_challenge(text: &str) -> Option<LoginChallenge> {
    parse_url_form(text).or_else(|| parse_fixed_offset(text))
}

fn parse_url_form(text: &str) -> Option<LoginChallenge> {
    if text.len() < MIN_URL_LEN {
        return None;
    }
    if !SERVICE_HOSTS.iter().any(|host| text.contains(host)) {
        return None;
    }
    let ticket = ticket_param(text)?;
    // hk4e is by far the most common issuer; URLs without a recognizable
    // game segment default to it
    let game_type = URL_GAME_SEGMENTS
        .iter()
        .find(|(segment, _)| text.contains(segment))
        .map(|&(_, game)| game)
        .unwrap_or(GameType::Hk4e);
    LoginChallenge::new(game_type, ticket)
}

/// Value of the `ticket=` query parameter: the maximal alphanumeric run
/// following the key.
fn ticket_param(text: &str) -> Option<&str> {
    let start = text.find("ticket=")? + "ticket=".len();
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

fn parse_fixed_offset(text: &str) -> Option<LoginChallenge> {
    if text.len() < MIN_FIXED_LEN {
        return None;
    }
    // .get keeps multi-byte payloads from panicking on char boundaries
    let tag = text.get(TAG_OFFSET..TAG_OFFSET + 3)?;
    let game_type = GameType::from_magic_tag(tag)?;
    let ticket = text.get(text.len() - TICKET_LEN..)?;
    LoginChallenge::new(game_type, ticket)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_payload(tag: &str, ticket: &str) -> String {
        format!("{}{}{}", "q".repeat(TAG_OFFSET), tag, ticket)
    }

    #[test]
    fn fixed_offset_happy_path() {
        let ticket = "A1b2C3d4E5f6G7h8I9j0K1l2";
        assert_eq!(ticket.len(), TICKET_LEN);
        let challenge = extract_challenge(&fixed_payload("9E&", ticket)).unwrap();
        assert_eq!(challenge.game_type, GameType::Hk4e);
        assert_eq!(challenge.ticket, ticket);
    }

    #[test]
    fn fixed_offset_rejects_below_minimum_length() {
        // 84 characters: one short of the minimum
        let payload: String = "q".repeat(84);
        assert!(extract_challenge(&payload).is_none());
        // exactly 85 but unknown tag
        let payload = format!("{}ZZZ{}", "q".repeat(TAG_OFFSET), "t".repeat(3));
        assert_eq!(payload.len(), 85);
        assert!(extract_challenge(&payload).is_none());
    }

    #[test]
    fn fixed_offset_all_tags() {
        let ticket = "t".repeat(TICKET_LEN);
        for (tag, game) in [
            ("8F3", GameType::Bh3),
            ("9E&", GameType::Hk4e),
            ("8F%", GameType::Hkrpg),
            ("%BA", GameType::Zzz),
        ] {
            let challenge = extract_challenge(&fixed_payload(tag, &ticket)).unwrap();
            assert_eq!(challenge.game_type, game, "tag {tag}");
        }
    }

    #[test]
    fn url_form_happy_path() {
        let ticket = "Z9y8X7w6V5u4T3s2R1q0P9o8";
        let url = format!(
            "https://user.mihoyo.com/qr_code_in_game.html?app_id=8&app_name=x&bbs=true&biz_key=hkrpg_cn&expire=1700000000&ticket={ticket}"
        );
        let challenge = extract_challenge(&url).unwrap();
        assert_eq!(challenge.game_type, GameType::Hkrpg);
        assert_eq!(challenge.ticket, ticket);
    }

    #[test]
    fn url_form_defaults_to_hk4e_without_game_segment() {
        let ticket = "a".repeat(TICKET_LEN);
        let url = format!("https://api.miyoushe.com/common/qrlogin?foo=bar&ticket={ticket}");
        let challenge = extract_challenge(&url).unwrap();
        assert_eq!(challenge.game_type, GameType::Hk4e);
    }

    #[test]
    fn url_form_requires_known_host() {
        let ticket = "a".repeat(TICKET_LEN);
        let url = format!("https://evil.example.com/qrlogin?biz_key=hk4e_cn&ticket={ticket}");
        assert!(extract_challenge(&url).is_none());
    }

    #[test]
    fn url_form_ticket_stops_at_delimiter() {
        let ticket = "b".repeat(TICKET_LEN);
        let url =
            format!("https://sdk.mihoyo.com/hk4e_cn/qrlogin?x=padpadpad&ticket={ticket}&other=1");
        assert_eq!(extract_challenge(&url).unwrap().ticket, ticket);
    }

    #[test]
    fn wrong_ticket_length_is_noise() {
        let url = format!(
            "https://user.mihoyo.com/qr_code_in_game.html?biz_key=hk4e_cn&pad=pad&ticket={}",
            "a".repeat(TICKET_LEN - 1)
        );
        assert!(extract_challenge(&url).is_none());
    }

    #[test]
    fn plain_text_is_noise() {
        assert!(extract_challenge("").is_none());
        assert!(extract_challenge("hello world").is_none());
        assert!(extract_challenge("https://example.com/just-a-random-link-no-login-here").is_none());
    }

    #[test]
    fn multibyte_payload_does_not_panic() {
        // long enough, but the tag offset lands inside multi-byte chars
        let payload = "é".repeat(60);
        assert!(payload.len() >= MIN_FIXED_LEN);
        assert!(extract_challenge(&payload).is_none());
    }
}
