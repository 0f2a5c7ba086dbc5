use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use http::HeaderMap;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameId {
    pub name: String,
    pub tag: String,
}

fn tag_pattern() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"^[\p{L}\p{N}]{2,5}$").expect("static tag pattern"))
}

// Roster tokens look like `name-tag` or `name#tag`; whichever separator comes first wins.
pub fn parse_riot_id(input: &str) -> Result<GameId> {
    let text = input.trim();
    if text.is_empty() {
        return Err(anyhow!("Riot ID cannot be empty."));
    }
    let Some(split_at) = text.find(|c: char| c == '-' || c == '#') else {
        return Err(anyhow!(
            "Invalid Riot ID format: Expected 'name#tag' or 'name-tag'."
        ));
    };
    let name = text[..split_at].trim();
    let tag = text[split_at + 1..].trim();
    if name.is_empty() || tag.is_empty() {
        return Err(anyhow!("Invalid Riot ID format: Name or tag part is empty."));
    }
    if !tag_pattern().is_match(tag) {
        return Err(anyhow!(
            "Invalid Riot ID format: Tag '{}' must be 2-5 letters or digits.",
            tag
        ));
    }
    Ok(GameId {
        name: name.to_string(),
        tag: tag.to_string(),
    })
}

/// Seconds from a `Retry-After` header, if the upstream sent a usable one.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// `base * 2^retry`, saturating instead of overflowing on silly retry counts.
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_parse_hash_separator() {
        let result = parse_riot_id("bob#na1").unwrap();
        assert_eq!(result.name, "bob");
        assert_eq!(result.tag, "na1");
    }

    #[test]
    fn test_parse_dash_separator() {
        let result = parse_riot_id("alice-na1").unwrap();
        assert_eq!(result.name, "alice");
        assert_eq!(result.tag, "na1");
    }

    #[test]
    fn test_parse_with_spaces() {
        let result = parse_riot_id("  Player Name With Spaces  # EUW  ").unwrap();
        assert_eq!(result.name, "Player Name With Spaces");
        assert_eq!(result.tag, "EUW");
    }

    #[test]
    fn test_parse_first_separator_wins() {
        let result = parse_riot_id("Player#Na-1");
        assert!(result.is_err());
        let result = parse_riot_id("Player-EUW#x").unwrap_err();
        assert_eq!(
            result.to_string(),
            "Invalid Riot ID format: Tag 'EUW#x' must be 2-5 letters or digits."
        );
    }

    #[test]
    fn test_parse_rejects_multi_dash_row() {
        let result = parse_riot_id("bad-row-no-tag");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_missing_separator() {
        let result = parse_riot_id("PlayerNameNA1");
        assert_eq!(
            result.unwrap_err().to_string(),
            "Invalid Riot ID format: Expected 'name#tag' or 'name-tag'."
        );
    }

    #[test]
    fn test_parse_missing_name() {
        let result = parse_riot_id("#NA1");
        assert_eq!(
            result.unwrap_err().to_string(),
            "Invalid Riot ID format: Name or tag part is empty."
        );
    }

    #[test]
    fn test_parse_missing_tag() {
        let result = parse_riot_id("PlayerName-");
        assert_eq!(
            result.unwrap_err().to_string(),
            "Invalid Riot ID format: Name or tag part is empty."
        );
    }

    #[test]
    fn test_parse_empty_string() {
        let result = parse_riot_id("   ");
        assert_eq!(result.unwrap_err().to_string(), "Riot ID cannot be empty.");
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert("retry-after", HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(4000));
    }
}
