//! Relay hint extraction from NIP-19 entities embedded in event content.
//!
//! `nprofile`, `nevent` and `naddr` entities carry TLV-encoded relay URLs.
//! Rather than interpreting every TLV record, the decoded payload is scanned
//! for literal websocket URLs, which is what the relay records contain.

use crate::message::normalize_relay_url;
use bech32::FromBase32;
use regex::Regex;
use std::sync::LazyLock;
use tracing::trace;

/// Compiled once.
static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:nostr:)?((?:nprofile|nevent|naddr)1[qpzry9x8gf2tvdw0s3jn54khce6mua7l]+)")
        .unwrap()
});
static WS_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"wss?://[^\x00-\x20"'<>\\\x7f\x{FFFD}]+"#).unwrap());

/// Find entity tokens (without the `nostr:` prefix) in free text.
pub fn find_entities(content: &str) -> Vec<&str> {
    ENTITY_RE
        .captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

/// Decode one entity and return the websocket URLs found in its payload.
///
/// Returns an empty list when the token does not decode.
pub fn decode_entity_relays(token: &str) -> Vec<String> {
    let (_hrp, data, _variant) = match bech32::decode(token) {
        Ok(decoded) => decoded,
        Err(e) => {
            trace!("Skipping undecodable entity {}: {}", token, e);
            return Vec::new();
        }
    };
    let bytes = match Vec::<u8>::from_base32(&data) {
        Ok(b) => b,
        Err(e) => {
            trace!("Skipping entity with bad payload {}: {}", token, e);
            return Vec::new();
        }
    };

    let text = String::from_utf8_lossy(&bytes);
    WS_URL_RE
        .find_iter(&text)
        .filter_map(|m| normalize_relay_url(m.as_str()))
        .collect()
}

/// All relay URLs hinted by entities in `content`, deduplicated, in order.
pub fn extract_hint_relays(content: &str) -> Vec<String> {
    let mut relays: Vec<String> = Vec::new();
    for token in find_entities(content) {
        for url in decode_entity_relays(token) {
            if !relays.contains(&url) {
                relays.push(url);
            }
        }
    }
    relays
}
