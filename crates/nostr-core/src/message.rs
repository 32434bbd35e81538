//! Immutable message record shared by every stage of the ingestion pipeline.

use nostr_sdk::{Event, Url};
use serde::{Deserialize, Serialize};

/// Profile metadata (NIP-01).
pub const KIND_METADATA: u16 = 0;
/// Short text note (NIP-01).
pub const KIND_TEXT_NOTE: u16 = 1;
/// Legacy contact list whose content may carry a relay map (NIP-02).
pub const KIND_CONTACT_LIST: u16 = 3;
/// Relay list metadata announcement (NIP-65).
pub const KIND_RELAY_LIST: u16 = 10002;

/// A parsed, already verified event as delivered by a relay.
///
/// `id` is the deduplication key everywhere. `created_at` is asserted by the
/// signer and is never used to order arrivals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub author: String,
    pub created_at: u64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

/// Read/write marker of an `r` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMarker {
    Read,
    Write,
    Both,
}

/// A relay reference from an `r` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTag {
    pub url: String,
    pub marker: RelayMarker,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        author: impl Into<String>,
        created_at: u64,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            created_at,
            kind,
            tags,
            content: content.into(),
        }
    }

    /// Values of tags named `name` (second element), in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags.iter().filter_map(move |tag| {
            if tag.first().map(|v| v.as_str()) == Some(name) {
                tag.get(1).map(|v| v.as_str())
            } else {
                None
            }
        })
    }

    /// Lowercased topics from `t` tags, each listed once.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for value in self.tag_values("t") {
            let topic = value.trim().to_lowercase();
            if topic.is_empty() || topics.contains(&topic) {
                continue;
            }
            topics.push(topic);
        }
        topics
    }

    /// Relay references from `r` tags. The URL is returned as written.
    pub fn relay_tags(&self) -> Vec<RelayTag> {
        self.tags
            .iter()
            .filter(|tag| tag.first().map(|v| v.as_str()) == Some("r"))
            .filter_map(|tag| {
                let url = tag.get(1)?;
                let marker = match tag.get(2).map(|v| v.as_str()) {
                    Some("read") => RelayMarker::Read,
                    Some("write") => RelayMarker::Write,
                    _ => RelayMarker::Both,
                };
                Some(RelayTag {
                    url: url.clone(),
                    marker,
                })
            })
            .collect()
    }

    /// Pubkeys referenced by `p` tags.
    pub fn pubkey_tags(&self) -> Vec<String> {
        self.tag_values("p").map(|v| v.to_string()).collect()
    }
}

impl From<&Event> for Message {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.to_hex(),
            author: event.pubkey.to_hex(),
            created_at: event.created_at.as_u64(),
            kind: event.kind.as_u16(),
            tags: event
                .tags
                .iter()
                .map(|tag| tag.as_slice().to_vec())
                .collect(),
            content: event.content.clone(),
        }
    }
}

/// Validate a websocket relay URL and return its canonical form.
///
/// Surrounding whitespace and trailing slashes are removed. Returns `None`
/// unless the URL parses with a `ws`/`wss` scheme and a host.
pub fn normalize_relay_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !(trimmed.starts_with("wss://") || trimmed.starts_with("ws://")) {
        return None;
    }
    let parsed = Url::parse(trimmed).ok()?;
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Some(trimmed.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn topics_are_lowercased_and_unique() {
        let msg = Message::new(
            "id1",
            "author",
            1000,
            KIND_TEXT_NOTE,
            vec![
                tag(&["t", "Bitcoin"]),
                tag(&["t", "bitcoin"]),
                tag(&["t", "nostr"]),
                tag(&["t"]),
                tag(&["p", "abc"]),
            ],
            "",
        );
        assert_eq!(msg.topics(), vec!["bitcoin", "nostr"]);
    }

    #[test]
    fn relay_tags_parse_markers() {
        let msg = Message::new(
            "id1",
            "author",
            1000,
            KIND_RELAY_LIST,
            vec![
                tag(&["r", "wss://a.example"]),
                tag(&["r", "wss://b.example", "read"]),
                tag(&["r", "wss://c.example", "write"]),
                tag(&["r"]),
            ],
            "",
        );
        let tags = msg.relay_tags();
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[0].marker, RelayMarker::Both);
        assert_eq!(tags[1].marker, RelayMarker::Read);
        assert_eq!(tags[2].marker, RelayMarker::Write);
    }

    #[test]
    fn normalize_strips_trailing_slash() {
        assert_eq!(
            normalize_relay_url(" wss://relay.example/ "),
            Some("wss://relay.example".to_string())
        );
        assert_eq!(
            normalize_relay_url("ws://relay.example:7777"),
            Some("ws://relay.example:7777".to_string())
        );
    }

    #[test]
    fn normalize_rejects_non_websocket() {
        assert_eq!(normalize_relay_url("https://relay.example"), None);
        assert_eq!(normalize_relay_url("wss://"), None);
        assert_eq!(normalize_relay_url("not a url"), None);
    }

    #[test]
    fn message_from_signed_event() {
        use nostr_sdk::{EventBuilder, Keys, Kind, Tag, TagKind};

        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::TextNote, "hello #nostr")
            .tag(Tag::custom(TagKind::custom("t"), vec!["Nostr".to_string()]))
            .sign_with_keys(&keys)
            .unwrap();

        let msg = Message::from(&event);
        assert_eq!(msg.id, event.id.to_hex());
        assert_eq!(msg.author, keys.public_key().to_hex());
        assert_eq!(msg.kind, KIND_TEXT_NOTE);
        assert_eq!(msg.topics(), vec!["nostr"]);
    }
}
