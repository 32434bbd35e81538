//! Relay discovery: mines endorsements out of the event stream and ranks
//! candidate relays.
//!
//! Three signal sources feed one table keyed by normalized relay URL:
//! NIP-65 relay lists, relay hints inside NIP-19 entities, and the relay map
//! some clients still put in kind-3 contact lists. An entry counts distinct
//! read and write endorsers, decays once it has not been endorsed for
//! `max_age_hours`, and is only surfaced after `min_endorsements`.

use chrono::Utc;
use nostr_core::nostr_sdk::Url;
use nostr_core::{
    extract_hint_relays, normalize_relay_url, Message, RelayMarker, KIND_CONTACT_LIST,
    KIND_RELAY_LIST,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, trace, warn};

const PREFERRED_BONUS: usize = 10;
const RELAY_LIST_BONUS: usize = 5;
const HINT_BONUS: usize = 2;

const MS_PER_HOUR: i64 = 3_600_000;

/// Errors raised by the discovery engine.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DiscoveryError {
    /// A configuration value is out of range.
    #[error("Invalid discovery config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Where an endorsement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndorsementSource {
    RelayList,
    Hint,
    ContactList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Maximum number of recommendations returned.
    #[serde(default = "default_max_relays")]
    pub max_relays: usize,
    /// Distinct endorsing authors needed before a relay is surfaced.
    #[serde(default = "default_min_endorsements")]
    pub min_endorsements: usize,
    #[serde(default = "default_true")]
    pub use_relay_lists: bool,
    #[serde(default = "default_true")]
    pub use_hints: bool,
    #[serde(default = "default_true")]
    pub use_contact_lists: bool,
    /// Entries not endorsed for this long are dropped.
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    /// Hosts never admitted into the table.
    #[serde(default = "default_blacklisted_domains")]
    pub blacklisted_domains: Vec<String>,
    /// Hosts that get a score bonus.
    #[serde(default)]
    pub preferred_domains: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_relays: default_max_relays(),
            min_endorsements: default_min_endorsements(),
            use_relay_lists: true,
            use_hints: true,
            use_contact_lists: true,
            max_age_hours: default_max_age_hours(),
            blacklisted_domains: default_blacklisted_domains(),
            preferred_domains: Vec::new(),
        }
    }
}

fn default_max_relays() -> usize {
    20
}

fn default_min_endorsements() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_max_age_hours() -> u64 {
    168
}

fn default_blacklisted_domains() -> Vec<String> {
    ["localhost", "127.0.0.1", "10.0.", "192.168.", "172.16."]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_relays == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "max_relays must be at least 1".to_string(),
            ));
        }
        if self.min_endorsements == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "min_endorsements must be at least 1".to_string(),
            ));
        }
        if self.max_age_hours == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "max_age_hours must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn max_age_ms(&self) -> i64 {
        (self.max_age_hours as i64).saturating_mul(MS_PER_HOUR)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RelayEndorsements {
    read: HashSet<String>,
    write: HashSet<String>,
    last_seen_ms: i64,
    sources: BTreeSet<EndorsementSource>,
}

impl RelayEndorsements {
    /// Distinct endorsing authors. An author listing the relay for both
    /// read and write counts once.
    fn total(&self) -> usize {
        self.read.len() + self.write.difference(&self.read).count()
    }
}

/// A ranked relay candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayRecommendation {
    pub url: String,
    pub read_count: usize,
    pub write_count: usize,
    pub total_recs: usize,
    pub score: usize,
    pub sources: Vec<EndorsementSource>,
    pub last_seen_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryStats {
    pub tracked_relays: usize,
    pub qualified_relays: usize,
    pub followed_authors: usize,
}

/// Endorsement table plus the active policy.
#[derive(Debug)]
pub struct RelayDiscovery {
    config: DiscoveryConfig,
    relays: HashMap<String, RelayEndorsements>,
    followed: HashSet<String>,
}

impl RelayDiscovery {
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            relays: HashMap::new(),
            followed: HashSet::new(),
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Record endorsements from a NIP-65 relay list.
    ///
    /// Returns relays that crossed the promotion threshold in this call.
    pub fn process_relay_list(&mut self, msg: &Message) -> Vec<String> {
        if !self.config.use_relay_lists || msg.kind != KIND_RELAY_LIST {
            return Vec::new();
        }

        let seen_ms = created_at_ms(msg);
        let mut promoted = Vec::new();
        for tag in msg.relay_tags() {
            let (read, write) = match tag.marker {
                RelayMarker::Read => (true, false),
                RelayMarker::Write => (false, true),
                RelayMarker::Both => (true, true),
            };
            self.endorse(
                &tag.url,
                &msg.author,
                read,
                write,
                seen_ms,
                EndorsementSource::RelayList,
                &mut promoted,
            );
        }
        promoted
    }

    /// Record read endorsements from relay hints embedded in the content.
    pub fn process_hints(&mut self, msg: &Message) -> Vec<String> {
        if !self.config.use_hints {
            return Vec::new();
        }

        let seen_ms = created_at_ms(msg);
        let mut promoted = Vec::new();
        for url in extract_hint_relays(&msg.content) {
            self.endorse(
                &url,
                &msg.author,
                true,
                false,
                seen_ms,
                EndorsementSource::Hint,
                &mut promoted,
            );
        }
        promoted
    }

    /// Record read endorsements from a legacy kind-3 relay map and remember
    /// the followed pubkeys. Content that is not a JSON object is ignored.
    pub fn process_contact_list(&mut self, msg: &Message) -> Vec<String> {
        if !self.config.use_contact_lists || msg.kind != KIND_CONTACT_LIST {
            return Vec::new();
        }

        for pubkey in msg.pubkey_tags() {
            self.followed.insert(pubkey);
        }

        let entries = match serde_json::from_str::<Value>(&msg.content) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Vec::new(),
            Err(e) => {
                trace!("Ignoring contact list {} content: {}", msg.id, e);
                return Vec::new();
            }
        };

        let seen_ms = created_at_ms(msg);
        let mut promoted = Vec::new();
        for (key, value) in &entries {
            let Some(url) = contact_entry_url(key, value) else {
                continue;
            };
            self.endorse(
                &url,
                &msg.author,
                true,
                false,
                seen_ms,
                EndorsementSource::ContactList,
                &mut promoted,
            );
        }
        promoted
    }

    #[allow(clippy::too_many_arguments)]
    fn endorse(
        &mut self,
        raw_url: &str,
        author: &str,
        read: bool,
        write: bool,
        seen_ms: i64,
        source: EndorsementSource,
        promoted: &mut Vec<String>,
    ) {
        let Some(url) = normalize_relay_url(raw_url) else {
            trace!("Skipping invalid relay URL {:?}", raw_url);
            return;
        };
        if self.is_blacklisted(&url) {
            trace!("Skipping blacklisted relay {}", url);
            return;
        }

        let threshold = self.config.min_endorsements;
        let entry = self.relays.entry(url.clone()).or_default();
        let before = entry.total();
        if read {
            entry.read.insert(author.to_string());
        }
        if write {
            entry.write.insert(author.to_string());
        }
        entry.last_seen_ms = entry.last_seen_ms.max(seen_ms);
        entry.sources.insert(source);

        if before < threshold && entry.total() >= threshold && !promoted.contains(&url) {
            debug!("Relay {} reached {} endorsements", url, entry.total());
            promoted.push(url);
        }
    }

    /// Ranked recommendations at the current wall clock.
    pub fn recommended(&mut self) -> Vec<RelayRecommendation> {
        self.recommended_at(Utc::now().timestamp_millis())
    }

    /// Ranked recommendations as of `now_ms`. Stale entries are evicted
    /// first; ties are broken by URL.
    pub fn recommended_at(&mut self, now_ms: i64) -> Vec<RelayRecommendation> {
        self.sweep(now_ms);

        let mut ranked: Vec<RelayRecommendation> = self
            .relays
            .iter()
            .filter(|(_, entry)| entry.total() >= self.config.min_endorsements)
            .map(|(url, entry)| {
                let mut score = entry.total();
                if self.is_preferred(url) {
                    score += PREFERRED_BONUS;
                }
                if entry.sources.contains(&EndorsementSource::RelayList) {
                    score += RELAY_LIST_BONUS;
                }
                if entry.sources.contains(&EndorsementSource::Hint) {
                    score += HINT_BONUS;
                }
                RelayRecommendation {
                    url: url.clone(),
                    read_count: entry.read.len(),
                    write_count: entry.write.len(),
                    total_recs: entry.total(),
                    score,
                    sources: entry.sources.iter().copied().collect(),
                    last_seen_ms: entry.last_seen_ms,
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.url.cmp(&b.url)));
        ranked.truncate(self.config.max_relays);
        ranked
    }

    /// Drop entries whose last endorsement is older than `max_age_hours`.
    pub fn sweep(&mut self, now_ms: i64) -> usize {
        let max_age = self.config.max_age_ms();
        let before = self.relays.len();
        self.relays
            .retain(|_, entry| now_ms.saturating_sub(entry.last_seen_ms) <= max_age);
        before - self.relays.len()
    }

    /// Host matches a blacklisted entry exactly, as a dot-suffix, or by
    /// literal prefix. URLs that do not parse are treated as blacklisted.
    pub fn is_blacklisted(&self, url: &str) -> bool {
        let Some(host) = host_of(url) else {
            return true;
        };
        self.config.blacklisted_domains.iter().any(|entry| {
            let entry = entry.trim().to_lowercase();
            if entry.is_empty() {
                return false;
            }
            let bare = entry.trim_start_matches('.');
            host == bare || host.ends_with(&format!(".{bare}")) || host.starts_with(&entry)
        })
    }

    fn is_preferred(&self, url: &str) -> bool {
        let Some(host) = host_of(url) else {
            return false;
        };
        self.config.preferred_domains.iter().any(|entry| {
            let bare = entry.trim().trim_start_matches('.').to_lowercase();
            !bare.is_empty() && (host == bare || host.ends_with(&format!(".{bare}")))
        })
    }

    pub fn is_tracked(&self, url: &str) -> bool {
        normalize_relay_url(url).is_some_and(|u| self.relays.contains_key(&u))
    }

    pub fn stats(&self) -> DiscoveryStats {
        DiscoveryStats {
            tracked_relays: self.relays.len(),
            qualified_relays: self
                .relays
                .values()
                .filter(|e| e.total() >= self.config.min_endorsements)
                .count(),
            followed_authors: self.followed.len(),
        }
    }

    /// Serialize the table, the followed set and the config.
    pub fn export_state(&self) -> Value {
        let mut relays = serde_json::Map::new();
        let mut urls: Vec<&String> = self.relays.keys().collect();
        urls.sort();
        for url in urls {
            let entry = &self.relays[url];
            let mut read: Vec<&String> = entry.read.iter().collect();
            read.sort();
            let mut write: Vec<&String> = entry.write.iter().collect();
            write.sort();
            relays.insert(
                url.clone(),
                json!({
                    "read": read,
                    "write": write,
                    "last_seen": entry.last_seen_ms,
                    "sources": entry.sources,
                }),
            );
        }

        let mut followed: Vec<&String> = self.followed.iter().collect();
        followed.sort();

        json!({
            "relays": relays,
            "followed": followed,
            "config": self.config,
        })
    }

    /// Merge previously exported state. Malformed parts are skipped.
    ///
    /// Returns the number of relay entries imported.
    pub fn import_state(&mut self, state: &Value) -> usize {
        if let Some(raw) = state.get("config") {
            match serde_json::from_value::<DiscoveryConfig>(raw.clone()) {
                Ok(config) => match config.validate() {
                    Ok(()) => self.config = config,
                    Err(e) => warn!("Keeping current discovery config: {}", e),
                },
                Err(e) => warn!("Ignoring malformed discovery config: {}", e),
            }
        }

        if let Some(followed) = state.get("followed").and_then(|v| v.as_array()) {
            for pubkey in followed.iter().filter_map(|v| v.as_str()) {
                self.followed.insert(pubkey.to_string());
            }
        }

        let mut imported = 0;
        if let Some(relays) = state.get("relays").and_then(|v| v.as_object()) {
            for (raw_url, raw_entry) in relays {
                let Some(url) = normalize_relay_url(raw_url) else {
                    debug!("Skipping imported relay with bad URL {:?}", raw_url);
                    continue;
                };
                if self.is_blacklisted(&url) {
                    continue;
                }
                let Some(obj) = raw_entry.as_object() else {
                    debug!("Skipping malformed imported entry for {}", url);
                    continue;
                };

                let entry = self.relays.entry(url).or_default();
                entry.read.extend(string_list(obj.get("read")));
                entry.write.extend(string_list(obj.get("write")));
                if let Some(ts) = obj.get("last_seen").and_then(|v| v.as_i64()) {
                    entry.last_seen_ms = entry.last_seen_ms.max(ts);
                }
                if let Some(sources) = obj.get("sources").and_then(|v| v.as_array()) {
                    for source in sources {
                        if let Ok(s) = serde_json::from_value::<EndorsementSource>(source.clone()) {
                            entry.sources.insert(s);
                        }
                    }
                }
                imported += 1;
            }
        }
        imported
    }
}

fn created_at_ms(msg: &Message) -> i64 {
    (msg.created_at as i64).saturating_mul(1000)
}

fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    parsed.host_str().map(|h| h.to_lowercase())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Relay URL carried by one contact-list entry, if any: the key itself, a
/// string value, or a `url`/`relay` field of an object value.
fn contact_entry_url(key: &str, value: &Value) -> Option<String> {
    if let Some(url) = normalize_relay_url(key) {
        return Some(url);
    }
    match value {
        Value::String(s) => normalize_relay_url(s),
        Value::Object(obj) => ["url", "relay"]
            .iter()
            .filter_map(|field| obj.get(*field).and_then(|v| v.as_str()))
            .find_map(normalize_relay_url),
        _ => None,
    }
}
