use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;

const DEFAULT_CACHE_SIZE: usize = 1000;
const PROFILE_TTL_HOURS: i64 = 24;
/// A fetch that never came back may be retried after this long.
const FETCH_RETRY_SECS: i64 = 300;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedProfile {
    profile: Profile,
    expires_at: DateTime<Utc>,
}

/// Kind-0 profiles seen on the stream, plus bookkeeping for the on-demand
/// profile and relay-list fetches the coordinator issues.
#[derive(Debug)]
pub struct ProfileCache {
    cache: LruCache<String, CachedProfile>,
    profile_requests: LruCache<String, DateTime<Utc>>,
    relay_list_requests: LruCache<String, DateTime<Utc>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            profile_requests: LruCache::new(cap),
            relay_list_requests: LruCache::new(cap),
        }
    }

    /// Store a profile from raw kind-0 content. Unparseable content is
    /// ignored and reported as `false`.
    pub fn store_profile_raw(&mut self, pubkey_hex: &str, content: &str) -> bool {
        let profile: Profile = match serde_json::from_str(content) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("Failed to parse profile for {}: {}", short(pubkey_hex), e);
                return false;
            }
        };
        self.cache.put(
            pubkey_hex.to_string(),
            CachedProfile {
                profile,
                expires_at: Utc::now() + Duration::hours(PROFILE_TTL_HOURS),
            },
        );
        self.profile_requests.pop(pubkey_hex);
        true
    }

    pub fn has_profile(&self, pubkey_hex: &str) -> bool {
        self.cache
            .peek(pubkey_hex)
            .is_some_and(|cached| Utc::now() < cached.expires_at)
    }

    /// Display name with fallback to a shortened pubkey.
    pub fn display_name(&self, pubkey_hex: &str) -> String {
        if let Some(cached) = self.cache.peek(pubkey_hex) {
            let profile = &cached.profile;
            for candidate in [&profile.display_name, &profile.name].into_iter().flatten() {
                if !candidate.trim().is_empty() {
                    return candidate.trim().to_string();
                }
            }
        }
        format!("{}...", short(pubkey_hex))
    }

    /// Returns true when a profile fetch for `pubkey_hex` should be issued
    /// now, and records it as pending.
    pub fn request_profile(&mut self, pubkey_hex: &str) -> bool {
        if self.has_profile(pubkey_hex) {
            return false;
        }
        claim(&mut self.profile_requests, pubkey_hex, FETCH_RETRY_SECS)
    }

    /// Returns true when the relay list of `pubkey_hex` has not been asked
    /// for within the profile TTL.
    pub fn request_relay_list(&mut self, pubkey_hex: &str) -> bool {
        claim(
            &mut self.relay_list_requests,
            pubkey_hex,
            PROFILE_TTL_HOURS * 3600,
        )
    }

    pub fn profile_count(&self) -> usize {
        self.cache.len()
    }
}

impl Default for ProfileCache {
    fn default() -> Self {
        Self::new()
    }
}

fn claim(requests: &mut LruCache<String, DateTime<Utc>>, key: &str, retry_secs: i64) -> bool {
    let now = Utc::now();
    if let Some(requested_at) = requests.get(key) {
        if now - *requested_at < Duration::seconds(retry_secs) {
            return false;
        }
    }
    requests.put(key.to_string(), now);
    true
}

fn short(pubkey_hex: &str) -> &str {
    pubkey_hex.get(..8).unwrap_or(pubkey_hex)
}
