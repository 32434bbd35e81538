//! Topic index: recent messages per hashtag and per-relay delivery counts.
//!
//! Recency is arrival order, not `created_at`, since signed timestamps are
//! chosen by the author. Each topic keeps at most `cap` messages; topics are
//! never expired.

use nostr_core::Message;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

pub const DEFAULT_TOPIC_CAP: usize = 100;

const RELATED_TOPICS_LIMIT: usize = 10;
const TOP_AUTHORS_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct IndexedMessage {
    pub message: Message,
    pub arrived_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayShare {
    pub relay: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicSummary {
    pub topic: String,
    pub count: u64,
    pub last_seen_ms: i64,
    pub trending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicCount {
    pub topic: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorCount {
    pub author: String,
    pub count: u64,
}

/// Snapshot for a single topic, computed from the stored window.
#[derive(Debug, Clone, Serialize)]
pub struct TopicInsight {
    pub topic: String,
    pub total_messages: u64,
    pub unique_authors: usize,
    pub related_topics: Vec<TopicCount>,
    pub top_authors: Vec<AuthorCount>,
    pub relay_distribution: Vec<RelayShare>,
}

#[derive(Debug, Default)]
struct TopicEntry {
    /// Front is the most recent arrival.
    messages: VecDeque<IndexedMessage>,
    ids: HashSet<String>,
    relay_counts: HashMap<String, u64>,
    total_messages: u64,
    last_seen_ms: i64,
}

#[derive(Debug)]
pub struct TopicIndex {
    topics: HashMap<String, TopicEntry>,
    cap: usize,
    trending_window_ms: i64,
    trending_min_messages: usize,
}

impl TopicIndex {
    pub fn new(cap: usize, trending_window_secs: u64, trending_min_messages: usize) -> Self {
        Self {
            topics: HashMap::new(),
            cap: cap.max(1),
            trending_window_ms: (trending_window_secs as i64).saturating_mul(1000),
            trending_min_messages,
        }
    }

    /// Insert `msg` at the front of every topic it references.
    ///
    /// Topics that already hold the id are left untouched.
    pub fn record_message(&mut self, msg: &Message, arrived_at_ms: i64) {
        for topic in msg.topics() {
            let entry = self.topics.entry(topic).or_default();
            if entry.ids.contains(&msg.id) {
                continue;
            }

            entry.ids.insert(msg.id.clone());
            entry.messages.push_front(IndexedMessage {
                message: msg.clone(),
                arrived_at_ms,
            });
            entry.total_messages += 1;
            entry.last_seen_ms = entry.last_seen_ms.max(arrived_at_ms);

            while entry.messages.len() > self.cap {
                if let Some(evicted) = entry.messages.pop_back() {
                    entry.ids.remove(&evicted.message.id);
                }
            }
        }
    }

    /// Count one delivery of `msg` by `relay_url` for each of its topics.
    pub fn record_delivery(&mut self, msg: &Message, relay_url: &str) {
        for topic in msg.topics() {
            let entry = self.topics.entry(topic).or_default();
            *entry.relay_counts.entry(relay_url.to_string()).or_insert(0) += 1;
        }
    }

    /// Stored messages for `topic`, most recent first.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.topics
            .get(&topic_key(topic))
            .map(|entry| entry.messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Stored messages with their arrival times, most recent first.
    pub fn indexed_messages(&self, topic: &str, limit: usize) -> Vec<IndexedMessage> {
        self.topics
            .get(&topic_key(topic))
            .map(|entry| entry.messages.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Per-relay delivery counts for `topic`, highest first.
    pub fn distribution(&self, topic: &str) -> Vec<RelayShare> {
        self.topics
            .get(&topic_key(topic))
            .map(|entry| {
                top_counts(&entry.relay_counts, usize::MAX)
                    .into_iter()
                    .map(|(relay, count)| RelayShare { relay, count })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Topics with at least one message, by message count then recency.
    pub fn ranked_topics(&self, now_ms: i64, limit: usize) -> Vec<TopicSummary> {
        let window_start = now_ms - self.trending_window_ms;
        let mut ranked: Vec<TopicSummary> = self
            .topics
            .iter()
            .filter(|(_, entry)| entry.total_messages > 0)
            .map(|(topic, entry)| {
                let recent = entry
                    .messages
                    .iter()
                    .take_while(|m| m.arrived_at_ms >= window_start)
                    .count();
                TopicSummary {
                    topic: topic.clone(),
                    count: entry.total_messages,
                    last_seen_ms: entry.last_seen_ms,
                    trending: self.trending_min_messages > 0
                        && recent >= self.trending_min_messages,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| b.last_seen_ms.cmp(&a.last_seen_ms))
                .then_with(|| a.topic.cmp(&b.topic))
        });
        ranked.truncate(limit);
        ranked
    }

    pub fn insight(&self, topic: &str) -> Option<TopicInsight> {
        let key = topic_key(topic);
        let entry = self.topics.get(&key)?;

        let mut authors: HashMap<String, u64> = HashMap::new();
        let mut related: HashMap<String, u64> = HashMap::new();
        for indexed in &entry.messages {
            *authors.entry(indexed.message.author.clone()).or_insert(0) += 1;
            for other in indexed.message.topics() {
                if other != key {
                    *related.entry(other).or_insert(0) += 1;
                }
            }
        }

        Some(TopicInsight {
            topic: key.clone(),
            total_messages: entry.total_messages,
            unique_authors: authors.len(),
            related_topics: top_counts(&related, RELATED_TOPICS_LIMIT)
                .into_iter()
                .map(|(topic, count)| TopicCount { topic, count })
                .collect(),
            top_authors: top_counts(&authors, TOP_AUTHORS_LIMIT)
                .into_iter()
                .map(|(author, count)| AuthorCount { author, count })
                .collect(),
            relay_distribution: self.distribution(&key),
        })
    }

    /// Topics holding at least one message.
    pub fn topic_count(&self) -> usize {
        self.topics
            .values()
            .filter(|entry| entry.total_messages > 0)
            .count()
    }

    /// Whether any of `msg`'s topics still stores its id.
    pub fn holds(&self, msg: &Message) -> bool {
        msg.topics().iter().any(|topic| {
            self.topics
                .get(topic)
                .is_some_and(|entry| entry.ids.contains(&msg.id))
        })
    }

    /// Messages held across all topics (a message with several topics
    /// counts once per topic).
    pub fn stored_messages(&self) -> usize {
        self.topics.values().map(|entry| entry.messages.len()).sum()
    }
}

impl Default for TopicIndex {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAP, 3600, 5)
    }
}

/// Lookup key for a topic, normalized like `Message::topics`.
fn topic_key(topic: &str) -> String {
    topic.trim().to_lowercase()
}

/// Sort a count map descending, key ascending on ties, and keep `limit`.
fn top_counts(counts: &HashMap<String, u64>, limit: usize) -> Vec<(String, u64)> {
    let mut pairs: Vec<(String, u64)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    pairs.truncate(limit);
    pairs
}
