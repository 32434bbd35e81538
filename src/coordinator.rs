//! Ingestion coordinator: owns the monitored relays and routes every
//! delivered event to the topic index and the discovery engine.
//!
//! All subscriptions push into one mpsc channel drained by a single
//! dispatch loop. Shared state lives behind one `RwLock`; writers hold it
//! for a whole unit of work and readers copy out what they need, so views
//! never observe a half-applied event. Transport calls are made with the
//! lock released.

use anyhow::{Context, Result};
use chrono::Utc;
use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::IngestConfig;
use crate::discovery::{DiscoveryConfig, DiscoveryStats, RelayDiscovery, RelayRecommendation};
use crate::profiles::ProfileCache;
use crate::store::StateStore;
use crate::topics::{IndexedMessage, TopicIndex, TopicInsight, TopicSummary};
use nostr_core::{
    normalize_relay_url, Message, SubscriptionFilter, Transport, TransportEvent,
    KIND_CONTACT_LIST, KIND_METADATA, KIND_RELAY_LIST, KIND_TEXT_NOTE,
};

const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Connection bookkeeping for one monitored relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub url: String,
    pub connected: bool,
    pub events_received: u64,
    pub last_activity_ms: Option<i64>,
    pub error: Option<String>,
}

impl RelayStatus {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            connected: false,
            events_received: 0,
            last_activity_ms: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStats {
    pub total_messages: u64,
    pub unique_topics: usize,
    pub active_relays: usize,
    pub monitored_relays: usize,
    pub by_kind: BTreeMap<u16, u64>,
    pub cached_profiles: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evicted_relays: usize,
    pub topics: usize,
    pub stored_messages: usize,
}

/// Work produced while the state lock was held, carried out after release.
#[derive(Debug, Default)]
struct FollowUp {
    connect: Vec<String>,
    fetch: Vec<(u16, String)>,
}

struct IngestState {
    topics: TopicIndex,
    discovery: RelayDiscovery,
    profiles: ProfileCache,
    relays: BTreeMap<String, RelayStatus>,
    seen: LruCache<String, ()>,
    total_messages: u64,
    by_kind: BTreeMap<u16, u64>,
    selected_topic: Option<String>,
}

impl IngestState {
    /// Index a message the first time its id is seen. Later sightings are
    /// no-ops here; per-relay accounting happens in the caller.
    ///
    /// The seen set is bounded. An id that has aged out of it is still
    /// recognized while a topic window stores it; past that, a late
    /// redelivery is processed again.
    fn ingest_new(&mut self, msg: &Message, now_ms: i64) -> FollowUp {
        let mut follow = FollowUp::default();
        if self.seen.put(msg.id.clone(), ()).is_some() || self.topics.holds(msg) {
            return follow;
        }

        self.total_messages += 1;
        *self.by_kind.entry(msg.kind).or_insert(0) += 1;
        self.topics.record_message(msg, now_ms);

        match msg.kind {
            KIND_RELAY_LIST => {
                follow.connect = self.discovery.process_relay_list(msg);
            }
            KIND_TEXT_NOTE => {
                self.discovery.process_hints(msg);
                if self.profiles.request_profile(&msg.author) {
                    follow.fetch.push((KIND_METADATA, msg.author.clone()));
                }
            }
            KIND_CONTACT_LIST => {
                self.discovery.process_contact_list(msg);
            }
            KIND_METADATA => {
                self.profiles.store_profile_raw(&msg.author, &msg.content);
                if self.profiles.request_relay_list(&msg.author) {
                    follow.fetch.push((KIND_RELAY_LIST, msg.author.clone()));
                }
            }
            _ => {}
        }
        follow
    }
}

/// Shared half of the coordinator, handed to the API layer.
pub struct CoordinatorState {
    config: IngestConfig,
    transport: Arc<dyn Transport>,
    inner: RwLock<IngestState>,
    events_tx: mpsc::Sender<TransportEvent>,
    store: Option<StateStore>,
    start_time: Instant,
}

pub struct Coordinator {
    state: Arc<CoordinatorState>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(
        config: IngestConfig,
        discovery: DiscoveryConfig,
        transport: Arc<dyn Transport>,
        store: Option<StateStore>,
    ) -> Result<Self> {
        let mut discovery =
            RelayDiscovery::new(discovery).with_context(|| "Failed to create relay discovery")?;

        if let Some(store) = &store {
            if let Some(saved) = store.load()? {
                let imported = discovery.import_state(&saved);
                info!("Restored {} relay endorsement entries", imported);
            }
        }

        let seen_cap = NonZeroUsize::new(config.seen_cache_size)
            .with_context(|| "seen_cache_size must be at least 1")?;

        let inner = IngestState {
            topics: TopicIndex::new(
                config.topic_cap,
                config.trending_window_secs,
                config.trending_min_messages,
            ),
            discovery,
            profiles: ProfileCache::with_capacity(config.profile_cache_size),
            relays: BTreeMap::new(),
            seen: LruCache::new(seen_cap),
            total_messages: 0,
            by_kind: BTreeMap::new(),
            selected_topic: None,
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(CoordinatorState {
            config,
            transport,
            inner: RwLock::new(inner),
            events_tx,
            store,
            start_time: Instant::now(),
        });

        Ok(Coordinator {
            state,
            events_rx: Some(events_rx),
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Spawn the dispatch loop and the periodic sweep.
    pub fn start(&mut self) -> Result<()> {
        let events_rx = self
            .events_rx
            .take()
            .with_context(|| "Coordinator already started")?;

        let state = self.state.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            Self::event_processing_loop(state, events_rx, &mut shutdown_rx).await;
        }));

        let state = self.state.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            Self::maintenance_loop(state, &mut shutdown_rx).await;
        }));

        info!("Coordinator started");
        Ok(())
    }

    /// Stop both loops, close every subscription and persist discovery
    /// state. An event already being dispatched is finished first.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down coordinator");
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Coordinator task ended abnormally: {}", e);
            }
        }

        for url in self.state.monitored_relays().await {
            if let Err(e) = self.state.remove_relay(&url).await {
                warn!("Failed to close {}: {:#}", url, e);
            }
        }

        self.state.persist().await;
        info!("Coordinator shutdown complete");
        Ok(())
    }

    pub fn state(&self) -> Arc<CoordinatorState> {
        self.state.clone()
    }

    async fn event_processing_loop(
        state: Arc<CoordinatorState>,
        mut events_rx: mpsc::Receiver<TransportEvent>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        info!("Event processing loop started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Event processing loop shutting down");
                    break;
                },
                Some(event) = events_rx.recv() => {
                    state.handle_event(event).await;
                },
                else => {
                    warn!("Event stream ended");
                    break;
                }
            }
        }
    }

    async fn maintenance_loop(
        state: Arc<CoordinatorState>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        let period = Duration::from_secs(state.config.sweep_interval_secs.max(1));
        let mut sweep_interval = interval_at(tokio::time::Instant::now() + period, period);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = sweep_interval.tick() => {
                    let report = state.sweep(Utc::now().timestamp_millis()).await;
                    if report.evicted_relays > 0 {
                        info!("Evicted {} stale relay endorsements", report.evicted_relays);
                    }
                    debug!(
                        "Sweep: {} topics, {} stored messages",
                        report.topics, report.stored_messages
                    );
                    state.persist().await;
                }
            }
        }
    }
}

impl CoordinatorState {
    /// Apply one item from the ingestion channel.
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message { relay_url, message } => {
                self.dispatch(&relay_url, &message).await;
            }
            TransportEvent::Error { relay_url, error } => {
                warn!("Relay {} failed: {}", relay_url, error);
                self.mark_error(&relay_url, error).await;
            }
            TransportEvent::Fetched { message } => {
                let follow = {
                    let mut inner = self.inner.write().await;
                    inner.ingest_new(&message, Utc::now().timestamp_millis())
                };
                self.follow_up(follow).await;
            }
        }
    }

    async fn dispatch(&self, relay_url: &str, msg: &Message) {
        let now_ms = Utc::now().timestamp_millis();
        let follow = {
            let mut inner = self.inner.write().await;
            let Some(status) = inner.relays.get_mut(relay_url) else {
                trace!("Dropping event {} from unmonitored relay {}", msg.id, relay_url);
                return;
            };
            status.connected = true;
            status.events_received += 1;
            status.last_activity_ms = Some(now_ms);
            status.error = None;

            inner.topics.record_delivery(msg, relay_url);
            inner.ingest_new(msg, now_ms)
        };
        self.follow_up(follow).await;
    }

    async fn follow_up(&self, follow: FollowUp) {
        for url in follow.connect {
            if !self.config.auto_connect {
                continue;
            }
            let monitored = self.inner.read().await.relays.len();
            if monitored >= self.config.max_monitored_relays {
                debug!("Not connecting to {}: relay limit reached", url);
                continue;
            }
            info!("Discovered relay {}", url);
            if let Err(e) = self.add_relay(&url).await {
                warn!("Failed to add discovered relay {}: {:#}", url, e);
            }
        }

        for (kind, author) in follow.fetch {
            let transport = self.transport.clone();
            let events_tx = self.events_tx.clone();
            tokio::spawn(async move {
                match transport.fetch_by_author(kind, &author).await {
                    Ok(Some(message)) => {
                        if events_tx.send(TransportEvent::Fetched { message }).await.is_err() {
                            debug!("Ingestion channel closed before fetch result");
                        }
                    }
                    Ok(None) => trace!("No kind {} event found for {}", kind, author),
                    Err(e) => debug!("Fetch of kind {} for {} failed: {:#}", kind, author, e),
                }
            });
        }
    }

    async fn mark_error(&self, relay_url: &str, error: String) {
        let mut inner = self.inner.write().await;
        if let Some(status) = inner.relays.get_mut(relay_url) {
            status.connected = false;
            status.error = Some(error);
        }
    }

    /// Start monitoring a relay. Returns `false` when it was already
    /// monitored. A failed subscription keeps the relay registered with its
    /// error recorded.
    ///
    /// If the relay is removed while the subscription is being opened, the
    /// fresh subscription is closed again.
    pub async fn add_relay(&self, raw_url: &str) -> Result<bool> {
        let url = normalize_relay_url(raw_url)
            .with_context(|| format!("Invalid relay URL: {}", raw_url))?;

        {
            let mut inner = self.inner.write().await;
            if inner.relays.contains_key(&url) {
                return Ok(false);
            }
            inner.relays.insert(url.clone(), RelayStatus::new(&url));
        }

        let since = (Utc::now().timestamp().max(0) as u64)
            .saturating_sub(self.config.since_minutes.saturating_mul(60));
        let filter = SubscriptionFilter {
            kinds: self.config.kinds.clone(),
            since,
        };

        if let Err(e) = self
            .transport
            .subscribe(&url, filter, self.events_tx.clone())
            .await
        {
            error!("Failed to subscribe to {}: {:#}", url, e);
            self.mark_error(&url, format!("{:#}", e)).await;
            return Ok(true);
        }

        let still_monitored = self.inner.read().await.relays.contains_key(&url);
        if !still_monitored {
            debug!("{} was removed while subscribing, closing", url);
            self.transport
                .unsubscribe(&url)
                .await
                .with_context(|| format!("Failed to unsubscribe from {}", url))?;
            return Ok(true);
        }

        info!("Monitoring {}", url);
        Ok(true)
    }

    /// Stop monitoring a relay. Returns `false` when it was not monitored.
    pub async fn remove_relay(&self, raw_url: &str) -> Result<bool> {
        let url = normalize_relay_url(raw_url).unwrap_or_else(|| raw_url.trim().to_string());
        let removed = self.inner.write().await.relays.remove(&url).is_some();
        if !removed {
            return Ok(false);
        }
        self.transport
            .unsubscribe(&url)
            .await
            .with_context(|| format!("Failed to unsubscribe from {}", url))?;
        info!("Stopped monitoring {}", url);
        Ok(true)
    }

    pub async fn monitored_relays(&self) -> Vec<String> {
        self.inner.read().await.relays.keys().cloned().collect()
    }

    pub async fn relay_statuses(&self) -> Vec<RelayStatus> {
        self.inner.read().await.relays.values().cloned().collect()
    }

    pub async fn stats(&self) -> IngestStats {
        let inner = self.inner.read().await;
        IngestStats {
            total_messages: inner.total_messages,
            unique_topics: inner.topics.topic_count(),
            active_relays: inner.relays.values().filter(|s| s.connected).count(),
            monitored_relays: inner.relays.len(),
            by_kind: inner.by_kind.clone(),
            cached_profiles: inner.profiles.profile_count(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    pub async fn ranked_topics(&self, limit: usize) -> Vec<TopicSummary> {
        let now_ms = Utc::now().timestamp_millis();
        self.inner.read().await.topics.ranked_topics(now_ms, limit)
    }

    pub async fn topic_insight(&self, topic: &str) -> Option<TopicInsight> {
        self.inner.read().await.topics.insight(topic)
    }

    pub async fn topic_messages(&self, topic: &str, limit: usize) -> Vec<IndexedMessage> {
        self.inner.read().await.topics.indexed_messages(topic, limit)
    }

    pub async fn select_topic(&self, topic: &str) {
        let topic = topic.trim().to_lowercase();
        let mut inner = self.inner.write().await;
        inner.selected_topic = if topic.is_empty() { None } else { Some(topic) };
    }

    pub async fn selected_topic(&self) -> Option<String> {
        self.inner.read().await.selected_topic.clone()
    }

    /// Author display names for the given pubkeys, from the profile cache.
    pub async fn display_names(&self, authors: &[String]) -> HashMap<String, String> {
        let inner = self.inner.read().await;
        authors
            .iter()
            .map(|a| (a.clone(), inner.profiles.display_name(a)))
            .collect()
    }

    /// Ranked relay recommendations. Stale entries are evicted on the way,
    /// so this takes the write lock.
    pub async fn recommended(&self) -> Vec<RelayRecommendation> {
        self.inner.write().await.discovery.recommended()
    }

    pub async fn discovery_stats(&self) -> DiscoveryStats {
        self.inner.read().await.discovery.stats()
    }

    pub async fn export_recommendations(&self) -> Value {
        self.inner.read().await.discovery.export_state()
    }

    pub async fn import_recommendations(&self, state: &Value) -> usize {
        self.inner.write().await.discovery.import_state(state)
    }

    pub async fn sweep(&self, now_ms: i64) -> SweepReport {
        let mut inner = self.inner.write().await;
        SweepReport {
            evicted_relays: inner.discovery.sweep(now_ms),
            topics: inner.topics.topic_count(),
            stored_messages: inner.topics.stored_messages(),
        }
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let exported = self.export_recommendations().await;
        if let Err(e) = store.save(&exported) {
            warn!("Failed to persist discovery state: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct RecordingTransport {
        subscribed: Mutex<Vec<(String, SubscriptionFilter)>>,
        unsubscribed: Mutex<Vec<String>>,
        live: Mutex<HashSet<String>>,
        fetches: Mutex<Vec<(u16, String)>>,
        fail: Vec<String>,
        subscribe_delay: Option<Duration>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn subscribe(
            &self,
            relay_url: &str,
            filter: SubscriptionFilter,
            _sink: mpsc::Sender<TransportEvent>,
        ) -> Result<()> {
            if let Some(delay) = self.subscribe_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.iter().any(|u| u == relay_url) {
                anyhow::bail!("connection refused");
            }
            self.subscribed.lock().push((relay_url.to_string(), filter));
            self.live.lock().insert(relay_url.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, relay_url: &str) -> Result<()> {
            self.unsubscribed.lock().push(relay_url.to_string());
            self.live.lock().remove(relay_url);
            Ok(())
        }

        async fn fetch_by_author(&self, kind: u16, author: &str) -> Result<Option<Message>> {
            self.fetches.lock().push((kind, author.to_string()));
            Ok(None)
        }
    }

    fn coordinator(transport: Arc<RecordingTransport>, min: usize) -> Coordinator {
        Coordinator::new(
            IngestConfig::default(),
            DiscoveryConfig {
                min_endorsements: min,
                ..Default::default()
            },
            transport,
            None,
        )
        .unwrap()
    }

    fn deliver(relay: &str, msg: &Message) -> TransportEvent {
        TransportEvent::Message {
            relay_url: relay.to_string(),
            message: msg.clone(),
        }
    }

    fn tagged(id: &str, kind: u16, tags: &[(&str, &str)]) -> Message {
        Message::new(
            id,
            "aaaaaaaaaaaaaaaa",
            Utc::now().timestamp() as u64,
            kind,
            tags.iter()
                .map(|(k, v)| vec![k.to_string(), v.to_string()])
                .collect(),
            "",
        )
    }

    #[tokio::test]
    async fn add_relay_subscribes_with_window() {
        let transport = Arc::new(RecordingTransport::default());
        let c = coordinator(transport.clone(), 2);
        let state = c.state();

        assert!(state.add_relay("wss://one.example/").await.unwrap());
        assert!(!state.add_relay("wss://one.example").await.unwrap());
        assert!(state.add_relay("https://nope.example").await.is_err());

        let subs = transport.subscribed.lock().clone();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].0, "wss://one.example");
        assert_eq!(subs[0].1.kinds, vec![0, 1, 3, 10002]);
        let expected_since = Utc::now().timestamp() as u64 - 30 * 60;
        assert!(subs[0].1.since.abs_diff(expected_since) <= 5);

        let statuses = state.relay_statuses().await;
        assert_eq!(statuses, vec![RelayStatus::new("wss://one.example")]);
    }

    #[tokio::test]
    async fn failed_subscription_keeps_relay() {
        let transport = Arc::new(RecordingTransport {
            fail: vec!["wss://down.example".to_string()],
            ..Default::default()
        });
        let c = coordinator(transport, 2);
        let state = c.state();

        state.add_relay("wss://down.example").await.unwrap();
        let statuses = state.relay_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].connected);
        assert!(statuses[0].error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn same_message_from_two_relays() {
        let transport = Arc::new(RecordingTransport::default());
        let c = coordinator(transport, 2);
        let state = c.state();
        state.add_relay("wss://one.example").await.unwrap();
        state.add_relay("wss://two.example").await.unwrap();

        let msg = tagged("note1", 7, &[("t", "bitcoin"), ("t", "nostr")]);
        state.handle_event(deliver("wss://one.example", &msg)).await;
        state.handle_event(deliver("wss://two.example", &msg)).await;

        let inner = state.inner.read().await;
        assert_eq!(inner.topics.messages("bitcoin").len(), 1);
        let dist = inner.topics.distribution("bitcoin");
        assert_eq!(dist.len(), 2);
        assert!(dist.iter().all(|share| share.count == 1));
        assert_eq!(inner.total_messages, 1);
        drop(inner);

        let statuses = state.relay_statuses().await;
        assert!(statuses.iter().all(|s| s.connected && s.events_received == 1));
        let stats = state.stats().await;
        assert_eq!(stats.active_relays, 2);
        assert_eq!(stats.unique_topics, 2);
    }

    #[tokio::test]
    async fn error_marks_only_that_relay() {
        let transport = Arc::new(RecordingTransport::default());
        let c = coordinator(transport, 2);
        let state = c.state();
        state.add_relay("wss://one.example").await.unwrap();
        state.add_relay("wss://two.example").await.unwrap();

        let msg = tagged("note1", 7, &[("t", "nostr")]);
        state.handle_event(deliver("wss://one.example", &msg)).await;
        state.handle_event(deliver("wss://two.example", &msg)).await;
        state
            .handle_event(TransportEvent::Error {
                relay_url: "wss://one.example".to_string(),
                error: "socket closed".to_string(),
            })
            .await;

        let statuses = state.relay_statuses().await;
        assert_eq!(statuses.len(), 2);
        assert!(!statuses[0].connected);
        assert_eq!(statuses[0].error.as_deref(), Some("socket closed"));
        assert!(statuses[1].connected);
    }

    #[tokio::test]
    async fn relay_list_auto_connects_promoted_relays() {
        let transport = Arc::new(RecordingTransport::default());
        let c = coordinator(transport.clone(), 2);
        let state = c.state();
        state.add_relay("wss://seed.example").await.unwrap();

        let first = tagged("list1", KIND_RELAY_LIST, &[("r", "wss://found.example/")]);
        state.handle_event(deliver("wss://seed.example", &first)).await;
        assert_eq!(state.monitored_relays().await, vec!["wss://seed.example"]);

        let mut second = tagged("list2", KIND_RELAY_LIST, &[("r", "wss://found.example")]);
        second.author = "bbbbbbbbbbbbbbbb".to_string();
        state.handle_event(deliver("wss://seed.example", &second)).await;

        let relays = state.monitored_relays().await;
        assert_eq!(relays, vec!["wss://found.example", "wss://seed.example"]);
        assert_eq!(state.recommended().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_during_subscribe_closes_subscription() {
        let transport = Arc::new(RecordingTransport {
            subscribe_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let c = coordinator(transport.clone(), 2);
        let state = c.state();

        let adding = {
            let state = state.clone();
            tokio::spawn(async move { state.add_relay("wss://slow.example").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(state.remove_relay("wss://slow.example").await.unwrap());
        assert!(adding.await.unwrap().unwrap());

        assert!(state.monitored_relays().await.is_empty());
        assert!(transport.live.lock().is_empty());
        assert_eq!(transport.subscribed.lock().len(), 1);
    }

    #[tokio::test]
    async fn id_still_in_topic_window_is_not_recounted() {
        let transport = Arc::new(RecordingTransport::default());
        let c = Coordinator::new(
            IngestConfig {
                seen_cache_size: 1,
                ..Default::default()
            },
            DiscoveryConfig::default(),
            transport,
            None,
        )
        .unwrap();
        let state = c.state();
        state.add_relay("wss://one.example").await.unwrap();

        let first = tagged("a", 7, &[("t", "rust")]);
        let second = tagged("b", 7, &[("t", "go")]);
        for msg in [&first, &second, &first] {
            state.handle_event(deliver("wss://one.example", msg)).await;
        }

        let stats = state.stats().await;
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.by_kind.get(&7), Some(&2));
        assert_eq!(stats.unique_topics, 2);
    }

    #[tokio::test]
    async fn note_triggers_single_profile_fetch() {
        let transport = Arc::new(RecordingTransport::default());
        let c = coordinator(transport.clone(), 2);
        let state = c.state();
        state.add_relay("wss://one.example").await.unwrap();

        state
            .handle_event(deliver("wss://one.example", &tagged("n1", KIND_TEXT_NOTE, &[])))
            .await;
        state
            .handle_event(deliver("wss://one.example", &tagged("n2", KIND_TEXT_NOTE, &[])))
            .await;

        for _ in 0..50 {
            if !transport.fetches.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let fetches = transport.fetches.lock().clone();
        assert_eq!(fetches, vec![(KIND_METADATA, "aaaaaaaaaaaaaaaa".to_string())]);
    }

    #[tokio::test]
    async fn removed_relay_drops_late_events() {
        let transport = Arc::new(RecordingTransport::default());
        let c = coordinator(transport.clone(), 2);
        let state = c.state();
        state.add_relay("wss://one.example").await.unwrap();
        assert!(state.remove_relay("wss://one.example/").await.unwrap());
        assert!(!state.remove_relay("wss://one.example").await.unwrap());
        assert_eq!(transport.unsubscribed.lock().clone(), vec!["wss://one.example"]);

        state
            .handle_event(deliver("wss://one.example", &tagged("n1", 7, &[("t", "x")])))
            .await;
        assert_eq!(state.stats().await.total_messages, 0);
        assert!(state.relay_statuses().await.is_empty());
    }

    #[tokio::test]
    async fn start_and_shutdown_close_subscriptions() {
        let transport = Arc::new(RecordingTransport::default());
        let mut c = coordinator(transport.clone(), 2);
        c.start().unwrap();
        assert!(c.start().is_err());
        c.state().add_relay("wss://one.example").await.unwrap();
        c.shutdown().await.unwrap();
        assert_eq!(transport.unsubscribed.lock().clone(), vec!["wss://one.example"]);
        assert!(c.state().relay_statuses().await.is_empty());
    }

    #[tokio::test]
    async fn select_topic_normalizes() {
        let transport = Arc::new(RecordingTransport::default());
        let c = coordinator(transport, 2);
        let state = c.state();
        state.select_topic(" Bitcoin ").await;
        assert_eq!(state.selected_topic().await.as_deref(), Some("bitcoin"));
        state.select_topic("").await;
        assert!(state.selected_topic().await.is_none());
    }
}
