//! End-to-end ingestion through the dispatch loop with an in-memory relay
//! transport.

use anyhow::Result;
use async_trait::async_trait;
use bech32::{ToBase32, Variant};
use chrono::Utc;
use nostr_core::{Message, SubscriptionFilter, Transport, TransportEvent, KIND_RELAY_LIST};
use parking_lot::Mutex;
use relay_scout::config::IngestConfig;
use relay_scout::store::StateStore;
use relay_scout::{Coordinator, CoordinatorState, DiscoveryConfig};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Keeps each subscription's sink so tests can play the relay's part.
#[derive(Default)]
struct MemoryTransport {
    sinks: Mutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
    profiles: Mutex<HashMap<String, Message>>,
}

impl MemoryTransport {
    async fn publish(&self, relay_url: &str, message: &Message) {
        let sink = self.sinks.lock().get(relay_url).cloned();
        let sink = sink.unwrap_or_else(|| panic!("not subscribed to {relay_url}"));
        sink.send(TransportEvent::Message {
            relay_url: relay_url.to_string(),
            message: message.clone(),
        })
        .await
        .unwrap();
    }

    async fn fail(&self, relay_url: &str, error: &str) {
        let sink = self.sinks.lock().get(relay_url).cloned().unwrap();
        sink.send(TransportEvent::Error {
            relay_url: relay_url.to_string(),
            error: error.to_string(),
        })
        .await
        .unwrap();
    }

    fn is_subscribed(&self, relay_url: &str) -> bool {
        self.sinks.lock().contains_key(relay_url)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(
        &self,
        relay_url: &str,
        _filter: SubscriptionFilter,
        sink: mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        self.sinks.lock().insert(relay_url.to_string(), sink);
        Ok(())
    }

    async fn unsubscribe(&self, relay_url: &str) -> Result<()> {
        self.sinks.lock().remove(relay_url);
        Ok(())
    }

    async fn fetch_by_author(&self, kind: u16, author: &str) -> Result<Option<Message>> {
        Ok(self
            .profiles
            .lock()
            .get(author)
            .filter(|m| m.kind == kind)
            .cloned())
    }
}

fn note(id: &str, author: &str, kind: u16, tags: &[(&str, &str)], content: &str) -> Message {
    Message::new(
        id,
        author,
        Utc::now().timestamp() as u64,
        kind,
        tags.iter()
            .map(|(k, v)| vec![k.to_string(), v.to_string()])
            .collect(),
        content,
    )
}

fn nprofile_with_relay(relay: &str) -> String {
    let mut tlv = vec![0u8, 32];
    tlv.extend_from_slice(&[7u8; 32]);
    tlv.push(1);
    tlv.push(relay.len() as u8);
    tlv.extend_from_slice(relay.as_bytes());
    bech32::encode("nprofile", tlv.to_base32(), Variant::Bech32).unwrap()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn start(
    transport: Arc<MemoryTransport>,
    store: Option<StateStore>,
) -> (Coordinator, Arc<CoordinatorState>) {
    let mut coordinator = Coordinator::new(
        IngestConfig::default(),
        DiscoveryConfig::default(),
        transport,
        store,
    )
    .unwrap();
    coordinator.start().unwrap();
    let state = coordinator.state();
    (coordinator, state)
}

#[tokio::test]
async fn identical_message_from_two_relays() {
    let transport = Arc::new(MemoryTransport::default());
    let (mut coordinator, state) = start(transport.clone(), None);
    state.add_relay("wss://one.example").await.unwrap();
    state.add_relay("wss://two.example").await.unwrap();

    let msg = note("id-1", "author-a", 7, &[("t", "Nostr")], "gm #nostr");
    transport.publish("wss://one.example", &msg).await;
    transport.publish("wss://two.example", &msg).await;

    eventually(|| {
        let state = state.clone();
        async move {
            state
                .relay_statuses()
                .await
                .iter()
                .all(|s| s.events_received == 1)
        }
    })
    .await;

    assert_eq!(state.topic_messages("nostr", 100).await.len(), 1);
    let insight = state.topic_insight("nostr").await.unwrap();
    assert_eq!(insight.total_messages, 1);
    assert_eq!(insight.relay_distribution.len(), 2);
    assert!(insight.relay_distribution.iter().all(|r| r.count == 1));
    assert_eq!(state.stats().await.total_messages, 1);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn relay_list_and_hint_promotion() {
    let transport = Arc::new(MemoryTransport::default());
    let (mut coordinator, state) = start(transport.clone(), None);
    state.add_relay("wss://seed.example").await.unwrap();

    let list = Message::new(
        "list-1",
        "author-a",
        Utc::now().timestamp() as u64,
        KIND_RELAY_LIST,
        vec![
            vec!["r".to_string(), "wss://relay.example".to_string()],
            vec!["r".to_string(), "wss://read.example".to_string(), "read".to_string()],
        ],
        "",
    );
    transport.publish("wss://seed.example", &list).await;

    let second_list = Message::new(
        "list-2",
        "author-c",
        Utc::now().timestamp() as u64,
        KIND_RELAY_LIST,
        vec![vec!["r".to_string(), "wss://relay.example".to_string(), "write".to_string()]],
        "",
    );
    transport.publish("wss://seed.example", &second_list).await;

    let hinted = note(
        "note-1",
        "author-b",
        1,
        &[],
        &format!("see nostr:{}", nprofile_with_relay("wss://read.example")),
    );
    transport.publish("wss://seed.example", &hinted).await;

    eventually(|| {
        let state = state.clone();
        async move { state.recommended().await.len() == 2 }
    })
    .await;

    let recommended = state.recommended().await;
    let urls: Vec<&str> = recommended.iter().map(|r| r.url.as_str()).collect();
    // read.example: 2 authors + relay-list and hint bonuses outranks
    // relay.example: 2 authors + relay-list bonus.
    assert_eq!(urls, vec!["wss://read.example", "wss://relay.example"]);
    let read = &recommended[0];
    assert_eq!(read.read_count, 2);
    assert_eq!(read.total_recs, 2);
    assert_eq!(read.sources.len(), 2);

    // Only relay-list promotions are connected automatically.
    assert!(transport.is_subscribed("wss://relay.example"));
    assert!(!transport.is_subscribed("wss://read.example"));
    assert_eq!(
        state.monitored_relays().await,
        vec!["wss://relay.example", "wss://seed.example"]
    );

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn unmarked_announcement_then_hint_reaches_two() {
    let transport = Arc::new(MemoryTransport::default());
    let (mut coordinator, state) = start(transport.clone(), None);
    state.add_relay("wss://seed.example").await.unwrap();

    let announcement = note(
        "list-1",
        "author-a",
        KIND_RELAY_LIST,
        &[("r", "wss://relay.example/")],
        "",
    );
    transport.publish("wss://seed.example", &announcement).await;
    eventually(|| {
        let state = state.clone();
        async move { state.discovery_stats().await.tracked_relays == 1 }
    })
    .await;
    assert!(state.recommended().await.is_empty());

    let hinted = note(
        "note-1",
        "author-b",
        1,
        &[],
        &format!("nostr:{}", nprofile_with_relay("wss://relay.example")),
    );
    transport.publish("wss://seed.example", &hinted).await;
    eventually(|| {
        let state = state.clone();
        async move { state.recommended().await.len() == 1 }
    })
    .await;

    let recommended = state.recommended().await;
    assert_eq!(recommended[0].url, "wss://relay.example");
    assert_eq!(recommended[0].total_recs, 2);
    assert_eq!(recommended[0].sources.len(), 2);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn relay_error_leaves_others_running() {
    let transport = Arc::new(MemoryTransport::default());
    let (mut coordinator, state) = start(transport.clone(), None);
    state.add_relay("wss://one.example").await.unwrap();
    state.add_relay("wss://two.example").await.unwrap();

    transport.fail("wss://one.example", "connection reset").await;
    transport
        .publish("wss://two.example", &note("id-1", "a", 7, &[("t", "rust")], ""))
        .await;

    eventually(|| {
        let state = state.clone();
        async move { state.stats().await.total_messages == 1 }
    })
    .await;

    let statuses = state.relay_statuses().await;
    let one = statuses.iter().find(|s| s.url == "wss://one.example").unwrap();
    let two = statuses.iter().find(|s| s.url == "wss://two.example").unwrap();
    assert!(!one.connected);
    assert_eq!(one.error.as_deref(), Some("connection reset"));
    assert!(two.connected);
    assert_eq!(two.events_received, 1);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn fetched_profile_is_ingested_without_relay() {
    let transport = Arc::new(MemoryTransport::default());
    transport.profiles.lock().insert(
        "author-a".to_string(),
        note("meta-1", "author-a", 0, &[], r#"{"name":"alice"}"#),
    );
    let (mut coordinator, state) = start(transport.clone(), None);
    state.add_relay("wss://one.example").await.unwrap();

    transport
        .publish("wss://one.example", &note("n-1", "author-a", 1, &[("t", "x")], "hi"))
        .await;

    eventually(|| {
        let state = state.clone();
        async move { state.stats().await.by_kind.get(&0) == Some(&1) }
    })
    .await;

    let names = state.display_names(&["author-a".to_string()]).await;
    assert_eq!(names["author-a"], "alice");
    let statuses = state.relay_statuses().await;
    assert_eq!(statuses[0].events_received, 1);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_persists_and_restart_restores() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("state.db");

    let transport = Arc::new(MemoryTransport::default());
    let (mut coordinator, state) = start(transport.clone(), Some(StateStore::open(&db).unwrap()));
    state.add_relay("wss://seed.example").await.unwrap();
    transport
        .publish(
            "wss://seed.example",
            &note("list-1", "author-a", KIND_RELAY_LIST, &[("r", "wss://kept.example")], ""),
        )
        .await;
    transport
        .publish(
            "wss://seed.example",
            &note("list-2", "author-b", KIND_RELAY_LIST, &[("r", "wss://kept.example")], ""),
        )
        .await;
    eventually(|| {
        let state = state.clone();
        async move { state.discovery_stats().await.qualified_relays == 1 }
    })
    .await;
    coordinator.shutdown().await.unwrap();
    assert!(!transport.is_subscribed("wss://seed.example"));

    let (mut restarted, state) = start(
        Arc::new(MemoryTransport::default()),
        Some(StateStore::open(&db).unwrap()),
    );
    let recommended = state.recommended().await;
    assert_eq!(recommended.len(), 1);
    assert_eq!(recommended[0].url, "wss://kept.example");
    restarted.shutdown().await.unwrap();
}
