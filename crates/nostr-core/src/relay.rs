//! Relay transport: the subscription contract and its nostr-sdk implementation.
//!
//! The ingestion side never touches sockets. It asks a [`Transport`] to
//! subscribe to a relay and receives every delivered event, and every
//! per-relay failure, through one shared channel.

use crate::message::Message;
use anyhow::{Context, Result};
use async_trait::async_trait;
use nostr_sdk::prelude::*;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What to request from a relay when subscribing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub kinds: Vec<u16>,
    /// Unix seconds; older events are not requested.
    pub since: u64,
}

/// Items pushed by a transport into the ingestion channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An event delivered by a subscribed relay.
    Message { relay_url: String, message: Message },
    /// The subscription on `relay_url` failed. Other relays are unaffected.
    Error { relay_url: String, error: String },
    /// Result of an on-demand fetch, not attributed to any relay.
    Fetched { message: Message },
}

/// Relay transport contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a subscription and forward its events into `sink` until
    /// [`Transport::unsubscribe`] is called or the relay fails.
    async fn subscribe(
        &self,
        relay_url: &str,
        filter: SubscriptionFilter,
        sink: mpsc::Sender<TransportEvent>,
    ) -> Result<()>;

    /// Close the subscription for `relay_url`. Unknown relays are ignored.
    async fn unsubscribe(&self, relay_url: &str) -> Result<()>;

    /// Fetch the newest event of `kind` signed by `author` (hex pubkey).
    async fn fetch_by_author(&self, kind: u16, author: &str) -> Result<Option<Message>>;
}

struct RelaySubscription {
    client: Client,
    task: JoinHandle<()>,
}

/// [`Transport`] backed by one nostr-sdk client per relay, so a failing relay
/// can be torn down without touching the others.
pub struct SdkTransport {
    subscriptions: Mutex<HashMap<String, RelaySubscription>>,
    fetch_timeout: Duration,
}

impl SdkTransport {
    pub fn new(fetch_timeout: Duration) -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            fetch_timeout,
        }
    }
}

#[async_trait]
impl Transport for SdkTransport {
    async fn subscribe(
        &self,
        relay_url: &str,
        filter: SubscriptionFilter,
        sink: mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        if self.subscriptions.lock().await.contains_key(relay_url) {
            return Ok(());
        }

        let client = Client::default();
        client
            .add_relay(relay_url)
            .await
            .with_context(|| format!("Failed to add relay: {}", relay_url))?;
        client.connect().await;

        let nostr_filter = Filter::new()
            .kinds(filter.kinds.iter().map(|k| Kind::from(*k)))
            .since(Timestamp::from(filter.since));

        // Take the receiver before subscribing so nothing is missed.
        let mut notifications = client.notifications();
        if let Err(e) = client.subscribe(nostr_filter, None).await {
            client.shutdown().await;
            return Err(e).with_context(|| format!("Failed to subscribe to {}", relay_url));
        }
        info!("Subscribed to {} (kinds {:?})", relay_url, filter.kinds);

        let url = relay_url.to_string();
        let task = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event { event, .. }) => {
                        let message = Message::from(event.as_ref());
                        let item = TransportEvent::Message {
                            relay_url: url.clone(),
                            message,
                        };
                        if sink.send(item).await.is_err() {
                            debug!("Ingestion channel closed, stopping {}", url);
                            break;
                        }
                    }
                    Ok(RelayPoolNotification::Shutdown) => {
                        let _ = sink
                            .send(TransportEvent::Error {
                                relay_url: url.clone(),
                                error: "relay connection shut down".to_string(),
                            })
                            .await;
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("{} lagged, {} notifications dropped", url, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = sink
                            .send(TransportEvent::Error {
                                relay_url: url.clone(),
                                error: "notification stream closed".to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        self.subscriptions
            .lock()
            .await
            .insert(relay_url.to_string(), RelaySubscription { client, task });
        Ok(())
    }

    async fn unsubscribe(&self, relay_url: &str) -> Result<()> {
        let removed = self.subscriptions.lock().await.remove(relay_url);
        if let Some(sub) = removed {
            sub.task.abort();
            sub.client.shutdown().await;
            info!("Unsubscribed from {}", relay_url);
        }
        Ok(())
    }

    async fn fetch_by_author(&self, kind: u16, author: &str) -> Result<Option<Message>> {
        let pubkey = PublicKey::from_hex(author)
            .with_context(|| format!("Invalid author pubkey: {}", author))?;
        let filter = Filter::new().author(pubkey).kind(Kind::from(kind)).limit(1);

        let clients: Vec<Client> = {
            let subs = self.subscriptions.lock().await;
            subs.values().map(|s| s.client.clone()).collect()
        };

        let mut newest: Option<Event> = None;
        for client in clients {
            let fetched = tokio::time::timeout(
                self.fetch_timeout,
                client.fetch_events(filter.clone(), self.fetch_timeout),
            )
            .await;
            let events = match fetched {
                Ok(Ok(events)) => events,
                Ok(Err(e)) => {
                    debug!("Fetch of kind {} for {} failed: {}", kind, author, e);
                    continue;
                }
                Err(_) => {
                    debug!("Fetch of kind {} for {} timed out", kind, author);
                    continue;
                }
            };
            for event in events.into_iter() {
                let newer = newest
                    .as_ref()
                    .map_or(true, |current| event.created_at > current.created_at);
                if newer {
                    newest = Some(event);
                }
            }
            if newest.is_some() {
                break;
            }
        }

        Ok(newest.as_ref().map(Message::from))
    }
}
