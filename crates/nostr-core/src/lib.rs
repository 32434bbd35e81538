//! Shared Nostr protocol functionality for relay-scout
//!
//! This crate provides the message model that flows through the ingestion
//! pipeline, NIP-19 relay hint extraction, and the transport contract used
//! to subscribe to relays.

pub mod hints;
pub mod message;
pub mod relay;

// Re-export commonly used types
pub use hints::{extract_hint_relays, find_entities};
pub use message::{
    normalize_relay_url, Message, RelayMarker, RelayTag, KIND_CONTACT_LIST, KIND_METADATA,
    KIND_RELAY_LIST, KIND_TEXT_NOTE,
};
pub use relay::{SdkTransport, SubscriptionFilter, Transport, TransportEvent};

// Re-export nostr-sdk for convenience
pub use nostr_sdk;
