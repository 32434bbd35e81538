//! relay-scout: a Nostr topic index and relay discovery service.
//!
//! Events from every monitored relay are fanned into one ingestion loop
//! ([`coordinator`]) that indexes hashtags ([`topics`]) and collects relay
//! endorsements ([`discovery`]). The [`api`] module exposes both over HTTP.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod profiles;
pub mod store;
pub mod topics;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorState, IngestStats, RelayStatus};
pub use discovery::{DiscoveryConfig, RelayDiscovery, RelayRecommendation};
pub use topics::TopicIndex;
