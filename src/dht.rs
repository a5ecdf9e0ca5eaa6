//! DHT interface shapes (§4.5, §6): the two operations the `Loader`
//! depends on for provider discovery. No client is implemented here — only
//! the request/response wire types the core's control-plane collaborator
//! needs to agree on, matching the "specified only through their interface
//! to the core" scoping of the Kademlia lookup service.

use serde::{Deserialize, Serialize};

/// One relay endpoint for a provider, as returned by `get_value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub host: String,
    #[serde(rename = "socksPort")]
    pub socks_port: u16,
    #[serde(rename = "quicPort")]
    pub quic_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayGroup {
    pub name: String,
    pub endpoints: Vec<RelayEndpoint>,
}

/// `get_value("ep:" + partition_name)` response: the provider's direct URL
/// plus its DHT-discovered relay fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub url: String,
    pub relays: Vec<RelayGroup>,
}

/// One candidate returned by `query("type:\"storage\" availableSize:N", limit)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageCandidate {
    pub name: String,
    pub contract: String,
    #[serde(rename = "availableSize")]
    pub available_size: u64,
    pub reputation: f64,
}

/// The two DHT operations the core depends on, as a narrow capability
/// interface rather than a full Kademlia client.
pub trait DhtClient: Send + Sync {
    fn get_value(&self, key: &str) -> crate::error::Result<EndpointRecord>;

    fn query(&self, expr: &str, limit: u32) -> crate::error::Result<Vec<StorageCandidate>>;
}
