//! `stripevolume` — the data-plane engine of a mounted distributed virtual
//! block device: striping and Reed–Solomon erasure coding across remote
//! partitions, AES-CBC encryption at rest, and a write-back stripe cache.
//!
//! Dependency order, leaves first: [`codec`] → [`partition`] → [`cache`] →
//! [`volume`]. [`device`] wraps a [`volume::Volume`] in the callback shape an
//! external OS block-device shim expects; [`config`] and [`dht`] describe
//! the control-plane collaborator ([`config::Loader`]) this crate consumes
//! but does not implement.

pub mod cache;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod device;
pub mod dht;
pub mod error;
pub mod partition;
pub mod volume;

pub use cache::{CacheConfig, StripeCache};
pub use codec::Block;
pub use config::{Loader, PartitionRef, VolumeConfig};
pub use device::BlockDevice;
pub use dht::{DhtClient, EndpointRecord, RelayEndpoint, RelayGroup, StorageCandidate};
pub use error::{Error, Result};
pub use partition::{
    AsyncResult, HttpPartitionClient, MockPartitionClient, PartitionClient, PartitionEndpoint,
};
pub use volume::Volume;
