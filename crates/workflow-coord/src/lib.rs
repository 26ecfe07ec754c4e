//! Strongly-consistent coordination store adapter.
//!
//! Everything the scheduling engine needs from a distributed KV store --
//! get/put, prefix scans, optimistic multi-key transactions, lease-backed
//! presence, and a FIFO queue -- lives behind [`CoordStore`], so the rest
//! of the workspace never talks to `etcd-client` directly.

mod config;
mod error;
mod etcd_store;
mod keys;
mod memory_store;
mod store;

pub use config::CoordConfig;
pub use error::CoordError;
pub use etcd_store::EtcdCoordStore;
pub use keys::{KeySchema, TaskRef};
pub use memory_store::InMemoryCoordStore;
pub use store::{CoordBackend, CoordStore, KeepAliveStream, KvEntry, LeaseId, Queue, StmView};
