//! Nostr relay client with NIP-77 negentropy sync.
//!
//! This crate exposes:
//! - relay connections and a relay pool over WebSocket
//! - a local cache contract with an in-memory implementation
//! - multi-relay negentropy sync and sync-and-subscribe

pub mod cache;
pub mod error;
pub mod pool;
pub mod relay;
pub mod subscription;
pub mod sync;

pub use cache::{CacheAdapter, MemoryCache, RelayStatus, RelayStatusUpdate};
pub use error::{ClientError, Result};
pub use pool::{PoolConfig, RelayPool};
pub use relay::{ConnectionState, NegentropyReply, RelayConfig, RelayConnection, RelayMessage};
pub use subscription::Subscription;
pub use sync::{
    NegentropySync, RelayCapability, SubscribeOptions, SyncConfig, SyncOptions, SyncRelay,
    SyncResult, SyncSubscription,
};
