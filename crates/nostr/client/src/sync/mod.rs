//! NIP-77 sync on top of the relay transport.
//!
//! - `transport`: what sync needs from a relay ([`SyncRelay`])
//! - `session`: one initiator-side negentropy exchange with one relay
//! - `capability`: cached per-relay support verdicts
//! - `orchestrator`: concurrent multi-relay [`NegentropySync::sync`]
//! - `subscribe`: live subscription plus background backfill
//! - `config`: defaults and environment overrides

pub mod capability;
pub mod config;
pub mod orchestrator;
pub mod session;
pub mod subscribe;
pub mod transport;

pub use capability::{
    CAPABILITY_NAMESPACE, CapabilityCache, DEFAULT_CAPABILITY_TTL, RelayCapability,
};
pub use config::{ConfigError, SyncConfig};
pub use orchestrator::{
    NegentropySync, RelayErrorCallback, RelayOutcome, RelayReport, SyncOptions, SyncResult,
};
pub use session::{SessionOutcome, SessionState, SessionStats, SyncSession};
pub use subscribe::{SubscribeOptions, SyncSubscription};
pub use transport::SyncRelay;
