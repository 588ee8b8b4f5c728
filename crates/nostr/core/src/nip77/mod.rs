//! NIP-77: Negentropy Syncing
//!
//! This module implements the Negentropy protocol for efficient event syncing between
//! Nostr clients and relays. Negentropy uses Range-Based Set Reconciliation (RBSR) to
//! minimize bandwidth when both sides have events in common.
//!
//! Internal module boundaries:
//! - `error`: shared protocol error and result types
//! - `codec`: varint primitives and the cursor buffer used for decoding
//! - `model`: bounds, ranges, messages and the JSON envelopes
//! - `fingerprint`: order-independent range fingerprints
//! - `storage`: the sealed, sorted record set a session runs against
//! - `reconciliation`: the initiator/responder engine
//! - `tests`: codec/model/reconciliation coverage
//!
//! # Overview
//!
//! The key space is ordered by `(created_at, id)`. A message is a version byte
//! followed by ranges, each ending at an exclusive upper bound and carrying
//! either nothing (Skip), a 16-byte fingerprint, or the full id list. A range
//! whose fingerprints disagree is split into up to 16 buckets; small ranges go
//! out as id lists, at which point the initiator can read off the difference.
//!
//! # Protocol Flow
//!
//! ```text
//! Client                                  Relay
//!   |                                       |
//!   |  NEG-OPEN (filter, initial msg) ---→ |
//!   |                                       | (compute fingerprints)
//!   | ←--- NEG-MSG (ranges with fps)       |
//!   |                                       |
//!   | (compare fingerprints)                |
//!   |  NEG-MSG (refined ranges) ---------→ |
//!   |                                       |
//!   | ←--- NEG-MSG (more refined)          |
//!   |  ...continues until complete...      |
//!   |                                       |
//!   |  NEG-CLOSE ------------------------→ |
//! ```
//!
//! After sync completes, client knows:
//! - IDs it has that relay needs (upload with EVENT)
//! - IDs relay has that it needs (download with REQ)
//!
//! # Usage Example
//!
//! ```
//! use nostr::{Negentropy, NegentropyStorage, Record};
//!
//! let storage = NegentropyStorage::new(vec![
//!     Record::new(1000, [0x01; 32]),
//!     Record::new(2000, [0x02; 32]),
//! ]);
//! let mut client = Negentropy::new(storage, 50_000)?;
//! let mut relay = Negentropy::new(NegentropyStorage::default(), 50_000)?;
//!
//! let mut msg = client.initiate()?;
//! loop {
//!     let reply = relay.reconcile(&msg)?.next_message.unwrap_or_default();
//!     let out = client.reconcile(&reply)?;
//!     // out.have: ids to upload, out.need: ids to download
//!     match out.next_message {
//!         Some(next) => msg = next,
//!         None => break,
//!     }
//! }
//! ```
//!
//! # Performance Characteristics
//!
//! - **Round trips**: O(log N) for N events
//! - **Bandwidth**: O(d log N) where d is the number of differences
//! - **Best Case**: Both sides identical = 1 round trip
//! - **Frame limit**: replies are capped; unfinished work is carried as a
//!   closing fingerprint over the remainder and picked up next round
//!
//! # References
//!
//! - NIP-77: <https://github.com/nostr-protocol/nips/blob/master/77.md>
//! - Negentropy Protocol: <https://github.com/hoytech/negentropy>
//! - RBSR Paper: <https://logperiodic.com/rbsr.html>

mod codec;
mod error;
mod fingerprint;
mod model;
mod reconciliation;
mod storage;

pub use codec::{WireBuffer, decode_varint, encode_varint, write_varint};
pub use error::{Nip77Error, Result};
pub use fingerprint::{Accumulator, calculate_fingerprint, empty_fingerprint};
pub use model::{
    Bound, EventId, FINGERPRINT_SIZE, Fingerprint, ID_SIZE, NegClose, NegErr, NegMsg, NegOpen,
    NegentropyMessage, PROTOCOL_VERSION_1, Range, RangeMode, RangePayload, Record,
    TIMESTAMP_INFINITY, TimestampDelta, check_version, compare_bound, decode_hex_payload,
    sort_records,
};
pub use reconciliation::{FRAME_SIZE_LIMIT_MINIMUM, Negentropy, ReconcileOutput};
pub use storage::{BUCKET_COUNT, ID_LIST_THRESHOLD, NegentropyStorage};
