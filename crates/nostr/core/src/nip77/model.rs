use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec::{WireBuffer, write_varint};
use super::error::{Nip77Error, Result};
use crate::nip01::{Event, ID_HEX_LEN};

/// Negentropy Protocol Version 1
pub const PROTOCOL_VERSION_1: u8 = 0x61;

/// Special infinity timestamp value
pub const TIMESTAMP_INFINITY: u64 = u64::MAX;

/// Size of an event id in bytes
pub const ID_SIZE: usize = 32;

/// Size of a range fingerprint in bytes
pub const FINGERPRINT_SIZE: usize = 16;

/// A 256-bit event ID
pub type EventId = [u8; ID_SIZE];

/// A 128-bit range fingerprint
pub type Fingerprint = [u8; FINGERPRINT_SIZE];

/// Running timestamp state for delta-encoded bounds.
///
/// Each message direction starts at zero. Infinity is written as `0`; any other
/// timestamp as `1 + (timestamp - previous)`. Once infinity has been seen every
/// following bound in the same message decodes as infinity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampDelta {
    last: u64,
}

impl TimestampDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, timestamp: u64) -> u64 {
        if timestamp == TIMESTAMP_INFINITY {
            self.last = TIMESTAMP_INFINITY;
            return 0;
        }
        let delta = timestamp.saturating_sub(self.last);
        self.last = timestamp;
        delta + 1
    }

    pub fn decode(&mut self, raw: u64) -> Result<u64> {
        if raw == 0 || self.last == TIMESTAMP_INFINITY {
            self.last = TIMESTAMP_INFINITY;
            return Ok(TIMESTAMP_INFINITY);
        }
        let timestamp = self
            .last
            .checked_add(raw - 1)
            .filter(|ts| *ts != TIMESTAMP_INFINITY)
            .ok_or_else(|| Nip77Error::InvalidBound("timestamp delta overflows".to_string()))?;
        self.last = timestamp;
        Ok(timestamp)
    }
}

/// A timestamp and ID prefix bound for ranges
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Bound {
    /// The timestamp (u64::MAX for infinity)
    pub timestamp: u64,
    /// The ID prefix (0-32 bytes)
    pub id_prefix: Vec<u8>,
}

impl Bound {
    /// Create a new bound
    pub fn new(timestamp: u64, id_prefix: Vec<u8>) -> Result<Self> {
        if id_prefix.len() > ID_SIZE {
            return Err(Nip77Error::InvalidBound(format!(
                "ID prefix too long: {} bytes (max 32)",
                id_prefix.len()
            )));
        }
        Ok(Self {
            timestamp,
            id_prefix,
        })
    }

    /// Create a bound at timestamp 0 with empty ID
    pub fn zero() -> Self {
        Self::default()
    }

    /// Create an infinity bound
    pub fn infinity() -> Self {
        Self {
            timestamp: TIMESTAMP_INFINITY,
            id_prefix: vec![],
        }
    }

    /// A bound that sorts exactly at `record`.
    pub fn from_record(record: &Record) -> Self {
        Self {
            timestamp: record.timestamp,
            id_prefix: record.id.to_vec(),
        }
    }

    pub fn is_infinity(&self) -> bool {
        self.timestamp == TIMESTAMP_INFINITY
    }

    /// Shortest bound `b` with `prev < b <= curr`.
    ///
    /// Different timestamps need no id bytes at all. Equal timestamps take the
    /// shared id prefix plus the first differing byte of `curr`.
    pub fn minimal(prev: &Record, curr: &Record) -> Self {
        if curr.timestamp != prev.timestamp {
            return Self {
                timestamp: curr.timestamp,
                id_prefix: vec![],
            };
        }

        let shared = prev
            .id
            .iter()
            .zip(curr.id.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let len = (shared + 1).min(ID_SIZE);

        Self {
            timestamp: curr.timestamp,
            id_prefix: curr.id[..len].to_vec(),
        }
    }

    /// Append the wire form of this bound to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>, delta: &mut TimestampDelta) {
        write_varint(out, delta.encode(self.timestamp));
        write_varint(out, self.id_prefix.len() as u64);
        out.extend_from_slice(&self.id_prefix);
    }

    /// Read one bound from the front of `buf`.
    pub fn decode_from(buf: &mut WireBuffer, delta: &mut TimestampDelta) -> Result<Self> {
        let timestamp = delta.decode(buf.shift_varint()?)?;

        let prefix_len = buf.shift_varint()?;
        if prefix_len > ID_SIZE as u64 {
            return Err(Nip77Error::InvalidBound(format!(
                "ID prefix length too long: {prefix_len}"
            )));
        }

        let id_prefix = buf.shift_n(prefix_len as usize)?.to_vec();
        Ok(Self {
            timestamp,
            id_prefix,
        })
    }
}

/// Order bounds by timestamp, then by id prefix bytes with a shorter prefix
/// sorting before any longer prefix it begins.
pub fn compare_bound(a: &Bound, b: &Bound) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.id_prefix.as_slice().cmp(b.id_prefix.as_slice()))
}

impl Ord for Bound {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_bound(self, other)
    }
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Range mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    /// Skip this range (mode 0)
    Skip,
    /// Fingerprint mode (mode 1)
    Fingerprint,
    /// ID list mode (mode 2)
    IdList,
}

impl RangeMode {
    fn from_u64(value: u64) -> Result<Self> {
        match value {
            0 => Ok(Self::Skip),
            1 => Ok(Self::Fingerprint),
            2 => Ok(Self::IdList),
            _ => Err(Nip77Error::InvalidMode(value)),
        }
    }

    fn as_u64(self) -> u64 {
        match self {
            Self::Skip => 0,
            Self::Fingerprint => 1,
            Self::IdList => 2,
        }
    }
}

/// Range payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePayload {
    /// No payload for skip mode
    Skip,
    /// 16-byte fingerprint
    Fingerprint(Fingerprint),
    /// List of event IDs
    IdList(Vec<EventId>),
}

impl RangePayload {
    pub fn mode(&self) -> RangeMode {
        match self {
            Self::Skip => RangeMode::Skip,
            Self::Fingerprint(_) => RangeMode::Fingerprint,
            Self::IdList(_) => RangeMode::IdList,
        }
    }
}

/// A range in the Negentropy protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    /// Exclusive upper bound of this range
    pub upper_bound: Bound,
    /// The mode and payload
    pub payload: RangePayload,
}

impl Range {
    pub fn new(upper_bound: Bound, payload: RangePayload) -> Self {
        Self {
            upper_bound,
            payload,
        }
    }

    pub fn skip(upper_bound: Bound) -> Self {
        Self::new(upper_bound, RangePayload::Skip)
    }

    pub fn fingerprint(upper_bound: Bound, fingerprint: Fingerprint) -> Self {
        Self::new(upper_bound, RangePayload::Fingerprint(fingerprint))
    }

    pub fn id_list(upper_bound: Bound, ids: Vec<EventId>) -> Self {
        Self::new(upper_bound, RangePayload::IdList(ids))
    }

    /// Append the wire form of this range to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>, delta: &mut TimestampDelta) {
        self.upper_bound.encode_into(out, delta);
        write_varint(out, self.payload.mode().as_u64());

        match &self.payload {
            RangePayload::Skip => {}
            RangePayload::Fingerprint(fp) => out.extend_from_slice(fp),
            RangePayload::IdList(ids) => {
                write_varint(out, ids.len() as u64);
                for id in ids {
                    out.extend_from_slice(id);
                }
            }
        }
    }

    /// Read one range from the front of `buf`.
    ///
    /// A bound with nothing after it is read as a trailing Skip.
    pub fn decode_from(buf: &mut WireBuffer, delta: &mut TimestampDelta) -> Result<Self> {
        let upper_bound = Bound::decode_from(buf, delta)?;

        let mode = if buf.is_empty() {
            RangeMode::Skip
        } else {
            RangeMode::from_u64(buf.shift_varint()?)?
        };

        let payload = match mode {
            RangeMode::Skip => RangePayload::Skip,
            RangeMode::Fingerprint => RangePayload::Fingerprint(buf.shift_array()?),
            RangeMode::IdList => {
                let count = buf.shift_varint()?;
                // Reject impossible counts before allocating.
                let available = (buf.len() / ID_SIZE) as u64;
                if count > available {
                    return Err(Nip77Error::InvalidRange(format!(
                        "id list claims {count} ids, only {available} fit in the message"
                    )));
                }

                let mut ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    ids.push(buf.shift_array::<ID_SIZE>()?);
                }
                RangePayload::IdList(ids)
            }
        };

        Ok(Self {
            upper_bound,
            payload,
        })
    }
}

/// A Negentropy protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegentropyMessage {
    /// Protocol version (0x61 for V1)
    pub version: u8,
    /// Ordered list of ranges
    pub ranges: Vec<Range>,
}

impl NegentropyMessage {
    /// Create a new message with protocol version 1
    pub fn new(ranges: Vec<Range>) -> Self {
        Self {
            version: PROTOCOL_VERSION_1,
            ranges,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.version];
        let mut delta = TimestampDelta::new();
        for range in &self.ranges {
            range.encode_into(&mut bytes, &mut delta);
        }
        bytes
    }

    /// Encode message to hex string
    pub fn encode_hex(&self) -> String {
        hex::encode(self.encode())
    }

    /// Decode message from bytes
    ///
    /// Fails on any version other than V1, on malformed or truncated ranges,
    /// and on bounds that go backwards.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = WireBuffer::from(data);

        let version = buf
            .shift()
            .map_err(|_| Nip77Error::InvalidProtocolVersion(0))?;
        check_version(version)?;

        let mut ranges: Vec<Range> = Vec::new();
        let mut delta = TimestampDelta::new();

        while !buf.is_empty() {
            let range = Range::decode_from(&mut buf, &mut delta)?;
            if ranges
                .last()
                .is_some_and(|prev| range.upper_bound < prev.upper_bound)
            {
                return Err(Nip77Error::InvalidRange(format!(
                    "bounds out of order at range {}",
                    ranges.len()
                )));
            }
            ranges.push(range);
        }

        Ok(Self { version, ranges })
    }

    /// Decode message from hex string
    pub fn decode_hex(hex_str: &str) -> Result<Self> {
        Self::decode(&decode_hex_payload(hex_str)?)
    }
}

/// Validate a leading protocol byte.
///
/// Bytes outside `0x60..=0x6f` are not negentropy at all; other bytes inside
/// the window are a version we do not speak.
pub fn check_version(version: u8) -> Result<()> {
    if !(0x60..=0x6f).contains(&version) {
        return Err(Nip77Error::InvalidProtocolVersion(version));
    }
    if version != PROTOCOL_VERSION_1 {
        return Err(Nip77Error::UnsupportedProtocolVersion(version));
    }
    Ok(())
}

/// Decode the hex payload carried by NEG-OPEN / NEG-MSG.
pub fn decode_hex_payload(hex_str: &str) -> Result<Vec<u8>> {
    hex::decode(hex_str).map_err(|e| Nip77Error::InvalidHex(e.to_string()))
}

fn envelope<'a>(value: &'a Value, label: &str, expected_len: usize) -> Result<&'a [Value]> {
    let arr = value
        .as_array()
        .ok_or_else(|| Nip77Error::InvalidEnvelope("not an array".to_string()))?;

    if arr.len() != expected_len {
        return Err(Nip77Error::InvalidEnvelope(format!(
            "expected {expected_len} elements, got {}",
            arr.len()
        )));
    }

    match arr.first().and_then(Value::as_str) {
        Some(msg_type) if msg_type == label => Ok(arr),
        Some(msg_type) => Err(Nip77Error::InvalidEnvelope(format!(
            "expected {label}, got {msg_type}"
        ))),
        None => Err(Nip77Error::InvalidEnvelope(
            "message type not a string".to_string(),
        )),
    }
}

fn string_field(arr: &[Value], index: usize, name: &str) -> Result<String> {
    arr.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Nip77Error::InvalidEnvelope(format!("{name} not a string")))
}

/// Nostr NEG-OPEN message (client to relay)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegOpen {
    pub subscription_id: String,
    /// Filter (as JSON value for flexibility)
    pub filter: Value,
    /// Initial Negentropy message (hex-encoded)
    pub initial_message: String,
}

impl NegOpen {
    pub fn new(subscription_id: String, filter: Value, message: &[u8]) -> Self {
        Self {
            subscription_id,
            filter,
            initial_message: hex::encode(message),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!([
            "NEG-OPEN",
            self.subscription_id,
            self.filter,
            self.initial_message
        ])
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let arr = envelope(value, "NEG-OPEN", 4)?;
        Ok(Self {
            subscription_id: string_field(arr, 1, "subscription ID")?,
            filter: arr[2].clone(),
            initial_message: string_field(arr, 3, "initial message")?,
        })
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        decode_hex_payload(&self.initial_message)
    }
}

/// Nostr NEG-MSG message (bidirectional)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegMsg {
    pub subscription_id: String,
    /// Negentropy message (hex-encoded)
    pub message: String,
}

impl NegMsg {
    pub fn new(subscription_id: String, message: &[u8]) -> Self {
        Self {
            subscription_id,
            message: hex::encode(message),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!(["NEG-MSG", self.subscription_id, self.message])
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let arr = envelope(value, "NEG-MSG", 3)?;
        Ok(Self {
            subscription_id: string_field(arr, 1, "subscription ID")?,
            message: string_field(arr, 2, "message")?,
        })
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        decode_hex_payload(&self.message)
    }
}

/// Nostr NEG-ERR message (relay to client)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegErr {
    pub subscription_id: String,
    /// Error reason, conventionally `prefix: detail`
    pub reason: String,
}

impl NegErr {
    pub fn new(subscription_id: String, reason: String) -> Self {
        Self {
            subscription_id,
            reason,
        }
    }

    pub fn blocked(subscription_id: String, message: &str) -> Self {
        Self::new(subscription_id, format!("blocked: {message}"))
    }

    pub fn closed(subscription_id: String, message: &str) -> Self {
        Self::new(subscription_id, format!("closed: {message}"))
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!(["NEG-ERR", self.subscription_id, self.reason])
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let arr = envelope(value, "NEG-ERR", 3)?;
        Ok(Self {
            subscription_id: string_field(arr, 1, "subscription ID")?,
            reason: string_field(arr, 2, "reason")?,
        })
    }
}

/// Nostr NEG-CLOSE message (client to relay)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegClose {
    pub subscription_id: String,
}

impl NegClose {
    pub fn new(subscription_id: String) -> Self {
        Self { subscription_id }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!(["NEG-CLOSE", self.subscription_id])
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let arr = envelope(value, "NEG-CLOSE", 2)?;
        Ok(Self {
            subscription_id: string_field(arr, 1, "subscription ID")?,
        })
    }
}

/// A record in the Negentropy protocol (timestamp + ID)
///
/// The derived ordering (timestamp, then id bytes) is the protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Record {
    /// Timestamp (used for sorting)
    pub timestamp: u64,
    /// Event ID
    pub id: EventId,
}

impl Record {
    pub fn new(timestamp: u64, id: EventId) -> Self {
        Self { timestamp, id }
    }

    /// Build a record from an event's `created_at` and hex id.
    pub fn from_event(event: &Event) -> Result<Self> {
        if event.id.len() != ID_HEX_LEN {
            return Err(Nip77Error::InvalidIdLength(event.id.len() / 2));
        }
        let mut id = [0u8; ID_SIZE];
        hex::decode_to_slice(&event.id, &mut id)
            .map_err(|e| Nip77Error::InvalidHex(e.to_string()))?;
        Ok(Self::new(event.created_at, id))
    }

    /// Position of this record relative to `bound`.
    pub fn cmp_bound(&self, bound: &Bound) -> Ordering {
        self.timestamp
            .cmp(&bound.timestamp)
            .then_with(|| self.id.as_slice().cmp(bound.id_prefix.as_slice()))
    }
}

/// Sort records according to Negentropy protocol rules
///
/// Records are sorted by timestamp, then by id bytes.
pub fn sort_records(records: &mut [Record]) {
    records.sort_unstable();
}
