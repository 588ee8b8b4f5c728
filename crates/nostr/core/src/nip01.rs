//! NIP-01: basic event model.
//!
//! Only the JSON shape is modelled here. Signing and signature validation live
//! outside this crate; reconciliation only ever needs `(id, created_at)`.

use serde::{Deserialize, Serialize};

/// Length of a hex-encoded event id.
pub const ID_HEX_LEN: usize = 64;

/// A Nostr event as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte lowercase hex event id
    pub id: String,
    /// 32-byte lowercase hex public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Tags
    pub tags: Vec<Vec<String>>,
    /// Arbitrary content
    pub content: String,
    /// Schnorr signature
    pub sig: String,
}

impl Event {
    /// Values of every tag whose name matches `name` (first element of the tag).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().is_some_and(|tag_name| tag_name == name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Whether the id is a well-formed 64-character hex string.
    pub fn has_valid_id(&self) -> bool {
        self.id.len() == ID_HEX_LEN && self.id.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: "ab".repeat(32),
            pubkey: "cd".repeat(32),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![
                vec!["e".to_string(), "root-id".to_string()],
                vec!["p".to_string(), "someone".to_string()],
                vec!["e".to_string(), "reply-id".to_string(), "wss://relay".to_string()],
                vec![],
            ],
            content: "hello".to_string(),
            sig: "00".repeat(64),
        }
    }

    #[test]
    fn test_tag_values() {
        let event = sample_event();
        let values: Vec<&str> = event.tag_values("e").collect();
        assert_eq!(values, vec!["root-id", "reply-id"]);
        assert_eq!(event.tag_values("t").count(), 0);
    }

    #[test]
    fn test_valid_id() {
        let mut event = sample_event();
        assert!(event.has_valid_id());
        event.id = "not-hex".to_string();
        assert!(!event.has_valid_id());
    }

    #[test]
    fn test_json_roundtrip() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
