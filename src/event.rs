//! The opaque event payload the core addresses by id.
//!
//! Schema interpretation, replaceable-event semantics, and tag indexing
//! belong to a model registry outside this crate (see spec §1/§6). This
//! module carries just enough of the shape to dedupe, sort, and route.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// 32-byte event id, always the lowercase-hex `id` field of an event.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct EventId([u8; 32]);

impl EventId {
    pub fn new(bytes: [u8; 32]) -> Self {
        EventId(bytes)
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|e| Error::DecodeError(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::DecodeError(format!("event id has wrong length: {s}")))?;
        Ok(EventId(bytes))
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        EventId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// 32-byte hex-encoded author public key.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pubkey(String);

impl Pubkey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Pubkey {
    fn from(s: String) -> Self {
        Pubkey(s)
    }
}

/// An ordered tag list, e.g. `["e", "<event-id>", "wss://relay"]`.
pub type Tag = Vec<String>;

/// The event as addressed by the core: immutable, identified solely by `id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: Pubkey,
    pub created_at: u64,
    pub kind: u64,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Newest first by `created_at`, ties broken by ascending hex id, so a
/// flushed batch has a deterministic order (spec §4.2).
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| self.id.hex().cmp(&other.id.hex()))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Event {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(Error::Json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::Json)
    }

    /// The first value of the `d` tag, if present — the only tag this core
    /// inspects directly (spec §3: `tags[d]`), for replaceable-event callers.
    pub fn d_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("d"))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Returns the value of a single-letter tag filter, e.g. `t` for `#t`.
    pub fn tag_values<'a>(&'a self, letter: &str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(letter))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id_byte: u8, created_at: u64) -> Event {
        let mut id = [0u8; 32];
        id[31] = id_byte;
        Event {
            id: EventId::new(id),
            pubkey: Pubkey::from("f".repeat(64)),
            created_at,
            kind: 1,
            tags: vec![vec!["d".into(), "identifier".into()]],
            content: "hi".into(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn event_id_hex_roundtrip() {
        let id = EventId::from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(id.hex(), "ab".repeat(32));
    }

    #[test]
    fn event_id_rejects_wrong_length() {
        assert!(EventId::from_hex("abcd").is_err());
    }

    #[test]
    fn d_tag_reads_first_value() {
        let ev = sample(1, 100);
        assert_eq!(ev.d_tag(), Some("identifier"));
    }

    #[test]
    fn ordering_is_created_at_desc_then_id_asc() {
        let mut events = vec![sample(2, 100), sample(1, 200), sample(3, 200)];
        events.sort();
        assert_eq!(events[0].created_at, 200);
        assert_eq!(events[1].created_at, 200);
        assert_eq!(events[2].created_at, 100);
        // two events with the same created_at tie-break on id ascending
        assert!(events[0].id.hex() < events[1].id.hex());
    }

    #[test]
    fn equality_and_hash_are_id_only() {
        let a = sample(5, 1);
        let mut b = sample(5, 999);
        b.content = "different".into();
        assert_eq!(a, b);
    }
}
