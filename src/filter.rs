//! The `REQ` filter grammar of spec §6.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A single filter. Multiple filters in one `REQ` are OR-combined; the
/// fields within one filter are AND-combined. Multi-character tag filters
/// (`#bar`) are accepted and forwarded, but a relay following NIP-01 is not
/// required to index them; many relays silently drop matches on them, so
/// this crate forwards such filters without pretending to match locally.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// `#t`, `#e`, `#p`, ... keyed by the bare letter (no leading `#`).
    #[serde(flatten)]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u64>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn tag(mut self, letter: impl Into<String>, values: impl IntoIterator<Item = String>) -> Self {
        let key = format!("#{}", letter.into());
        self.tags.insert(key, values.into_iter().collect());
        self
    }

    /// A liveness-probe filter matching nothing (`limit: 0`), used by
    /// `perform_health_check(force=true)` (spec §4.4).
    pub fn probe() -> Self {
        Filter::new().limit(0)
    }

    /// Local, client-side matching against a concrete event. Relays are
    /// expected to do their own filtering server-side; this is only used
    /// by the coordinator's `since` optimisation and by test fixtures.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id.hex()) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == event.pubkey.as_str()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, values) in &self.tags {
            let Some(letter) = key.strip_prefix('#') else {
                continue;
            };
            // Multi-character tag filters are not locally indexable either;
            // preserve the same "silently matches nothing" behaviour.
            if letter.chars().count() != 1 {
                return false;
            }
            if !event.tag_values(letter).any(|v| values.iter().any(|x| x == v)) {
                return false;
            }
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.limit.is_none()
            && self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventId, Pubkey};

    fn event(kind: u64, created_at: u64, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: EventId::new([9u8; 32]),
            pubkey: Pubkey::from("a".repeat(64)),
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn matches_kind_and_since() {
        let f = Filter::new().kinds([1]).since(100);
        assert!(f.matches(&event(1, 150, vec![])));
        assert!(!f.matches(&event(1, 50, vec![])));
        assert!(!f.matches(&event(2, 150, vec![])));
    }

    #[test]
    fn matches_single_letter_tag() {
        let f = Filter::new().tag("t", ["bitcoin".to_string()]);
        let matching = event(1, 1, vec![vec!["t".into(), "bitcoin".into()]]);
        let non_matching = event(1, 1, vec![vec!["t".into(), "nostr".into()]]);
        assert!(f.matches(&matching));
        assert!(!f.matches(&non_matching));
    }

    #[test]
    fn multi_char_tag_filter_matches_nothing() {
        let f = Filter::new().tag("bar", ["x".to_string()]);
        let ev = event(1, 1, vec![vec!["bar".into(), "x".into()]]);
        assert!(!f.matches(&ev), "multi-char tag filters are not indexable");
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::new().matches(&event(7, 0, vec![])));
    }

    #[test]
    fn probe_filter_has_zero_limit() {
        assert_eq!(Filter::probe().limit, Some(0));
    }
}
