//! External collaborator interfaces (spec §6). These are deliberately thin:
//! the core depends on them only through the trait object, never on a
//! concrete store/verifier/registry implementation.

use hashbrown::HashSet;

use crate::event::{Event, EventId};
use crate::filter::Filter;

/// Cache/hydration boundary. The core never depends on persistence
/// guarantees here — only on the ids actually saved and on query results
/// used for the `since` optimisation (spec §4.4).
pub trait EventStore: Send + Sync {
    fn save(&self, events: &[Event]) -> HashSet<EventId>;
    fn query(&self, filter: &Filter) -> Vec<Event>;
}

/// Signature verification boundary. A failing event is silently dropped
/// from the flush, never surfaced as an error (spec §7).
pub trait Verifier: Send + Sync {
    fn verify(&self, event: &Event) -> bool;
}

/// Opaque decoding boundary for higher-level `kind` interpretation. The
/// core never inspects the decoded form; this exists purely so a caller can
/// be handed one through [`crate::PoolContext`] without the core needing to
/// know its shape.
pub trait ModelRegistry: Send + Sync {}

/// An `EventStore` that persists nothing and answers every query with `∅`.
/// Useful when a caller has no cache layer to wire in.
#[derive(Default)]
pub struct NullEventStore;

impl EventStore for NullEventStore {
    fn save(&self, _events: &[Event]) -> HashSet<EventId> {
        HashSet::new()
    }

    fn query(&self, _filter: &Filter) -> Vec<Event> {
        Vec::new()
    }
}

/// A `Verifier` that accepts everything. Combine with
/// [`crate::PoolConfig::skip_verification`] rather than wiring this in by
/// default, so callers notice they've opted out of verification.
#[derive(Default)]
pub struct AlwaysVerify;

impl Verifier for AlwaysVerify {
    fn verify(&self, _event: &Event) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_store_saves_nothing_and_queries_empty() {
        let store = NullEventStore;
        assert!(store.save(&[]).is_empty());
        assert!(store.query(&Filter::new()).is_empty());
    }

    #[test]
    fn always_verify_accepts_everything() {
        use crate::event::Pubkey;
        let verifier = AlwaysVerify;
        let event = Event {
            id: EventId::new([0u8; 32]),
            pubkey: Pubkey::from("a".repeat(64)),
            created_at: 0,
            kind: 0,
            tags: vec![],
            content: String::new(),
            sig: "0".repeat(128),
        };
        assert!(verifier.verify(&event));
    }
}
