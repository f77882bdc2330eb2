//! `PublishTracker` (spec §4.3, component C3): aggregates `OK` outcomes for
//! one `publish()` call spanning N events × M relays into a single
//! `PublishResponse`.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tokio::sync::oneshot;

use crate::event::{Event, EventId};
use crate::relay_url::RelayUrl;

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub accepted: bool,
    pub message: Option<String>,
}

/// `results[event_id]` is a list with exactly one entry per target relay
/// (spec §8 invariant 4), in no particular order.
#[derive(Debug, Clone, Default)]
pub struct PublishResponse {
    pub results: HashMap<EventId, Vec<(RelayUrl, PublishOutcome)>>,
}

pub struct PublishTracker {
    pub events: Vec<Event>,
    pub target_relays: Vec<RelayUrl>,
    outcomes: HashMap<EventId, HashMap<RelayUrl, PublishOutcome>>,
    pub deadline: Instant,
    waiter: Option<oneshot::Sender<PublishResponse>>,
    resolved: bool,
}

impl PublishTracker {
    pub fn new(
        events: Vec<Event>,
        target_relays: Vec<RelayUrl>,
        publish_timeout: Duration,
        waiter: oneshot::Sender<PublishResponse>,
    ) -> Self {
        PublishTracker {
            events,
            target_relays,
            outcomes: HashMap::new(),
            deadline: Instant::now() + publish_timeout,
            waiter: Some(waiter),
            resolved: false,
        }
    }

    /// A relay that could never be reached contributes a failed outcome up
    /// front rather than waiting out the timeout (spec §4.3).
    pub fn mark_unreachable(&mut self, relay_url: RelayUrl, reason: String) {
        for event in self.events.clone() {
            self.outcomes
                .entry(event.id)
                .or_default()
                .insert(relay_url.clone(), PublishOutcome {
                    accepted: false,
                    message: Some(reason.clone()),
                });
        }
    }

    /// Late `OK`s after resolution are ignored (spec §4.3: "resolves exactly
    /// once").
    pub fn record_ok(&mut self, relay_url: RelayUrl, event_id: EventId, accepted: bool, message: String) {
        if self.resolved {
            return;
        }
        self.outcomes.entry(event_id).or_default().insert(
            relay_url,
            PublishOutcome {
                accepted,
                message: if message.is_empty() { None } else { Some(message) },
            },
        );
    }

    fn is_complete(&self) -> bool {
        self.events.iter().all(|e| {
            self.outcomes
                .get(&e.id)
                .is_some_and(|by_relay| self.target_relays.iter().all(|r| by_relay.contains_key(r)))
        })
    }

    /// Resolves immediately if every `(event, relay)` pair has an outcome;
    /// called after every `record_ok`/`mark_unreachable`.
    pub fn try_resolve(&mut self) -> bool {
        if !self.resolved && self.is_complete() {
            self.resolve();
            true
        } else {
            self.resolved
        }
    }

    /// Forces resolution (deadline reached or `dispose()`), filling any
    /// still-missing `(event, relay)` pairs with a fallback outcome. `message_for`
    /// lets the caller distinguish a relay that never connected ("Connection
    /// failed: ...") from one that connected but never acknowledged ("Timeout").
    pub fn resolve_with_timeouts(&mut self, mut message_for: impl FnMut(&RelayUrl) -> String) {
        if self.resolved {
            return;
        }
        for event in self.events.clone() {
            for relay in self.target_relays.clone() {
                let message = message_for(&relay);
                self.outcomes
                    .entry(event.id)
                    .or_default()
                    .entry(relay)
                    .or_insert(PublishOutcome {
                        accepted: false,
                        message: Some(message),
                    });
            }
        }
        self.resolve();
    }

    fn resolve(&mut self) {
        self.resolved = true;
        let results = self
            .outcomes
            .iter()
            .map(|(id, by_relay)| {
                (
                    *id,
                    by_relay
                        .iter()
                        .map(|(r, o)| (r.clone(), o.clone()))
                        .collect(),
                )
            })
            .collect();
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(PublishResponse { results });
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }
}
