//! `SubscriptionBuffer` (spec §4.2, component C2): per-subscription
//! deduplication and batching. Owned exclusively by the coordinator; all
//! mutating methods are plain calls from the single event loop, so no
//! locking is needed — mirrored from how `enostr`'s `RelayPool` keeps its
//! subscription bookkeeping as plain fields mutated from one place.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tokio::sync::oneshot;

use crate::event::{Event, EventId};
use crate::filter::Filter;
use crate::relay_url::RelayUrl;
use crate::subid::SubscriptionId;

/// A batch ready for delivery: the deduplicated, sorted event list plus
/// which relays supplied each one (spec §4.2 tie-break/contract).
pub struct FlushOutcome {
    pub events: Vec<Event>,
    pub relays_for_id: HashMap<EventId, Vec<RelayUrl>>,
}

pub struct SubscriptionBuffer {
    pub id: SubscriptionId,
    pub filters: Vec<Filter>,
    pub target_relays: HashSet<RelayUrl>,
    pub streaming: bool,
    pub event_filter: Option<Box<dyn Fn(&Event) -> bool + Send>>,

    delivered_ids: HashSet<EventId>,
    pending: HashMap<EventId, Event>,
    relays_for_id: HashMap<EventId, HashSet<RelayUrl>>,
    eose_received: HashSet<RelayUrl>,
    max_seen_created_at: Option<u64>,

    batch_window: Duration,
    batch_deadline: Option<Instant>,
    eose_timer: Option<Instant>,

    query_waiter: Option<oneshot::Sender<Vec<Event>>>,
    pub started_at: Instant,
    pub event_count: u64,
    disposed: bool,
}

impl SubscriptionBuffer {
    pub fn new(
        id: SubscriptionId,
        filters: Vec<Filter>,
        target_relays: HashSet<RelayUrl>,
        streaming: bool,
        event_filter: Option<Box<dyn Fn(&Event) -> bool + Send>>,
        batch_window: Duration,
        response_timeout: Duration,
        query_waiter: Option<oneshot::Sender<Vec<Event>>>,
    ) -> Self {
        let now = Instant::now();
        let eose_timer = if streaming {
            None
        } else {
            Some(now + response_timeout)
        };
        SubscriptionBuffer {
            id,
            filters,
            target_relays,
            streaming,
            event_filter,
            delivered_ids: HashSet::new(),
            pending: HashMap::new(),
            relays_for_id: HashMap::new(),
            eose_received: HashSet::new(),
            max_seen_created_at: None,
            batch_window,
            batch_deadline: None,
            eose_timer,
            query_waiter,
            started_at: now,
            event_count: 0,
            disposed: false,
        }
    }

    /// A blocking query over an empty relay set resolves immediately with
    /// `∅` (spec §4.2 edge policy / §8 boundary case).
    pub fn all_eose_vacuously_satisfied(&self) -> bool {
        self.target_relays.is_empty()
    }

    fn all_eose_received(&self) -> bool {
        self.target_relays.iter().all(|r| self.eose_received.contains(r))
    }

    pub fn add_event(&mut self, relay_url: RelayUrl, event: Event) {
        if let Some(filter) = &self.event_filter {
            if !filter(&event) {
                return;
            }
        }

        self.relays_for_id
            .entry(event.id)
            .or_default()
            .insert(relay_url);
        self.max_seen_created_at = Some(
            self.max_seen_created_at
                .map_or(event.created_at, |max| max.max(event.created_at)),
        );

        if self.delivered_ids.contains(&event.id) || self.pending.contains_key(&event.id) {
            return;
        }

        self.event_count += 1;
        self.pending.insert(event.id, event);

        if self.streaming && self.batch_deadline.is_none() {
            self.batch_deadline = Some(Instant::now() + self.batch_window);
        }
    }

    /// Returns `Some` if the EOSE just completed the set, signalling the
    /// caller to flush immediately (historical-backlog flush, or the
    /// completion of a blocking query).
    pub fn mark_eose(&mut self, relay_url: RelayUrl) -> bool {
        self.eose_received.insert(relay_url);
        self.all_eose_received()
    }

    pub fn remove_target_relay(&mut self, relay_url: &RelayUrl) {
        self.target_relays.remove(relay_url);
    }

    pub fn is_fully_closed(&self) -> bool {
        self.target_relays.is_empty()
    }

    /// Soonest instant the coordinator's event loop needs to wake up for
    /// this buffer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.batch_deadline, self.eose_timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// This subscription's filters with `since` clamped to one past the
    /// newest `created_at` seen on it so far, for re-`REQ`ing on reconnect
    /// (spec §4.4: resend `since = max(created_at received so far)`).
    pub fn resync_filters(&self) -> Vec<Filter> {
        let Some(max_seen) = self.max_seen_created_at else {
            return self.filters.clone();
        };
        let candidate = max_seen + 1;
        self.filters
            .iter()
            .cloned()
            .map(|mut f| {
                if f.since.map_or(true, |since| candidate > since) {
                    f.since = Some(candidate);
                }
                f
            })
            .collect()
    }

    /// Called by the coordinator's timer tick; flushes if the batch window
    /// or the EOSE deadline has elapsed.
    pub fn due_for_timeout_flush(&self, now: Instant) -> bool {
        self.batch_deadline.is_some_and(|d| now >= d)
            || self.eose_timer.is_some_and(|d| now >= d)
    }

    /// Drains the pending batch, marks those ids delivered, and resets the
    /// batch window. In blocking mode also completes (and consumes) the
    /// query waiter; the caller is responsible for disposing the buffer
    /// afterwards in that case.
    pub fn flush(&mut self) -> FlushOutcome {
        let mut events: Vec<Event> = self.pending.drain().map(|(_, e)| e).collect();
        events.sort();
        for event in &events {
            self.delivered_ids.insert(event.id);
        }
        let relays_for_id = events
            .iter()
            .map(|e| {
                let relays = self
                    .relays_for_id
                    .get(&e.id)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                (e.id, relays)
            })
            .collect();

        self.batch_deadline = None;
        self.eose_timer = None;

        if let Some(waiter) = self.query_waiter.take() {
            let _ = waiter.send(events.clone());
        }

        FlushOutcome { events, relays_for_id }
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.batch_deadline = None;
        self.eose_timer = None;
        if let Some(waiter) = self.query_waiter.take() {
            let _ = waiter.send(Vec::new());
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id_byte: u8, created_at: u64) -> Event {
        use crate::event::Pubkey;
        let mut id = [0u8; 32];
        id[31] = id_byte;
        Event {
            id: EventId::new(id),
            pubkey: Pubkey::from("a".repeat(64)),
            created_at,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    fn relay(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    #[test]
    fn dedups_same_event_across_relays() {
        let mut buf = SubscriptionBuffer::new(
            SubscriptionId::new("s1"),
            vec![],
            HashSet::from([relay("wss://r1.example.com"), relay("wss://r2.example.com")]),
            false,
            None,
            Duration::from_millis(100),
            Duration::from_secs(5),
            None,
        );
        buf.add_event(relay("wss://r1.example.com"), event(1, 100));
        buf.add_event(relay("wss://r2.example.com"), event(1, 100));
        assert_eq!(buf.event_count, 1);
        let outcome = buf.flush();
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.relays_for_id[&outcome.events[0].id].len(), 2);
    }

    #[test]
    fn flushed_events_are_not_redelivered() {
        let mut buf = SubscriptionBuffer::new(
            SubscriptionId::new("s1"),
            vec![],
            HashSet::new(),
            true,
            None,
            Duration::from_millis(100),
            Duration::from_secs(5),
            None,
        );
        buf.add_event(relay("wss://r1.example.com"), event(1, 100));
        buf.flush();
        buf.add_event(relay("wss://r1.example.com"), event(1, 100));
        assert_eq!(buf.event_count, 1);
        assert!(buf.flush().events.is_empty());
    }

    #[test]
    fn empty_target_relays_is_vacuously_complete() {
        let buf = SubscriptionBuffer::new(
            SubscriptionId::new("s1"),
            vec![],
            HashSet::new(),
            false,
            None,
            Duration::from_millis(100),
            Duration::from_secs(5),
            None,
        );
        assert!(buf.all_eose_vacuously_satisfied());
        assert!(buf.all_eose_received());
    }

    #[test]
    fn mark_eose_reports_completion_only_once_all_relays_in() {
        let mut buf = SubscriptionBuffer::new(
            SubscriptionId::new("s1"),
            vec![],
            HashSet::from([relay("wss://r1.example.com"), relay("wss://r2.example.com")]),
            false,
            None,
            Duration::from_millis(100),
            Duration::from_secs(5),
            None,
        );
        assert!(!buf.mark_eose(relay("wss://r1.example.com")));
        assert!(buf.mark_eose(relay("wss://r2.example.com")));
    }

    #[test]
    fn resync_filters_clamps_since_past_the_newest_seen_event() {
        let mut buf = SubscriptionBuffer::new(
            SubscriptionId::new("s1"),
            vec![Filter::new().kinds([1])],
            HashSet::from([relay("wss://r1.example.com")]),
            true,
            None,
            Duration::from_millis(100),
            Duration::from_secs(5),
            None,
        );
        assert_eq!(buf.resync_filters()[0].since, None);
        buf.add_event(relay("wss://r1.example.com"), event(1, 100));
        buf.add_event(relay("wss://r1.example.com"), event(2, 50));
        assert_eq!(buf.resync_filters()[0].since, Some(101));
    }

    #[test]
    fn dispose_resolves_pending_waiter_with_empty() {
        let (tx, rx) = oneshot::channel();
        let mut buf = SubscriptionBuffer::new(
            SubscriptionId::new("s1"),
            vec![],
            HashSet::new(),
            false,
            None,
            Duration::from_millis(100),
            Duration::from_secs(5),
            Some(tx),
        );
        buf.dispose();
        assert_eq!(rx.try_recv().unwrap(), Vec::new());
    }
}
