//! `PoolState`/`PoolStateNotifier` (spec §4.5/§3, component C5): immutable
//! observability snapshots, throttled emission, a bounded log ring.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::relay_url::RelayUrl;
use crate::subid::SubscriptionId;

/// Per-relay view of one subscription, distinct from the agent's own
/// connection-phase vocabulary (spec §3 `SubscriptionSnapshot`): this is
/// what an observer cares about, not how the socket got there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayViewPhase {
    Disconnected,
    Connecting,
    /// Connected, waiting for this relay's EOSE on this subscription.
    Loading,
    /// Live; backlog (if any) has been delivered.
    Streaming,
    /// Reconnecting; the subscription will be resent once connected.
    Waiting,
    Closed,
}

#[derive(Debug, Clone)]
pub struct RelayDiagnostic {
    pub phase: RelayViewPhase,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub relays: HashMap<RelayUrl, RelayDiagnostic>,
    pub event_count: u64,
    pub started_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ClosedSnapshot {
    pub closed_at: Instant,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: Instant,
    pub subscription_id: Option<SubscriptionId>,
    pub message: String,
}

/// An immutable point-in-time view of the whole pool. Snapshots are
/// monotonically ordered by `timestamp` (spec §8 invariant 5).
#[derive(Debug, Clone)]
pub struct PoolState {
    pub subscriptions: HashMap<SubscriptionId, SubscriptionSnapshot>,
    pub closed_subscriptions: HashMap<SubscriptionId, ClosedSnapshot>,
    pub logs: Vec<LogEntry>,
    pub timestamp: Instant,
}

struct LogRing {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl LogRing {
    fn new(capacity: usize) -> Self {
        LogRing {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

/// Builds [`PoolState`] snapshots from coordinator-supplied data and
/// throttles their delivery to observers (spec §4.5).
pub struct PoolStateNotifier {
    throttle_duration: Duration,
    last_emit: Option<Instant>,
    pending: Option<PoolState>,
    logs: LogRing,
    observers: Vec<Box<dyn FnMut(&PoolState) + Send>>,
}

impl PoolStateNotifier {
    pub fn new(throttle_duration: Duration, log_capacity: usize) -> Self {
        PoolStateNotifier {
            throttle_duration,
            last_emit: None,
            pending: None,
            logs: LogRing::new(log_capacity),
            observers: Vec::new(),
        }
    }

    pub fn observe(&mut self, callback: impl FnMut(&PoolState) + Send + 'static) {
        self.observers.push(Box::new(callback));
    }

    pub fn log(&mut self, subscription_id: Option<SubscriptionId>, message: impl Into<String>) {
        self.logs.push(LogEntry {
            at: Instant::now(),
            subscription_id,
            message: message.into(),
        });
    }

    fn emit(&mut self, state: PoolState) {
        self.last_emit = Some(state.timestamp);
        for observer in &mut self.observers {
            observer(&state);
        }
    }

    /// Called on every mutation with a freshly built snapshot. Either emits
    /// immediately or stashes it, coalescing with any already-stashed
    /// snapshot (spec §4.5 throttling rule).
    pub fn notify(&mut self, mut state: PoolState) {
        state.logs = self.logs.entries.iter().cloned().collect();

        if self.throttle_duration.is_zero() {
            self.emit(state);
            return;
        }

        let due = self
            .last_emit
            .map_or(true, |last| state.timestamp.duration_since(last) >= self.throttle_duration);

        if due {
            self.emit(state);
        } else {
            self.pending = Some(state);
        }
    }

    /// Soonest instant the coordinator's event loop should wake up to flush
    /// a stashed snapshot.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.last_emit
            .filter(|_| self.pending.is_some())
            .map(|last| last + self.throttle_duration)
    }

    /// Flushes a stashed snapshot if its coalescing window has elapsed.
    pub fn poll_timer(&mut self, now: Instant) {
        if let Some(deadline) = self.next_deadline() {
            if now >= deadline {
                if let Some(state) = self.pending.take() {
                    self.emit(state);
                }
            }
        }
    }
}
