//! `RelayAgent` (spec §4.1, component C1): owns exactly one socket to one
//! relay, drives the connection state machine and its exponential backoff,
//! and mirrors the caller's subscriptions onto the wire. Grounded on
//! `enostr::WebsocketConn`/`WebsocketRelay` (wakeup-driven `ewebsock`
//! connection, `retry_connect_after` backoff state) and
//! `enostr::relay::pool::RelayPool::try_recv`'s poll shape, generalized
//! into a `poll()` that returns decoded events instead of mutating a
//! coordinator directly — keeping the agent ignorant of its caller, per
//! spec §9's note on breaking the agent/coordinator reference cycle.

use std::time::{Duration, Instant};

use ewebsock::{Options, WsEvent, WsMessage, WsReceiver, WsSender};
use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::event::Event;
use crate::filter::Filter;
use crate::relay::message::{ClientMessage, RelayMessage};
use crate::relay_url::RelayUrl;
use crate::subid::SubscriptionId;

/// Connection phase, modeled as a discriminated union per spec §9 so every
/// variant carries exactly the data it needs and the compiler catches a
/// missing match arm instead of an `is`/`as` check at runtime.
#[derive(Debug, Clone)]
pub enum ConnectionPhase {
    Disconnected { next_reconnect_at: Option<Instant> },
    Connecting { started_at: Instant },
    Connected,
    Reconnecting { attempt: u32, next_reconnect_at: Instant },
}

impl ConnectionPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionPhase::Connected)
    }
}

/// One event surfaced by [`RelayAgent::poll`] for the coordinator to act on.
#[derive(Debug)]
pub enum AgentEvent {
    Opened,
    Closed,
    Error(String),
    Message(RelayMessage),
    /// The relay dropped a subscription we still consider active; the
    /// agent has already re-sent the `REQ` (spec §4.1 wire-level semantics).
    Resubscribed(SubscriptionId),
}

const MIN_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before reconnect attempt `n` (1-indexed): `min(100ms * 2^(n-1), max)`.
pub fn backoff_delay(attempt: u32, max_delay: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(20); // guard against overflow in 2^n
    let millis = MIN_BACKOFF.as_millis().saturating_mul(1u128 << exp);
    Duration::from_millis(millis.min(max_delay.as_millis()) as u64)
}

pub struct RelayAgent {
    pub url: RelayUrl,
    phase: ConnectionPhase,
    phase_started_at: Instant,
    reconnect_attempts: u32,
    last_activity_at: Option<Instant>,
    last_error: Option<String>,
    active_subscriptions: HashMap<SubscriptionId, Vec<Filter>>,
    idle_since: Option<Instant>,
    max_reconnect_delay: Duration,
    idle_timeout: Duration,
    sender: Option<WsSender>,
    receiver: Option<WsReceiver>,
    disposed: bool,
}

impl RelayAgent {
    pub fn new(url: RelayUrl) -> Self {
        let now = Instant::now();
        RelayAgent {
            url,
            phase: ConnectionPhase::Disconnected {
                next_reconnect_at: None,
            },
            phase_started_at: now,
            reconnect_attempts: 0,
            last_activity_at: None,
            last_error: None,
            active_subscriptions: HashMap::new(),
            idle_since: Some(now),
            max_reconnect_delay: DEFAULT_MAX_BACKOFF,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sender: None,
            receiver: None,
            disposed: false,
        }
    }

    pub fn with_limits(mut self, max_reconnect_delay: Duration, idle_timeout: Duration) -> Self {
        self.max_reconnect_delay = max_reconnect_delay;
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn active_subscriptions(&self) -> &HashMap<SubscriptionId, Vec<Filter>> {
        &self.active_subscriptions
    }

    pub fn is_idle_past(&self, now: Instant, timeout: Duration) -> bool {
        self.active_subscriptions.is_empty()
            && self
                .idle_since
                .is_some_and(|since| now.duration_since(since) >= timeout)
    }

    /// Adds or replaces `sub_id` in `active_subscriptions` and, if
    /// connected, `CLOSE`s then `REQ`s the replacement (spec §4.1).
    pub fn subscribe(&mut self, wakeup: impl Fn() + Send + Sync + Clone + 'static, sub_id: SubscriptionId, filters: Vec<Filter>) {
        let replacing = self.active_subscriptions.contains_key(&sub_id);
        self.active_subscriptions.insert(sub_id.clone(), filters.clone());
        self.idle_since = None;

        self.ensure_connecting(wakeup);

        if self.phase.is_connected() {
            if replacing {
                self.send(&ClientMessage::close(sub_id.clone()));
            }
            self.send(&ClientMessage::req(sub_id, filters));
        }
    }

    pub fn unsubscribe(&mut self, sub_id: &SubscriptionId) {
        if self.active_subscriptions.remove(sub_id).is_some() && self.phase.is_connected() {
            self.send(&ClientMessage::close(sub_id.clone()));
        }
        if self.active_subscriptions.is_empty() {
            self.idle_since = Some(Instant::now());
        }
    }

    /// Sends unconditionally once a socket exists, connected or not —
    /// `ewebsock` queues frames written before the handshake completes and
    /// flushes them on open, so gating this on `Connected` would drop every
    /// publish issued against a freshly-created agent. `self.send` is itself
    /// a no-op while `sender` is `None` (no reachable relay at all).
    pub fn publish(&mut self, wakeup: impl Fn() + Send + Sync + Clone + 'static, event: Event) {
        self.ensure_connecting(wakeup);
        self.send(&ClientMessage::event(event));
    }

    fn ensure_connecting(&mut self, wakeup: impl Fn() + Send + Sync + Clone + 'static) {
        if matches!(
            self.phase,
            ConnectionPhase::Connected | ConnectionPhase::Connecting { .. }
        ) {
            return;
        }
        self.open_socket(wakeup);
    }

    fn open_socket(&mut self, wakeup: impl Fn() + Send + Sync + Clone + 'static) {
        match ewebsock::connect_with_wakeup(self.url.as_str(), Options::default(), move || wakeup()) {
            Ok((sender, receiver)) => {
                self.sender = Some(sender);
                self.receiver = Some(receiver);
                self.set_phase(ConnectionPhase::Connecting {
                    started_at: Instant::now(),
                });
            }
            Err(e) => {
                warn!("connect failed for {}: {e}", self.url);
                self.last_error = Some(e.clone());
                self.schedule_reconnect();
            }
        }
    }

    fn send(&mut self, msg: &ClientMessage) {
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        match msg.to_json() {
            Ok(json) => {
                trace!("-> {} {json}", self.url);
                sender.send(WsMessage::Text(json));
            }
            Err(e) => warn!("failed to encode message for {}: {e}", self.url),
        }
    }

    fn set_phase(&mut self, phase: ConnectionPhase) {
        self.phase_started_at = Instant::now();
        self.phase = phase;
    }

    /// The first reconnect after a `Connected` state fires immediately
    /// (attempt 1, 0ms); every subsequent failure follows the exponential
    /// schedule (spec §4.1 Backoff).
    fn schedule_reconnect(&mut self) {
        self.sender = None;
        self.receiver = None;
        let was_connected = matches!(self.phase, ConnectionPhase::Connected);
        self.reconnect_attempts = if was_connected {
            1
        } else {
            self.reconnect_attempts.saturating_add(1)
        };
        let delay = if was_connected {
            Duration::ZERO
        } else {
            backoff_delay(self.reconnect_attempts, self.max_reconnect_delay)
        };
        let next_at = Instant::now() + delay;
        debug!(
            "{}: scheduling reconnect attempt {} in {:?}",
            self.url, self.reconnect_attempts, delay
        );
        self.set_phase(ConnectionPhase::Reconnecting {
            attempt: self.reconnect_attempts,
            next_reconnect_at: next_at,
        });
    }

    /// Idempotent poke used by the health checker (spec §4.1/§4.4).
    pub fn check_and_reconnect(&mut self, wakeup: impl Fn() + Send + Sync + Clone + 'static, force: bool) {
        if self.disposed {
            return;
        }
        let now = Instant::now();
        match &self.phase {
            ConnectionPhase::Disconnected { .. } if !self.active_subscriptions.is_empty() => {
                self.open_socket(wakeup);
            }
            ConnectionPhase::Reconnecting {
                next_reconnect_at, ..
            } if now >= *next_reconnect_at && !self.active_subscriptions.is_empty() => {
                self.open_socket(wakeup);
            }
            ConnectionPhase::Connected if force => {
                self.send(&ClientMessage::req(
                    SubscriptionId::new("__probe__"),
                    vec![Filter::probe()],
                ));
            }
            _ => {}
        }
    }

    /// Resubscribing with up-to-date filters (the `since` clamp of spec
    /// §4.4) is the coordinator's job, not the agent's — it alone knows
    /// what each subscription has already seen. See
    /// [`crate::coordinator::PoolCoordinator`]'s handling of
    /// [`AgentEvent::Opened`].
    pub fn connecting_deadline(&self, connect_timeout: Duration) -> Option<Instant> {
        match self.phase {
            ConnectionPhase::Connecting { started_at } => Some(started_at + connect_timeout),
            _ => None,
        }
    }

    /// Spec §4.1: `Connecting` transitions to `Reconnecting` on timeout, not
    /// just on an explicit socket error — a relay that accepts the TCP
    /// connection but never completes the WS handshake would otherwise sit
    /// in `Connecting` forever.
    pub fn enforce_connect_timeout(&mut self, now: Instant, connect_timeout: Duration) {
        if let ConnectionPhase::Connecting { started_at } = self.phase {
            if now.duration_since(started_at) >= connect_timeout {
                self.last_error = Some("connect timed out".to_string());
                self.schedule_reconnect();
            }
        }
    }

    pub fn close_idle_if_past(&mut self, now: Instant, timeout: Duration) -> bool {
        if self.is_idle_past(now, timeout) {
            self.sender = None;
            self.receiver = None;
            self.set_phase(ConnectionPhase::Disconnected {
                next_reconnect_at: None,
            });
            true
        } else {
            false
        }
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
        self.sender = None;
        self.receiver = None;
        self.active_subscriptions.clear();
        self.set_phase(ConnectionPhase::Disconnected {
            next_reconnect_at: None,
        });
    }

    /// Drains every pending `ewebsock` event and returns the decoded
    /// [`AgentEvent`]s for the coordinator to act on, in wire order (spec
    /// §5: "within one relay, messages arrive and are processed in the
    /// order the relay sent them").
    #[profiling::function]
    pub fn poll(&mut self) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        if self.disposed {
            return out;
        }

        loop {
            let Some(receiver) = self.receiver.as_mut() else {
                break;
            };
            let Some(event) = receiver.try_recv() else {
                break;
            };
            self.last_activity_at = Some(Instant::now());

            match event {
                WsEvent::Opened => {
                    self.reconnect_attempts = 0;
                    self.last_error = None;
                    self.set_phase(ConnectionPhase::Connected);
                    out.push(AgentEvent::Opened);
                }
                WsEvent::Closed => {
                    self.last_error = Some("connection closed".to_string());
                    self.schedule_reconnect();
                    out.push(AgentEvent::Closed);
                }
                WsEvent::Error(err) => {
                    self.last_error = Some(err.clone());
                    self.schedule_reconnect();
                    out.push(AgentEvent::Error(err));
                }
                WsEvent::Message(WsMessage::Text(text)) => match RelayMessage::from_json(&text) {
                    Ok(RelayMessage::Closed { sub_id, reason }) => {
                        trace!("{}: relay closed {sub_id}: {reason}", self.url);
                        if let Some(filters) = self.active_subscriptions.get(&sub_id).cloned() {
                            self.send(&ClientMessage::req(sub_id.clone(), filters));
                            out.push(AgentEvent::Resubscribed(sub_id));
                        }
                    }
                    Ok(msg) => out.push(AgentEvent::Message(msg)),
                    Err(e) => warn!("{}: decode error: {e}", self.url),
                },
                WsEvent::Message(WsMessage::Ping(bytes)) => {
                    if let Some(sender) = self.sender.as_mut() {
                        sender.send(WsMessage::Pong(bytes));
                    }
                }
                WsEvent::Message(_) => {}
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(1, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, max), Duration::from_millis(400));
        assert_eq!(backoff_delay(20, max), max);
    }

    #[test]
    fn fresh_agent_starts_disconnected_with_no_reconnects() {
        let agent = RelayAgent::new(RelayUrl::parse("wss://relay.example.com").unwrap());
        assert!(matches!(
            agent.phase(),
            ConnectionPhase::Disconnected { .. }
        ));
        assert_eq!(agent.reconnect_attempts(), 0);
        assert!(agent.active_subscriptions().is_empty());
    }

    #[test]
    fn is_idle_past_requires_empty_subscriptions() {
        let mut agent = RelayAgent::new(RelayUrl::parse("wss://relay.example.com").unwrap());
        agent
            .active_subscriptions
            .insert(SubscriptionId::new("s1"), vec![]);
        let now = Instant::now() + Duration::from_secs(60);
        assert!(!agent.is_idle_past(now, Duration::from_secs(30)));
    }

    #[test]
    fn unsubscribe_removes_entry_and_marks_idle() {
        let mut agent = RelayAgent::new(RelayUrl::parse("wss://relay.example.com").unwrap());
        agent
            .active_subscriptions
            .insert(SubscriptionId::new("s1"), vec![]);
        agent.unsubscribe(&SubscriptionId::new("s1"));
        assert!(agent.active_subscriptions().is_empty());
        assert!(agent.idle_since.is_some());
    }
}
