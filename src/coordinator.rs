//! `PoolCoordinator` (spec §4.4, component C4): the single-threaded
//! cooperative owner of every [`RelayAgent`], [`SubscriptionBuffer`], and
//! [`PublishTracker`]. Lives on a dedicated background thread driven by a
//! single-threaded tokio runtime (spec §9 "cooperative scheduling" — this
//! crate resolves the open choice in favour of a worker thread + channel,
//! mirroring how `enostr::relay::pool::RelayPool` is driven from the host
//! application's own poll loop, generalised into its own thread here since
//! this crate has no host loop to piggyback on).

use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::info;

use crate::buffer::SubscriptionBuffer;
use crate::config::{PoolConfig, QuerySource};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::publish::{PublishResponse, PublishTracker};
use crate::relay::agent::{AgentEvent, ConnectionPhase, RelayAgent};
use crate::relay::message::RelayMessage;
use crate::relay_url::RelayUrl;
use crate::state::{ClosedSnapshot, PoolState, PoolStateNotifier, RelayDiagnostic, RelayViewPhase, SubscriptionSnapshot};
use crate::store::{EventStore, Verifier};
use crate::subid::SubscriptionId;

type OnEventsCallback = Box<dyn FnMut(&SubscriptionId, &[Event], &HashMap<crate::event::EventId, Vec<RelayUrl>>) + Send>;

pub enum Command {
    Query {
        sub_id: SubscriptionId,
        filters: Vec<Filter>,
        /// `None` falls back to `PoolConfig::default_query_source` (spec §6),
        /// resolved here rather than by the caller since only the
        /// coordinator's own config is authoritative.
        source: Option<QuerySource>,
        respond: oneshot::Sender<Result<Vec<Event>>>,
    },
    Publish {
        events: Vec<Event>,
        relays: Vec<RelayUrl>,
        respond: oneshot::Sender<PublishResponse>,
    },
    Unsubscribe {
        sub_id: SubscriptionId,
    },
    CloseSubscriptionsToRelays {
        relays: Vec<RelayUrl>,
        respond: oneshot::Sender<Vec<SubscriptionId>>,
    },
    PerformHealthCheck {
        force: bool,
    },
    ObserveState {
        callback: Box<dyn FnMut(&PoolState) + Send>,
    },
    OnEvents {
        callback: OnEventsCallback,
    },
    Dispose {
        respond: oneshot::Sender<()>,
    },
}

fn wakeup_closure(notify: Arc<Notify>) -> impl Fn() + Send + Sync + Clone + 'static {
    move || notify.notify_one()
}

pub struct PoolCoordinator {
    config: PoolConfig,
    event_store: Arc<dyn EventStore>,
    verifier: Arc<dyn Verifier>,

    agents: HashMap<RelayUrl, RelayAgent>,
    buffers: HashMap<SubscriptionId, SubscriptionBuffer>,
    closed_subscriptions: HashMap<SubscriptionId, ClosedSnapshot>,
    trackers: Vec<PublishTracker>,

    notifier: PoolStateNotifier,
    on_events: Vec<OnEventsCallback>,

    wakeup: Arc<Notify>,
    disposed: bool,

    last_health_check: Instant,
    last_gc: Instant,
}

impl PoolCoordinator {
    pub fn new(config: PoolConfig, event_store: Arc<dyn EventStore>, verifier: Arc<dyn Verifier>) -> Self {
        let notifier = PoolStateNotifier::new(config.throttle_duration, config.log_capacity);
        let now = Instant::now();
        PoolCoordinator {
            config,
            event_store,
            verifier,
            agents: HashMap::new(),
            buffers: HashMap::new(),
            closed_subscriptions: HashMap::new(),
            trackers: Vec::new(),
            notifier,
            on_events: Vec::new(),
            wakeup: Arc::new(Notify::new()),
            disposed: false,
            last_health_check: now,
            last_gc: now,
        }
    }

    /// The event loop (spec §5): interleaves caller commands, socket wakeups,
    /// and timer firings. All state mutation happens here, synchronously.
    pub async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let next_wakeup = self.next_deadline();
            let sleep = match next_wakeup {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            tokio::pin!(sleep);
            let wakeup = self.wakeup.clone();
            let woken = wakeup.notified();
            tokio::pin!(woken);

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                _ = &mut woken => {
                    self.poll_agents();
                }
                _ = &mut sleep => {
                    self.poll_timers();
                }
            }

            if self.disposed {
                break;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let buffer_deadline = self.buffers.values().filter_map(|b| b.next_deadline()).min();
        let notifier_deadline = self.notifier.next_deadline();
        let tracker_deadline = self.trackers.iter().map(|t| t.deadline).min();
        let health_check_deadline = self.last_health_check + self.config.health_check_interval;
        let gc_deadline = self.last_gc + self.config.gc_interval;
        let connect_timeout = self.config.connect_timeout();
        let connecting_deadline = self
            .agents
            .values()
            .filter_map(|a| a.connecting_deadline(connect_timeout))
            .min();
        [
            buffer_deadline,
            notifier_deadline,
            tracker_deadline,
            Some(health_check_deadline),
            Some(gc_deadline),
            connecting_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Query { sub_id, filters, source, respond } => {
                self.handle_query(sub_id, filters, source, respond)
            }
            Command::Publish { events, relays, respond } => self.handle_publish(events, relays, respond),
            Command::Unsubscribe { sub_id } => self.handle_unsubscribe(&sub_id),
            Command::CloseSubscriptionsToRelays { relays, respond } => {
                let closed = self.close_subscriptions_to_relays(&relays);
                let _ = respond.send(closed);
            }
            Command::PerformHealthCheck { force } => self.perform_health_check(force),
            Command::ObserveState { callback } => self.notifier.observe(callback),
            Command::OnEvents { callback } => self.on_events.push(callback),
            Command::Dispose { respond } => {
                self.dispose();
                let _ = respond.send(());
            }
        }
        self.emit_snapshot();
    }

    fn handle_query(
        &mut self,
        sub_id: SubscriptionId,
        filters: Vec<Filter>,
        source: Option<QuerySource>,
        respond: oneshot::Sender<Result<Vec<Event>>>,
    ) {
        if self.buffers.contains_key(&sub_id) || self.closed_subscriptions.contains_key(&sub_id) {
            let _ = respond.send(Err(Error::DuplicateSubscription(sub_id.to_string())));
            return;
        }

        let source = source.unwrap_or_else(|| self.config.default_query_source.clone());
        let stream = source.stream;
        let event_filter = source.event_filter.clone();
        let filters = self.optimize_filters(&sub_id, filters);
        let target_relays: std::collections::HashSet<RelayUrl> =
            self.config.resolve_relays(&source).into_iter().collect();

        if target_relays.is_empty() && !stream {
            let _ = respond.send(Ok(Vec::new()));
            return;
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        let waiter = if stream { None } else { Some(waiter_tx) };

        let filter_fn = event_filter.map(|f| {
            Box::new(move |e: &Event| f(e)) as Box<dyn Fn(&Event) -> bool + Send>
        });

        let buffer = SubscriptionBuffer::new(
            sub_id.clone(),
            filters.clone(),
            target_relays.clone(),
            stream,
            filter_fn,
            self.config.streaming_buffer_window,
            self.config.response_timeout,
            waiter,
        );
        self.buffers.insert(sub_id.clone(), buffer);
        self.notifier.log(Some(sub_id.clone()), "subscribed");

        for relay_url in &target_relays {
            let wakeup = wakeup_closure(self.wakeup.clone());
            let agent = self.agent_mut(relay_url);
            agent.subscribe(wakeup, sub_id.clone(), filters.clone());
        }

        if stream {
            let _ = respond.send(Ok(Vec::new()));
        } else if target_relays.is_empty() {
            let _ = respond.send(Ok(Vec::new()));
        } else {
            tokio::spawn(async move {
                if let Ok(events) = waiter_rx.await {
                    let _ = respond.send(Ok(events));
                }
            });
        }
    }

    /// Spec §4.4 filter optimisation: clamp `since` to the newest locally
    /// known `created_at` for the same `(kinds, authors)` shape, so a
    /// relay we've already talked to doesn't resend history we have.
    fn optimize_filters(&self, _sub_id: &SubscriptionId, filters: Vec<Filter>) -> Vec<Filter> {
        filters
            .into_iter()
            .map(|mut f| {
                let cached = self.event_store.query(&f);
                if let Some(max_created_at) = cached.iter().map(|e| e.created_at).max() {
                    let candidate = max_created_at + 1;
                    if f.since.map_or(true, |since| candidate > since) {
                        f.since = Some(candidate);
                    }
                }
                f
            })
            .collect()
    }

    fn handle_publish(&mut self, events: Vec<Event>, relays: Vec<RelayUrl>, respond: oneshot::Sender<PublishResponse>) {
        if events.is_empty() {
            let _ = respond.send(PublishResponse::default());
            return;
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        let mut tracker = PublishTracker::new(events.clone(), relays.clone(), self.config.publish_timeout, waiter_tx);

        for relay_url in &relays {
            let wakeup = wakeup_closure(self.wakeup.clone());
            let agent = self.agent_mut(relay_url);
            for event in &events {
                agent.publish(wakeup.clone(), event.clone());
            }
            if !matches!(agent.phase(), ConnectionPhase::Connected | ConnectionPhase::Connecting { .. }) {
                let reason = match agent.last_error() {
                    Some(err) => format!("Connection failed: {err}"),
                    None => "Connection failed: relay unreachable".to_string(),
                };
                tracker.mark_unreachable(relay_url.clone(), reason);
            }
        }
        tracker.try_resolve();
        self.trackers.push(tracker);

        tokio::spawn(async move {
            if let Ok(response) = waiter_rx.await {
                let _ = respond.send(response);
            }
        });
    }

    fn handle_unsubscribe(&mut self, sub_id: &SubscriptionId) {
        let Some(mut buffer) = self.buffers.remove(sub_id) else {
            return;
        };
        for relay_url in buffer.target_relays.clone() {
            self.agent_mut(&relay_url).unsubscribe(sub_id);
        }
        buffer.dispose();
        self.notifier.log(Some(sub_id.clone()), "closed");
    }

    /// Spec §4.4: for each active subscription, drop the given relays from
    /// its target set; returns the ids that became fully closed.
    fn close_subscriptions_to_relays(&mut self, relays: &[RelayUrl]) -> Vec<SubscriptionId> {
        if relays.is_empty() {
            return Vec::new();
        }
        let mut fully_closed = Vec::new();
        for (sub_id, buffer) in self.buffers.iter_mut() {
            for relay_url in relays {
                buffer.remove_target_relay(relay_url);
            }
            if buffer.is_fully_closed() {
                fully_closed.push(sub_id.clone());
            }
        }
        for relay_url in relays {
            if let Some(agent) = self.agents.get_mut(relay_url) {
                let sub_ids: Vec<SubscriptionId> = agent.active_subscriptions().keys().cloned().collect();
                for sub_id in sub_ids {
                    agent.unsubscribe(&sub_id);
                }
            }
        }
        for sub_id in &fully_closed {
            if let Some(mut buffer) = self.buffers.remove(sub_id) {
                buffer.dispose();
            }
            self.closed_subscriptions.insert(
                sub_id.clone(),
                ClosedSnapshot {
                    closed_at: Instant::now(),
                },
            );
        }
        fully_closed
    }

    fn perform_health_check(&mut self, force: bool) {
        let urls: Vec<RelayUrl> = self
            .buffers
            .values()
            .flat_map(|b| b.target_relays.iter().cloned())
            .collect();
        for url in urls {
            let wakeup = wakeup_closure(self.wakeup.clone());
            let was_connected = self
                .agents
                .get(&url)
                .map(|a| a.phase().is_connected())
                .unwrap_or(false);
            if let Some(agent) = self.agents.get_mut(&url) {
                agent.check_and_reconnect(wakeup, force);
            }
            if force && was_connected {
                self.resync_relay(&url);
            }
        }
    }

    /// Re-`REQ`s every buffer targeting `relay_url`, clamping `since` to
    /// what this subscription has already seen (spec §4.4) and re-sending
    /// for any subscription the agent's own bookkeeping had lost track of.
    fn resync_relay(&mut self, relay_url: &RelayUrl) {
        let subs: Vec<(SubscriptionId, Vec<Filter>)> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| buffer.target_relays.contains(relay_url))
            .map(|(sub_id, buffer)| (sub_id.clone(), buffer.resync_filters()))
            .collect();
        if subs.is_empty() {
            return;
        }
        let wakeup = wakeup_closure(self.wakeup.clone());
        let agent = self.agent_mut(relay_url);
        for (sub_id, filters) in subs {
            agent.subscribe(wakeup.clone(), sub_id, filters);
        }
    }

    fn agent_mut(&mut self, url: &RelayUrl) -> &mut RelayAgent {
        let max_reconnect_delay = self.config.max_reconnect_delay;
        let idle_timeout = self.config.idle_timeout;
        self.agents
            .entry(url.clone())
            .or_insert_with(|| RelayAgent::new(url.clone()).with_limits(max_reconnect_delay, idle_timeout))
    }

    fn poll_agents(&mut self) {
        let urls: Vec<RelayUrl> = self.agents.keys().cloned().collect();
        for url in urls {
            let events = self.agents.get_mut(&url).map(|a| a.poll()).unwrap_or_default();
            for event in events {
                self.handle_agent_event(&url, event);
            }
        }
        self.emit_snapshot();
    }

    fn handle_agent_event(&mut self, relay_url: &RelayUrl, event: AgentEvent) {
        match event {
            AgentEvent::Opened => {
                self.notifier.log(None, format!("connected to {relay_url}"));
                self.resync_relay(relay_url);
            }
            AgentEvent::Closed | AgentEvent::Error(_) => {
                self.notifier.log(None, format!("disconnected from {relay_url}"));
            }
            AgentEvent::Resubscribed(sub_id) => {
                self.notifier.log(Some(sub_id), format!("resubscribed after CLOSED from {relay_url}"));
            }
            AgentEvent::Message(RelayMessage::Event { sub_id, event }) => {
                if !self.config.skip_verification && !self.verifier.verify(&event) {
                    self.notifier.log(Some(sub_id), "verification failed");
                    return;
                }
                self.event_store.save(std::slice::from_ref(event.as_ref()));
                if let Some(buffer) = self.buffers.get_mut(&sub_id) {
                    // Streaming flushes happen on the buffer's own batch-window
                    // timer, picked up by poll_timers; nothing to do here.
                    buffer.add_event(relay_url.clone(), *event);
                }
            }
            AgentEvent::Message(RelayMessage::Eose { sub_id }) => {
                let should_flush = self
                    .buffers
                    .get_mut(&sub_id)
                    .map(|b| b.mark_eose(relay_url.clone()))
                    .unwrap_or(false);
                self.notifier.log(Some(sub_id.clone()), format!("EOSE received from {relay_url}"));
                if should_flush {
                    self.flush_and_maybe_dispose(&sub_id);
                }
            }
            AgentEvent::Message(RelayMessage::Ok { event_id, accepted, message }) => {
                if let Ok(id) = crate::event::EventId::from_hex(&event_id) {
                    self.notifier.log(None, format!("publish {} by {relay_url}", if accepted { "accepted" } else { "rejected" }));
                    let mut resolved_indices = Vec::new();
                    for (i, tracker) in self.trackers.iter_mut().enumerate() {
                        let relevant = tracker.target_relays.contains(relay_url) && tracker.events.iter().any(|e| e.id == id);
                        if !relevant {
                            continue;
                        }
                        tracker.record_ok(relay_url.clone(), id, accepted, message.clone());
                        if tracker.try_resolve() {
                            resolved_indices.push(i);
                        }
                    }
                    for i in resolved_indices.into_iter().rev() {
                        self.trackers.remove(i);
                    }
                }
            }
            AgentEvent::Message(RelayMessage::Notice { message }) => {
                self.notifier.log(None, format!("NOTICE from {relay_url}: {message}"));
            }
            AgentEvent::Message(RelayMessage::Closed { sub_id, reason }) => {
                self.notifier.log(Some(sub_id), format!("CLOSED by {relay_url}: {reason}"));
            }
        }
    }

    fn flush_and_maybe_dispose(&mut self, sub_id: &SubscriptionId) {
        let Some(buffer) = self.buffers.get_mut(sub_id) else {
            return;
        };
        let streaming = buffer.streaming;
        let outcome = buffer.flush();
        if !outcome.events.is_empty() || streaming {
            for callback in &mut self.on_events {
                callback(sub_id, &outcome.events, &outcome.relays_for_id);
            }
        }
        if !streaming {
            if let Some(buffer) = self.buffers.remove(sub_id) {
                for relay_url in buffer.target_relays {
                    self.agent_mut(&relay_url).unsubscribe(sub_id);
                }
            }
        }
    }

    fn poll_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<SubscriptionId> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.due_for_timeout_flush(now))
            .map(|(id, _)| id.clone())
            .collect();
        for sub_id in due {
            self.flush_and_maybe_dispose(&sub_id);
        }

        let mut resolved_indices = Vec::new();
        for (i, tracker) in self.trackers.iter_mut().enumerate() {
            if now >= tracker.deadline {
                let agents = &self.agents;
                tracker.resolve_with_timeouts(|relay| match agents.get(relay) {
                    Some(agent) if agent.phase().is_connected() => "Timeout".to_string(),
                    Some(agent) => format!(
                        "Connection failed: {}",
                        agent.last_error().unwrap_or("relay unreachable")
                    ),
                    None => "Connection failed: relay unreachable".to_string(),
                });
                resolved_indices.push(i);
            }
        }
        for i in resolved_indices.into_iter().rev() {
            self.trackers.remove(i);
        }

        let connect_timeout = self.config.connect_timeout();
        for agent in self.agents.values_mut() {
            agent.enforce_connect_timeout(now, connect_timeout);
        }

        if now >= self.last_gc + self.config.gc_interval {
            self.gc_idle_agents(now);
            self.last_gc = now;
        }

        if now >= self.last_health_check + self.config.health_check_interval {
            self.perform_health_check(false);
            self.last_health_check = now;
        }

        self.notifier.poll_timer(now);
        self.emit_snapshot();
    }

    fn gc_idle_agents(&mut self, now: Instant) {
        let idle_timeout = self.config.idle_timeout;
        // Connected-but-idle agents close their socket first (state machine
        // transition to Disconnected); a separate, coarser sweep then drops
        // agents that have had no subscriptions for the same grace period.
        for agent in self.agents.values_mut() {
            agent.close_idle_if_past(now, idle_timeout);
        }
        let stale: Vec<RelayUrl> = self
            .agents
            .iter()
            .filter(|(_, a)| a.is_idle_past(now, idle_timeout))
            .map(|(url, _)| url.clone())
            .collect();
        for url in stale {
            if let Some(mut agent) = self.agents.remove(&url) {
                agent.dispose();
            }
        }
    }

    fn emit_snapshot(&mut self) {
        let mut subscriptions = HashMap::new();
        for (sub_id, buffer) in &self.buffers {
            let mut relays = HashMap::new();
            for relay_url in &buffer.target_relays {
                let diagnostic = self
                    .agents
                    .get(relay_url)
                    .map(|agent| relay_diagnostic(agent, buffer))
                    .unwrap_or(RelayDiagnostic {
                        phase: RelayViewPhase::Disconnected,
                        last_error: None,
                        reconnect_attempts: 0,
                    });
                relays.insert(relay_url.clone(), diagnostic);
            }
            subscriptions.insert(
                sub_id.clone(),
                SubscriptionSnapshot {
                    relays,
                    event_count: buffer.event_count,
                    started_at: buffer.started_at,
                },
            );
        }

        let state = PoolState {
            subscriptions,
            closed_subscriptions: self.closed_subscriptions.clone(),
            logs: Vec::new(),
            timestamp: Instant::now(),
        };
        self.notifier.notify(state);
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for (_, mut agent) in self.agents.drain() {
            agent.dispose();
        }
        for (_, mut buffer) in self.buffers.drain() {
            buffer.dispose();
        }
        for mut tracker in self.trackers.drain(..) {
            tracker.resolve_with_timeouts(|_| "disposed".to_string());
        }
        info!("pool disposed");
    }
}

fn relay_diagnostic(agent: &RelayAgent, buffer: &SubscriptionBuffer) -> RelayDiagnostic {
    let phase = match agent.phase() {
        ConnectionPhase::Disconnected { .. } => RelayViewPhase::Disconnected,
        ConnectionPhase::Connecting { .. } => RelayViewPhase::Connecting,
        ConnectionPhase::Reconnecting { .. } => RelayViewPhase::Waiting,
        ConnectionPhase::Connected => {
            if buffer.streaming {
                RelayViewPhase::Streaming
            } else {
                RelayViewPhase::Loading
            }
        }
    };
    RelayDiagnostic {
        phase,
        last_error: agent.last_error().map(str::to_string),
        reconnect_attempts: agent.reconnect_attempts(),
    }
}
