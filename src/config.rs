//! `PoolConfig` (spec §6 "Environment / configuration"). A plain struct with
//! a sensible `Default`; no file/env/CLI parsing lives in this crate (spec
//! §1 Non-goals) — a caller builds one however it likes and hands it to
//! [`crate::PoolContext::new`].

use std::time::Duration;

use hashbrown::HashMap;

use crate::event::Event;
use crate::relay_url::RelayUrl;

/// A query's relay target (spec §6 `source`), used directly by
/// [`crate::PoolHandle::query`] or as [`PoolConfig::default_query_source`]
/// when the caller doesn't supply one.
#[derive(Clone)]
pub struct QuerySource {
    pub relays: Vec<RelayUrl>,
    /// A name looked up in [`PoolConfig::default_relays`] and unioned with
    /// `relays` when this source is resolved (spec §6 "named groups of relay
    /// urls").
    pub relay_group: Option<String>,
    pub stream: bool,
    pub event_filter: Option<std::sync::Arc<dyn Fn(&Event) -> bool + Send + Sync>>,
}

impl Default for QuerySource {
    fn default() -> Self {
        QuerySource {
            relays: Vec::new(),
            relay_group: None,
            stream: false,
            event_filter: None,
        }
    }
}

impl QuerySource {
    pub fn new(relays: Vec<RelayUrl>, stream: bool) -> Self {
        QuerySource {
            relays,
            relay_group: None,
            stream,
            event_filter: None,
        }
    }

    /// A source whose relay set is resolved entirely from a
    /// [`PoolConfig::default_relays`] group at query time.
    pub fn named_group(group: impl Into<String>, stream: bool) -> Self {
        QuerySource {
            relays: Vec::new(),
            relay_group: Some(group.into()),
            stream,
            event_filter: None,
        }
    }

    pub fn with_filter(mut self, f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.event_filter = Some(std::sync::Arc::new(f));
        self
    }
}

#[derive(Clone)]
pub struct PoolConfig {
    /// EOSE wait and blocking-query deadline. Default 5s.
    pub response_timeout: Duration,
    /// Streaming batch window. Default 100ms.
    pub streaming_buffer_window: Duration,
    /// Cap on exponential reconnect backoff. Default 30s.
    pub max_reconnect_delay: Duration,
    /// Grace period before an agent with no subscriptions is torn down.
    /// Default 30s.
    pub idle_timeout: Duration,
    /// Per-event publish acknowledgement deadline. Default 10s.
    pub publish_timeout: Duration,
    /// Interval of the idle-agent garbage-collection sweep. Default 30s.
    pub gc_interval: Duration,
    /// Interval of the reconnect-pollster health check. Default 2s.
    pub health_check_interval: Duration,
    /// `PoolStateNotifier` coalescing window. Defaults to
    /// `streaming_buffer_window`.
    pub throttle_duration: Duration,
    /// Capacity of the `PoolState.logs` ring buffer. Default 256.
    pub log_capacity: usize,
    /// If true, events bypass the configured [`crate::Verifier`] entirely.
    pub skip_verification: bool,
    /// Named groups of relay urls a caller can refer to by name.
    pub default_relays: HashMap<String, Vec<RelayUrl>>,
    /// Default `source` used when a query doesn't supply one.
    pub default_query_source: QuerySource,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let streaming_buffer_window = Duration::from_millis(100);
        PoolConfig {
            response_timeout: Duration::from_secs(5),
            streaming_buffer_window,
            max_reconnect_delay: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
            gc_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(2),
            throttle_duration: streaming_buffer_window,
            log_capacity: 256,
            skip_verification: false,
            default_relays: HashMap::new(),
            default_query_source: QuerySource::default(),
        }
    }
}

impl PoolConfig {
    /// Connect timeout per spec §5: `min(response_timeout, 5s)`.
    pub fn connect_timeout(&self) -> Duration {
        self.response_timeout.min(Duration::from_secs(5))
    }

    /// Resolves a `QuerySource`'s final relay set: explicit `relays`
    /// unioned with `relay_group`, if set, looked up in `default_relays`
    /// (spec §6). An unknown group name resolves to no additional relays.
    pub fn resolve_relays(&self, source: &QuerySource) -> Vec<RelayUrl> {
        let mut resolved = source.relays.clone();
        if let Some(group) = source.relay_group.as_deref().and_then(|g| self.default_relays.get(g)) {
            for relay in group {
                if !resolved.contains(relay) {
                    resolved.push(relay.clone());
                }
            }
        }
        resolved
    }
}
