//! `PoolContext`/`PoolHandle` (spec §9 "Global singletons" design note): a
//! single explicit construction point for the pool instead of a
//! process-wide container-of-providers, and a cheap, cloneable handle
//! callers pass around instead of reaching back into a singleton.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::config::{PoolConfig, QuerySource};
use crate::coordinator::{Command, PoolCoordinator};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::publish::PublishResponse;
use crate::relay_url::RelayUrl;
use crate::state::PoolState;
use crate::store::{AlwaysVerify, EventStore, NullEventStore, Verifier};
use crate::subid::SubscriptionId;

/// A cheap, cloneable handle to a running pool. Dropping every clone does
/// not dispose the pool; call [`PoolHandle::dispose`] explicitly.
#[derive(Clone)]
pub struct PoolHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl PoolHandle {
    /// Blocking or streaming query (spec §4.4 `query`). In streaming mode
    /// the returned vector is always empty and the subscription persists
    /// until `unsubscribe`; delivery happens through [`PoolHandle::on_events`].
    pub async fn query(&self, sub_id: SubscriptionId, filters: Vec<Filter>, source: QuerySource) -> Result<Vec<Event>> {
        self.query_with(sub_id, filters, Some(source)).await
    }

    /// Same as [`PoolHandle::query`], but falls back to
    /// [`PoolConfig::default_query_source`](crate::PoolConfig::default_query_source)
    /// when the caller has no per-call source to supply (spec §6).
    pub async fn query_default(&self, sub_id: SubscriptionId, filters: Vec<Filter>) -> Result<Vec<Event>> {
        self.query_with(sub_id, filters, None).await
    }

    async fn query_with(&self, sub_id: SubscriptionId, filters: Vec<Filter>, source: Option<QuerySource>) -> Result<Vec<Event>> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::Query { sub_id, filters, source, respond })?;
        rx.await.map_err(|_| Error::Disposed)?
    }

    pub async fn publish(&self, events: Vec<Event>, relays: Vec<RelayUrl>) -> Result<PublishResponse> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::Publish { events, relays, respond })?;
        rx.await.map_err(|_| Error::Disposed)
    }

    pub fn unsubscribe(&self, sub_id: SubscriptionId) -> Result<()> {
        self.send(Command::Unsubscribe { sub_id })
    }

    pub async fn close_subscriptions_to_relays(&self, relays: Vec<RelayUrl>) -> Result<Vec<SubscriptionId>> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::CloseSubscriptionsToRelays { relays, respond })?;
        rx.await.map_err(|_| Error::Disposed)
    }

    pub fn perform_health_check(&self, force: bool) -> Result<()> {
        self.send(Command::PerformHealthCheck { force })
    }

    pub fn observe_state(&self, callback: impl FnMut(&PoolState) + Send + 'static) -> Result<()> {
        self.send(Command::ObserveState {
            callback: Box::new(callback),
        })
    }

    pub fn on_events(
        &self,
        callback: impl FnMut(&SubscriptionId, &[Event], &hashbrown::HashMap<crate::event::EventId, Vec<RelayUrl>>) + Send + 'static,
    ) -> Result<()> {
        self.send(Command::OnEvents {
            callback: Box::new(callback),
        })
    }

    pub async fn dispose(&self) -> Result<()> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::Dispose { respond })?;
        rx.await.map_err(|_| Error::Disposed)
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| Error::Disposed)
    }
}

/// Owns the background thread the whole pool runs on. Construct once at
/// startup with whatever [`EventStore`]/[`Verifier`] the caller's
/// application wires in; drop it (or call `handle().dispose()`) to shut
/// the pool down.
pub struct PoolContext {
    handle: PoolHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PoolContext {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_collaborators(config, Arc::new(NullEventStore), Arc::new(AlwaysVerify))
    }

    pub fn with_collaborators(
        config: PoolConfig,
        event_store: Arc<dyn EventStore>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name("relaypool-coordinator".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("failed to start relaypool runtime: {e}");
                        return;
                    }
                };
                let coordinator = PoolCoordinator::new(config, event_store, verifier);
                runtime.block_on(coordinator.run(cmd_rx));
            })
            .expect("failed to spawn relaypool coordinator thread");

        PoolContext {
            handle: PoolHandle { cmd_tx },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }
}

impl Drop for PoolContext {
    fn drop(&mut self) {
        let _ = self.handle.cmd_tx.send(Command::Dispose {
            respond: oneshot::channel().0,
        });
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
