//! A client-side relay pool for a Nostr-style event protocol: multiplexes
//! logical subscriptions over a dynamic set of WebSocket connections to
//! untrusted relays, fans out incoming events, aggregates publish
//! acknowledgements, and survives relay churn.
//!
//! The core is a cache, not a database — see [`store::EventStore`] for the
//! persistence boundary and [`store::Verifier`] for signature checking.
//! Build a [`PoolContext`] once per application; hand out [`PoolHandle`]s
//! to callers that need to issue queries and publishes.

pub mod buffer;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod filter;
pub mod publish;
pub mod relay;
pub mod relay_url;
pub mod state;
pub mod store;
pub mod subid;

pub use config::{PoolConfig, QuerySource};
pub use context::{PoolContext, PoolHandle};
pub use error::{Error, Result};
pub use event::{Event, EventId, Pubkey, Tag};
pub use filter::Filter;
pub use publish::{PublishOutcome, PublishResponse};
pub use relay::agent::{AgentEvent, ConnectionPhase, RelayAgent};
pub use relay::message::{ClientMessage, RelayMessage};
pub use relay_url::RelayUrl;
pub use state::{ClosedSnapshot, PoolState, RelayDiagnostic, RelayViewPhase, SubscriptionSnapshot};
pub use store::{AlwaysVerify, EventStore, ModelRegistry, NullEventStore, Verifier};
pub use subid::SubscriptionId;
