//! End-to-end scenarios against a locally-run relay (spec §8's testable
//! properties), using `nostr-relay-builder` for the relay side and `nostr`
//! purely to sign well-formed test events — this crate's own `Event` is
//! fed from their JSON, never the other way around.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostr::{EventBuilder, Keys};
use nostr_relay_builder::{LocalRelay, RelayBuilder};

use relaypool::{Event, Filter, PoolConfig, PoolContext, QuerySource, RelayUrl, SubscriptionId};

async fn start_relay() -> LocalRelay {
    LocalRelay::run(RelayBuilder::default())
        .await
        .expect("local relay starts")
}

fn relay_url(relay: &LocalRelay) -> RelayUrl {
    RelayUrl::parse(&relay.url()).expect("local relay serves a ws:// url")
}

fn signed_note(keys: &Keys, content: &str) -> Event {
    let note = EventBuilder::text_note(content)
        .sign_with_keys(keys)
        .expect("test event signs");
    Event::from_json(&note.as_json()).expect("nostr event decodes as relaypool::Event")
}

/// S1: a blocking query returns an event this same pool just published.
#[tokio::test(flavor = "multi_thread")]
async fn blocking_query_returns_a_published_event() {
    let relay = start_relay().await;
    let url = relay_url(&relay);

    let ctx = PoolContext::new(PoolConfig::default());
    let handle = ctx.handle();

    let keys = Keys::generate();
    let event = signed_note(&keys, "hello from a test");

    let publish = handle
        .publish(vec![event.clone()], vec![url.clone()])
        .await
        .expect("publish resolves");
    let outcomes = &publish.results[&event.id];
    assert!(outcomes.iter().any(|(_, o)| o.accepted));

    let results = handle
        .query(
            SubscriptionId::new("s1"),
            vec![Filter::new().authors([keys.public_key().to_hex()])],
            QuerySource::new(vec![url], false),
        )
        .await
        .expect("blocking query resolves");

    assert!(results.iter().any(|e| e.id == event.id));
}

/// S2: the same event seen on two relays is delivered exactly once.
#[tokio::test(flavor = "multi_thread")]
async fn query_deduplicates_the_same_event_across_two_relays() {
    let relay_a = start_relay().await;
    let relay_b = start_relay().await;
    let url_a = relay_url(&relay_a);
    let url_b = relay_url(&relay_b);

    let ctx = PoolContext::new(PoolConfig::default());
    let handle = ctx.handle();

    let keys = Keys::generate();
    let event = signed_note(&keys, "same note, two relays");

    handle
        .publish(vec![event.clone()], vec![url_a.clone(), url_b.clone()])
        .await
        .expect("publish resolves");

    let results = handle
        .query(
            SubscriptionId::new("s2"),
            vec![Filter::new().authors([keys.public_key().to_hex()])],
            QuerySource::new(vec![url_a, url_b], false),
        )
        .await
        .expect("blocking query resolves");

    assert_eq!(results.iter().filter(|e| e.id == event.id).count(), 1);
}

/// S3: a relay that never accepts a connection keeps getting reconnect
/// attempts scheduled rather than being given up on after the first failure.
#[tokio::test(flavor = "multi_thread")]
async fn agent_keeps_scheduling_reconnect_attempts_against_an_unreachable_relay() {
    let url = RelayUrl::parse("wss://127.0.0.1:1").unwrap(); // nothing listens here

    let mut config = PoolConfig::default();
    config.health_check_interval = Duration::from_millis(50);
    let ctx = PoolContext::new(config);
    let handle = ctx.handle();

    let sub_id = SubscriptionId::new("s3");
    handle
        .query(
            sub_id.clone(),
            vec![Filter::new().kinds([1])],
            QuerySource::new(vec![url.clone()], true),
        )
        .await
        .expect("streaming subscribe resolves immediately");

    let last_state = Arc::new(Mutex::new(None));
    let s = last_state.clone();
    handle
        .observe_state(move |state| *s.lock().unwrap() = Some(state.clone()))
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        handle.perform_health_check(false).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let attempts = last_state
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|state| state.subscriptions.get(&sub_id))
            .and_then(|sub| sub.relays.get(&url))
            .map(|diag| diag.reconnect_attempts)
            .unwrap_or(0);
        if attempts >= 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for a second reconnect attempt"
        );
    }
}

/// S4: closing a subscription to one of two target relays leaves it open
/// against the other; closing the second relay fully closes it.
#[tokio::test(flavor = "multi_thread")]
async fn close_subscriptions_to_relays_only_fully_closes_once_every_relay_is_gone() {
    let relay_a = start_relay().await;
    let relay_b = start_relay().await;
    let url_a = relay_url(&relay_a);
    let url_b = relay_url(&relay_b);

    let ctx = PoolContext::new(PoolConfig::default());
    let handle = ctx.handle();

    let sub_id = SubscriptionId::new("s4");
    handle
        .query(
            sub_id.clone(),
            vec![Filter::new().kinds([1])],
            QuerySource::new(vec![url_a.clone(), url_b.clone()], true),
        )
        .await
        .expect("streaming subscribe resolves immediately");

    let closed = handle
        .close_subscriptions_to_relays(vec![url_a])
        .await
        .expect("close resolves");
    assert!(!closed.contains(&sub_id));

    let closed = handle
        .close_subscriptions_to_relays(vec![url_b])
        .await
        .expect("close resolves");
    assert!(closed.contains(&sub_id));
}

/// S5: publishing to one reachable and one unreachable relay reports both
/// outcomes instead of letting the unreachable one block the reachable one.
#[tokio::test(flavor = "multi_thread")]
async fn publish_reports_mixed_outcomes_for_reachable_and_unreachable_relays() {
    let relay = start_relay().await;
    let url_online = relay_url(&relay);
    let url_offline = RelayUrl::parse("wss://127.0.0.1:1").unwrap();

    let mut config = PoolConfig::default();
    config.publish_timeout = Duration::from_millis(500);
    let ctx = PoolContext::new(config);
    let handle = ctx.handle();

    let keys = Keys::generate();
    let event = signed_note(&keys, "mixed reachability");

    let response = handle
        .publish(vec![event.clone()], vec![url_online.clone(), url_offline.clone()])
        .await
        .expect("publish resolves despite one relay being unreachable");

    let outcomes = &response.results[&event.id];
    let relays: HashSet<RelayUrl> = outcomes.iter().map(|(r, _)| r.clone()).collect();
    assert_eq!(relays, HashSet::from([url_online.clone(), url_offline.clone()]));
    assert!(outcomes.iter().any(|(r, o)| *r == url_online && o.accepted));
    assert!(outcomes.iter().any(|(r, o)| *r == url_offline && !o.accepted));
}

/// S6: rapid state mutations coalesce into far fewer observer callbacks than
/// mutations, per the `PoolStateNotifier` throttle.
#[tokio::test(flavor = "multi_thread")]
async fn rapid_mutations_are_coalesced_by_the_state_throttle() {
    let mut config = PoolConfig::default();
    config.throttle_duration = Duration::from_millis(200);
    let ctx = PoolContext::new(config);
    let handle = ctx.handle();

    let emitted = Arc::new(AtomicUsize::new(0));
    let counter = emitted.clone();
    handle
        .observe_state(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    for _ in 0..20 {
        handle.perform_health_check(false).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let count = emitted.load(Ordering::SeqCst);
    assert!(count >= 1);
    assert!(count < 20, "expected the throttle to coalesce snapshots, got {count}");
}
