//! Pool, connection and dispatch behavior against an in-process relay.

mod common;

use common::{WAIT, dead_endpoint, endpoint, event, test_config};
use nostr_client::testing::MockRelay;
use nostr_client::{BusEvent, ClientConfig, ConnectionStatus, Filter, RelayPool};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

async fn wait_for_status(pool: &RelayPool, check: impl Fn(&ConnectionStatus) -> bool) -> bool {
    timeout(WAIT, async {
        while !check(&pool.status()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_ensure_connected() {
    let relay = MockRelay::start().await.unwrap();
    let pool = RelayPool::new(test_config()).unwrap();

    let live = endpoint(&relay.url());
    assert!(pool.ensure_connected(&live, WAIT).await);
    assert_eq!(pool.connected_endpoints(), vec![live.clone()]);
    assert_eq!(pool.status(), ConnectionStatus::Connected);

    // Already connected: no second connection is opened
    assert!(pool.ensure_connected(&live, WAIT).await);
    assert_eq!(relay.accepted_count(), 1);

    let dead = dead_endpoint().await;
    assert!(!pool.ensure_connected(&dead, Duration::from_secs(2)).await);
    assert_eq!(pool.connected_endpoints(), vec![live]);
}

#[tokio::test]
async fn test_events_then_eose_in_order() {
    let relay = MockRelay::start().await.unwrap();
    let a = event(1, 100, "A");
    let b = event(1, 200, "B");
    relay.store([a.clone(), b.clone()]);
    relay.set_frame_delay(Duration::from_millis(25));

    let pool = RelayPool::new(test_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);
    let mut rx = pool.subscribe_events();
    assert_eq!(pool.subscribe("notes", vec![Filter::new().kinds([1])]), 1);

    let mut observed = Vec::new();
    timeout(WAIT, async {
        loop {
            match rx.recv().await.unwrap() {
                BusEvent::Event {
                    subscription_id,
                    event,
                    ..
                } if subscription_id == "notes" => observed.push(event.content),
                BusEvent::Eose {
                    subscription_id, ..
                } if subscription_id == "notes" => observed.push("EOSE".to_string()),
                BusEvent::AllEose { subscription_id } if subscription_id == "notes" => {
                    observed.push("ALL".to_string());
                    break;
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(observed, vec!["A", "B", "EOSE", "ALL"]);
}

#[tokio::test]
async fn test_explicit_reconnect_replays_subscription() {
    let relay = MockRelay::start().await.unwrap();
    let pool = RelayPool::new(test_config()).unwrap();
    let live = endpoint(&relay.url());
    assert!(pool.ensure_connected(&live, WAIT).await);

    pool.subscribe("feed", vec![Filter::new().kinds([20]).limit(50)]);
    assert!(relay.wait_until(WAIT, |r| r.received_of("REQ").len() == 1).await);

    relay.drop_connections();
    assert!(wait_for_status(&pool, |s| s.is_terminal()).await);

    let started = pool.reconnect(None);
    assert_eq!(started, vec![live]);
    assert!(relay.wait_until(WAIT, |r| r.received_of("REQ").len() == 2).await);

    let reqs = relay.received_of("REQ");
    assert_eq!(reqs[0], reqs[1]);
    assert_eq!(reqs[1], json!(["REQ", "feed", {"kinds": [20], "limit": 50}]));
}

#[tokio::test]
async fn test_supervisor_reconnects_and_replays_latest_filters() {
    let relay = MockRelay::start().await.unwrap();
    let pool = RelayPool::new(test_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);
    let _supervisor = pool.spawn_supervisor();

    pool.subscribe("feed", vec![Filter::new().kinds([1])]);
    // Replacing the filters while connected resends them
    pool.subscribe("feed", vec![Filter::new().kinds([20])]);
    assert!(relay.wait_until(WAIT, |r| r.received_of("REQ").len() == 2).await);

    relay.drop_connections();
    assert!(relay.wait_until(WAIT, |r| r.accepted_count() == 2).await);
    assert!(relay.wait_until(WAIT, |r| r.received_of("REQ").len() == 3).await);

    let replayed = relay.received_of("REQ").pop().unwrap();
    assert_eq!(replayed, json!(["REQ", "feed", {"kinds": [20]}]));
    assert!(wait_for_status(&pool, |s| s.is_connected()).await);
}

fn fast_keepalive() -> ClientConfig {
    ClientConfig {
        ping_interval_ms: 50,
        idle_timeout_ms: 200,
        ..test_config()
    }
}

#[tokio::test]
async fn test_answered_pings_keep_connection_alive() {
    let relay = MockRelay::start().await.unwrap();
    let pool = RelayPool::new(fast_keepalive()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);

    // Five pings span more than the idle timeout; the pongs count as traffic
    assert!(relay.wait_until(WAIT, |r| r.ping_count() >= 5).await);
    assert_eq!(pool.status(), ConnectionStatus::Connected);
    assert_eq!(relay.accepted_count(), 1);
}

#[tokio::test]
async fn test_silent_relay_times_out_and_is_reconnected() {
    let relay = MockRelay::start().await.unwrap();
    relay.set_silent(true);
    let pool = RelayPool::new(fast_keepalive()).unwrap();
    let mut rx = pool.subscribe_events();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);
    let _supervisor = pool.spawn_supervisor();

    let reason = timeout(WAIT, async {
        loop {
            if let Ok(BusEvent::Status {
                status: ConnectionStatus::Error(reason),
                ..
            }) = rx.recv().await
            {
                return reason;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reason, "idle timeout");
    assert!(relay.wait_until(WAIT, |r| r.accepted_count() >= 2).await);
}

#[tokio::test]
async fn test_publish_with_one_relay_connected_and_one_in_error() {
    let relay = MockRelay::start().await.unwrap();
    let pool = RelayPool::new(test_config()).unwrap();
    let live = endpoint(&relay.url());
    let dead = dead_endpoint().await;

    pool.connect(&[live.clone(), dead.clone()]);
    assert!(pool.ensure_connected(&live, WAIT).await);
    assert!(
        timeout(WAIT, async {
            while !pool
                .statuses()
                .iter()
                .any(|(e, s)| *e == dead && matches!(s, ConnectionStatus::Error(_)))
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    );

    let note = event(1, 1, "hello relays");
    assert!(pool.publish(&note));
    assert!(relay.wait_until(WAIT, |r| r.received_of("EVENT").len() == 1).await);
    assert_eq!(relay.received_of("EVENT")[0][1]["id"], note.id.as_str());
    assert_eq!(pool.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_all_relays_in_error() {
    let pool = RelayPool::new(test_config()).unwrap();
    pool.connect(&[dead_endpoint().await, dead_endpoint().await]);
    assert!(wait_for_status(&pool, |s| matches!(s, ConnectionStatus::Error(_))).await);
    assert!(!pool.publish(&event(1, 1, "nobody listens")));
}

#[tokio::test]
async fn test_query_collects_until_eose() {
    let relay = MockRelay::start().await.unwrap();
    relay.store([event(1, 1, "one"), event(1, 2, "two"), event(7, 3, "+")]);
    let pool = RelayPool::new(test_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);

    let events = pool.query(vec![Filter::new().kinds([1])], WAIT).await;
    assert_eq!(events.len(), 2);
    // The one-shot subscription is cleaned up and closed on the relay
    assert!(pool.registry().is_empty());
    assert!(relay.wait_until(WAIT, |r| r.received_of("CLOSE").len() == 1).await);
}

#[tokio::test]
async fn test_search_is_scoped_to_given_relays() {
    let search_relay = MockRelay::start().await.unwrap();
    let plain_relay = MockRelay::start().await.unwrap();
    search_relay.store([event(1, 1, "bitcoin is here")]);
    let pool = RelayPool::new(test_config()).unwrap();
    let search_endpoint = endpoint(&search_relay.url());
    assert!(pool.ensure_connected(&search_endpoint, WAIT).await);
    assert!(pool.ensure_connected(&endpoint(&plain_relay.url()), WAIT).await);

    let results = pool
        .search("bitcoin", &[1], Some(vec![search_endpoint]), WAIT)
        .await;
    assert_eq!(results.len(), 1);
    assert!(plain_relay.received_of("REQ").is_empty());
    assert_eq!(search_relay.received_of("REQ")[0][2]["search"], "bitcoin");
}

#[tokio::test]
async fn test_unsubscribe_immediately_after_subscribe() {
    let relay = MockRelay::start().await.unwrap();
    relay.set_frame_delay(Duration::from_millis(50));
    relay.store([event(1, 1, "late")]);
    let pool = RelayPool::new(test_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);

    pool.subscribe("short", vec![Filter::new()]);
    assert!(pool.unsubscribe("short"));
    assert!(pool.registry().is_empty());

    // Late frames for the removed subscription are still dispatched harmlessly
    assert!(relay.wait_until(WAIT, |r| r.received_of("CLOSE").len() == 1).await);
    assert!(pool.registry().is_empty());
}

#[tokio::test]
async fn test_relay_closed_frame_completes_subscription() {
    let relay = MockRelay::start().await.unwrap();
    relay.inject(r#"["CLOSED","guarded","auth-required: sign in first"]"#);
    let pool = RelayPool::new(test_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);
    let mut rx = pool.subscribe_events();
    pool.subscribe("guarded", vec![Filter::new()]);

    let closed = timeout(WAIT, async {
        loop {
            if let Ok(BusEvent::Closed { message, .. }) = rx.recv().await {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert!(closed.starts_with("auth-required"));
}

#[tokio::test]
async fn test_disconnect_stops_everything() {
    let relay = MockRelay::start().await.unwrap();
    let pool = RelayPool::new(test_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);

    pool.disconnect();
    assert!(pool.connected_endpoints().is_empty());
    assert!(pool.statuses().is_empty());
    assert!(relay.wait_until(WAIT, |r| r.connection_count() == 0).await);
    // Nothing left for the supervisor to bring back
    assert!(pool.supervise().is_empty());
}
