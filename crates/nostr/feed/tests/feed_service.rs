//! End-to-end feed behavior against in-process relays.

mod common;

use common::{WAIT, client_config, endpoint, like, make, pubkey};
use nostr_client::testing::MockRelay;
use nostr_client::{BusEvent, Filter, RelayPool};
use nostr_core::{Event, unix_now};
use nostr_feed::{
    AggregatedPost, FEED_SUBSCRIPTION_ID, FeedConfig, FeedService, REACTIONS_SUBSCRIPTION_ID,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn feed_config() -> FeedConfig {
    FeedConfig {
        coalesce_window_ms: 20,
        fetch_timeout_ms: 1_000,
        ..Default::default()
    }
}

async fn wait_for_view(feed: &FeedService, check: impl Fn(&[AggregatedPost]) -> bool) -> bool {
    timeout(WAIT, async {
        while !check(&feed.view()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

fn profile(author: &str, created_at: u64, name: &str) -> Event {
    make(author, 0, created_at, vec![], &json!({ "name": name }).to_string())
}

#[tokio::test]
async fn test_fifty_pictures_then_eose() {
    let relay = MockRelay::start().await.unwrap();
    let author = pubkey(1);
    // Stored out of time order
    relay.store((0..50u64).map(|i| {
        make(&author, 20, 1_000 + (i * 37) % 50, vec![], &format!("picture {}", i))
    }));
    relay.store((0..5u64).map(|i| make(&author, 1, 2_000 + i, vec![], "not a picture")));

    let pool = RelayPool::new(client_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);
    let feed = FeedService::start(
        Arc::clone(&pool),
        FeedConfig {
            post_kinds: vec![20],
            ..feed_config()
        },
    )
    .unwrap();

    let mut bus = pool.subscribe_events();
    assert_eq!(feed.subscribe_posts(Some(50)), 1);
    timeout(WAIT, async {
        loop {
            if let Ok(BusEvent::AllEose { subscription_id }) = bus.recv().await
                && subscription_id == FEED_SUBSCRIPTION_ID
            {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert!(wait_for_view(&feed, |view| view.len() == 50).await);
    let view = feed.view();
    assert!(view.iter().all(|post| post.event.kind == 20));
    assert!(
        view.windows(2)
            .all(|pair| pair[0].created_at() > pair[1].created_at())
    );
    assert_eq!(view[0].created_at(), 1_049);
    assert_eq!(
        relay.received_of("REQ")[0],
        json!(["REQ", "feed", {"kinds": [20], "limit": 50}])
    );
}

#[tokio::test]
async fn test_redundant_relays_do_not_inflate_counts() {
    let alice = pubkey(1);
    let first = make(&alice, 1, 100, vec![], "first");
    let second = make(&alice, 1, 200, vec![], "second");
    let shared = vec![
        first.clone(),
        second.clone(),
        like(&pubkey(10), &first, 110),
        like(&pubkey(11), &first, 120),
        like(&pubkey(12), &second, 210),
        profile(&alice, 50, "alice"),
    ];

    let relay_a = MockRelay::start().await.unwrap();
    let relay_b = MockRelay::start().await.unwrap();
    relay_a.store(shared.clone());
    relay_b.store(shared);
    relay_b.store([profile(&alice, 60, "alice v2")]);

    let pool = RelayPool::new(client_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay_a.url()), WAIT).await);
    assert!(pool.ensure_connected(&endpoint(&relay_b.url()), WAIT).await);

    let feed = FeedService::start(
        Arc::clone(&pool),
        FeedConfig {
            viewer_pubkey: Some(pubkey(10)),
            ..feed_config()
        },
    )
    .unwrap();
    assert_eq!(
        feed.subscribe(vec![
            Filter::new().kinds([1]),
            Filter::new().kinds([7]),
            Filter::new().kinds([0]),
        ]),
        2
    );

    let settled = |view: &[AggregatedPost]| {
        view.len() == 2
            && view[0].id() == second.id
            && view[0].like_count == 1
            && view[1].like_count == 2
            && view[1].liked_by_viewer
            && !view[0].liked_by_viewer
            && view.iter().all(|p| p.display_name() == "alice v2")
    };
    assert!(wait_for_view(&feed, settled).await);

    // Batched reaction and profile fetches deliver the same events again
    assert!(relay_a.wait_until(WAIT, |r| r.received_of("REQ").len() >= 3).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(settled(&feed.view()));
    assert_eq!(feed.len(), 2);
}

#[tokio::test]
async fn test_feed_survives_relay_restart() {
    let relay = MockRelay::start().await.unwrap();
    let author = pubkey(2);
    let before = make(&author, 1, 100, vec![], "before");
    relay.store([before.clone()]);

    let pool = RelayPool::new(client_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);
    let _supervisor = pool.spawn_supervisor();
    let feed = FeedService::start(Arc::clone(&pool), feed_config()).unwrap();
    feed.subscribe_posts(None);
    assert!(wait_for_view(&feed, |view| view.len() == 1).await);

    let after = make(&author, 1, 300, vec![], "after");
    relay.store([after.clone()]);
    relay.drop_connections();

    // The replayed REQ returns both events; only the new one is added
    assert!(wait_for_view(&feed, |view| view.len() == 2).await);
    let view = feed.view();
    assert_eq!(view[0].id(), after.id);
    assert_eq!(view[1].id(), before.id);
}

#[tokio::test]
async fn test_stop_closes_feed_subscription() {
    let relay = MockRelay::start().await.unwrap();
    let pool = RelayPool::new(client_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);
    let feed = FeedService::start(Arc::clone(&pool), feed_config()).unwrap();
    feed.subscribe_posts(Some(10));
    assert!(pool.registry().contains(FEED_SUBSCRIPTION_ID));

    feed.stop();
    assert!(!pool.registry().contains(FEED_SUBSCRIPTION_ID));
    assert!(!pool.registry().contains(REACTIONS_SUBSCRIPTION_ID));
    assert!(
        relay
            .wait_until(WAIT, |r| r
                .received_of("CLOSE")
                .iter()
                .any(|frame| frame[1] == FEED_SUBSCRIPTION_ID))
            .await
    );
}

#[tokio::test]
async fn test_other_subscriptions_stay_out_of_feed() {
    let relay = MockRelay::start().await.unwrap();
    relay.store([make(&pubkey(3), 1, 100, vec![], "bitcoin search hit")]);

    let pool = RelayPool::new(client_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);
    let feed = FeedService::start(Arc::clone(&pool), feed_config()).unwrap();

    let hits = pool.search("bitcoin", &[1], None, WAIT).await;
    assert_eq!(hits.len(), 1);
    pool.subscribe("elsewhere", vec![Filter::new().kinds([1])]);
    assert!(relay.wait_until(WAIT, |r| r.received_of("REQ").len() == 2).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(feed.is_empty());
    assert!(feed.view().is_empty());
}

#[tokio::test]
async fn test_like_after_backlog_is_counted() {
    let relay = MockRelay::start().await.unwrap();
    let post = make(&pubkey(4), 1, 100, vec![], "like me later");
    relay.store([post.clone()]);

    let pool = RelayPool::new(client_config()).unwrap();
    assert!(pool.ensure_connected(&endpoint(&relay.url()), WAIT).await);
    let feed = FeedService::start(Arc::clone(&pool), feed_config()).unwrap();
    feed.subscribe_posts(Some(10));
    assert!(wait_for_view(&feed, |view| view.len() == 1).await);

    // The backlog fetch found nothing; the standing reaction REQ follows it
    assert!(
        relay
            .wait_until(WAIT, |r| r
                .received_of("REQ")
                .iter()
                .any(|frame| frame[1] == REACTIONS_SUBSCRIPTION_ID))
            .await
    );
    assert_eq!(feed.view()[0].like_count, 0);

    relay.broadcast(like(&pubkey(5), &post, unix_now()));
    assert!(wait_for_view(&feed, |view| view[0].like_count == 1).await);

    relay.broadcast(like(&pubkey(6), &post, unix_now()));
    assert!(wait_for_view(&feed, |view| view[0].like_count == 2).await);
}
