mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Behavior, MockRelay, event, events, id};
use nostr_client::cache::{CacheAdapter, MemoryCache, RelayStatusUpdate};
use nostr_client::sync::capability::now_millis;
use nostr_client::sync::{
    CAPABILITY_NAMESPACE, CapabilityCache, RelayOutcome, SessionState, SyncSession,
};
use nostr_client::{
    ClientError, NegentropySync, RelayCapability, SyncConfig, SyncOptions, SyncRelay,
};
use nostr::NegentropyStorage;
use serde_json::{Value, json};

const GOOD: &str = "wss://good.test/";

fn all_notes() -> Vec<Value> {
    vec![json!({"kinds": [1]})]
}

fn ids(range: impl IntoIterator<Item = u32>) -> BTreeSet<String> {
    range.into_iter().map(id).collect()
}

fn engine(cache: &Arc<MemoryCache>, relays: Vec<Arc<dyn SyncRelay>>) -> NegentropySync {
    NegentropySync::new(SyncConfig::default())
        .with_cache(cache.clone())
        .with_relays(relays)
}

#[tokio::test]
async fn overlapping_sets_converge_and_fetch_missing() {
    // local {A, B, C}, relay {B, C, D}
    let cache = Arc::new(MemoryCache::with_events(events([1, 2, 3])));
    let relay = MockRelay::new(GOOD, Behavior::Negentropy, events([2, 3, 4]));
    let sync = engine(&cache, vec![relay.clone()]);

    let result = sync.sync(all_notes(), SyncOptions::new()).await.unwrap();

    assert_eq!(result.need, ids([4]));
    assert_eq!(result.have, ids([1]));
    assert_eq!(result.events.len(), 1);
    assert_eq!(result.events[0].id, id(4));
    assert!(cache.contains(&id(4)).await);
    assert_eq!(cache.seen_on(&id(4)).await, vec![GOOD.to_string()]);

    let report = &result.reports[0];
    assert_eq!(report.outcome, RelayOutcome::Synced);
    assert_eq!((report.need, report.have, report.fetched), (1, 1, 1));
    assert_eq!(report.stats.rounds, 1);

    let capability = sync.relay_capability(GOOD).await.unwrap().unwrap();
    assert!(capability.supports_negentropy);
}

#[tokio::test]
async fn large_sets_converge_through_fingerprint_rounds() {
    let local: Vec<_> = (0..600).filter(|n| n % 97 != 0).collect();
    let remote: Vec<_> = (0..600).filter(|n| n % 89 != 5).collect();
    let cache = Arc::new(MemoryCache::with_events(events(local.iter().copied())));
    let relay = MockRelay::new(GOOD, Behavior::Negentropy, events(remote.iter().copied()));
    let sync = engine(&cache, vec![relay]);

    let result = sync
        .sync(all_notes(), SyncOptions::new().auto_fetch(false))
        .await
        .unwrap();

    let expected_need: BTreeSet<String> = remote
        .iter()
        .filter(|n| !local.contains(n))
        .map(|n| id(*n))
        .collect();
    let expected_have: BTreeSet<String> = local
        .iter()
        .filter(|n| !remote.contains(n))
        .map(|n| id(*n))
        .collect();
    assert_eq!(result.need, expected_need);
    assert_eq!(result.have, expected_have);
    assert!(result.events.is_empty());
    assert!(result.reports[0].stats.rounds > 1);
    assert!(!cache.contains(&id(0)).await);
}

#[tokio::test]
async fn each_filter_runs_its_own_session() {
    let mut reaction = event(50);
    reaction.kind = 7;
    let mut remote = events([1, 2]);
    remote.push(reaction);
    let cache = Arc::new(MemoryCache::with_events(events([1])));
    let relay = MockRelay::new(GOOD, Behavior::Negentropy, remote);
    let sync = engine(&cache, vec![relay.clone()]);

    let result = sync
        .sync(
            vec![json!({"kinds": [1]}), json!({"kinds": [7]})],
            SyncOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(relay.opens(), 2);
    assert_eq!(result.need, ids([2, 50]));
    assert_eq!(cache.len().await, 3);
}

#[tokio::test]
async fn late_relay_compares_against_the_same_local_set() {
    let cache = Arc::new(MemoryCache::with_events(events([1, 2, 3])));
    let fast = MockRelay::new(GOOD, Behavior::Negentropy, events([1, 2, 3, 4]));
    let late = MockRelay::connecting_after(
        "wss://late.test/",
        events([1, 2, 3]),
        Duration::from_millis(100),
    );
    let sync = engine(&cache, vec![fast, late]);

    let result = sync.sync(all_notes(), SyncOptions::new()).await.unwrap();

    // The fast relay's fetch lands in the cache before the late relay runs.
    assert!(cache.contains(&id(4)).await);
    assert_eq!(result.need, ids([4]));
    assert!(result.have.is_empty());
    assert!(result.need.is_disjoint(&result.have));

    let late_report = result
        .reports
        .iter()
        .find(|report| report.url == "wss://late.test/")
        .unwrap();
    assert_eq!(late_report.outcome, RelayOutcome::Synced);
    assert_eq!((late_report.need, late_report.have), (0, 0));
}

#[tokio::test]
async fn events_fetched_from_several_relays_are_deduplicated() {
    let cache = Arc::new(MemoryCache::new());
    let first = MockRelay::new(GOOD, Behavior::Negentropy, events([5]));
    let second = MockRelay::new("wss://second.test/", Behavior::Negentropy, events([5]));
    let sync = engine(&cache, vec![first.clone(), second.clone()]);

    let result = sync.sync(all_notes(), SyncOptions::new()).await.unwrap();

    assert_eq!(result.need, ids([5]));
    assert!(result.need.is_disjoint(&result.have));
    assert_eq!(result.events.len(), 1);
    assert_eq!(result.events[0].id, id(5));
    assert!(result.reports.iter().all(|report| report.fetched == 1));
    assert_eq!((first.fetches(), second.fetches()), (1, 1));
    assert_eq!(cache.len().await, 1);
    assert_eq!(
        cache.seen_on(&id(5)).await,
        vec![GOOD.to_string(), "wss://second.test/".to_string()]
    );
}

#[tokio::test]
async fn precondition_failures() {
    let relay = MockRelay::new(GOOD, Behavior::Negentropy, vec![]);
    let without_cache = NegentropySync::new(SyncConfig::default()).with_relays(vec![relay]);
    let error = without_cache
        .sync(all_notes(), SyncOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::CacheRequired));
    assert!(error.to_string().contains("requires a cache adapter"));

    let without_relays =
        NegentropySync::new(SyncConfig::default()).with_cache(Arc::new(MemoryCache::new()));
    let error = without_relays
        .sync(all_notes(), SyncOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::NoRelays));
    assert_eq!(error.to_string(), "No relays available for sync");
}

#[tokio::test]
async fn fresh_negative_verdict_skips_probe() {
    let cache = Arc::new(MemoryCache::new());
    let relay = MockRelay::new(GOOD, Behavior::Negentropy, events([1]));
    let capabilities = CapabilityCache::new(cache.clone(), Duration::from_secs(3600));
    capabilities
        .put(GOOD, &RelayCapability::unsupported(GOOD, "NEG-ERR: blocked"))
        .await
        .unwrap();
    let sync = engine(&cache, vec![relay.clone()]);

    let cached = capabilities.fresh(GOOD).await.unwrap().unwrap();
    let result = sync.sync(all_notes(), SyncOptions::new()).await.unwrap();

    assert_eq!(relay.opens(), 0);
    assert!(result.need.is_empty());
    assert_eq!(result.reports[0].outcome, RelayOutcome::Unsupported);
    assert_eq!(capabilities.get(GOOD).await.unwrap().unwrap(), cached);

    // Forcing a probe bypasses the cached verdict.
    let forced = SyncOptions {
        skip_capability_cache: true,
        ..SyncOptions::new()
    };
    let result = sync.sync(all_notes(), forced).await.unwrap();
    assert_eq!(relay.opens(), 1);
    assert_eq!(result.need, ids([1]));
}

#[tokio::test]
async fn stale_verdict_is_reprobed_and_overwritten() {
    let cache = Arc::new(MemoryCache::new());
    let relay = MockRelay::new(GOOD, Behavior::Negentropy, events([1]));
    let capabilities = CapabilityCache::new(cache.clone(), Duration::from_secs(3600));
    let stale = RelayCapability {
        last_checked: now_millis() - 2 * 3600 * 1000,
        ..RelayCapability::unsupported(GOOD, "old failure")
    };
    capabilities.put(GOOD, &stale).await.unwrap();
    let sync = engine(&cache, vec![relay.clone()]);

    sync.sync(all_notes(), SyncOptions::new()).await.unwrap();

    assert_eq!(relay.opens(), 1);
    let refreshed = capabilities.get(GOOD).await.unwrap().unwrap();
    assert!(refreshed.supports_negentropy);
    assert!(refreshed.last_checked > stale.last_checked);
    assert!(refreshed.last_error.is_none());
}

#[tokio::test]
async fn clearing_capability_keeps_other_metadata() {
    let cache = Arc::new(MemoryCache::new());
    cache
        .update_relay_status(
            GOOD,
            RelayStatusUpdate::new().metadata("auth", json!({"token": "abc"})),
        )
        .await
        .unwrap();
    let relay = MockRelay::new(GOOD, Behavior::Negentropy, vec![]);
    let sync = engine(&cache, vec![relay]);

    sync.sync(all_notes(), SyncOptions::new()).await.unwrap();
    assert!(sync.relay_capability(GOOD).await.unwrap().is_some());

    sync.clear_capability_cache("wss://good.test").await.unwrap();

    assert!(sync.relay_capability(GOOD).await.unwrap().is_none());
    let status = cache.get_relay_status(GOOD).await.unwrap().unwrap();
    assert_eq!(status.metadata.get("auth"), Some(&json!({"token": "abc"})));
    assert!(!status.metadata.contains_key(CAPABILITY_NAMESPACE));
}

#[tokio::test]
async fn failing_relays_do_not_fail_the_call() {
    let cache = Arc::new(MemoryCache::with_events(events([1, 2, 3])));
    let silent = MockRelay::new("wss://silent.test/", Behavior::Silent, events([9]));
    let garbage = MockRelay::new("wss://garbage.test/", Behavior::Garbage, vec![]);
    let good = MockRelay::new(GOOD, Behavior::Negentropy, events([2, 3, 4]));
    let sync = engine(&cache, vec![silent.clone(), garbage.clone(), good]);

    let failures = Arc::new(Mutex::new(Vec::new()));
    let recorded = failures.clone();
    let options = SyncOptions {
        session_timeout: Some(Duration::from_millis(200)),
        ..SyncOptions::new()
    }
    .on_relay_error(move |url, error| {
        if let Ok(mut failures) = recorded.lock() {
            failures.push((url.to_string(), error.is_liveness()));
        }
    });

    let result = sync.sync(all_notes(), options).await.unwrap();

    assert_eq!(result.need, ids([4]));
    assert_eq!(result.have, ids([1]));

    let mut failures = failures.lock().unwrap().clone();
    failures.sort();
    assert_eq!(
        failures,
        vec![
            ("wss://garbage.test/".to_string(), false),
            ("wss://silent.test/".to_string(), true),
        ]
    );

    // Decode failures are cached as unsupported; timeouts are not cached.
    let garbage_verdict = sync
        .relay_capability("wss://garbage.test/")
        .await
        .unwrap()
        .unwrap();
    assert!(!garbage_verdict.supports_negentropy);
    assert!(sync.relay_capability("wss://silent.test/").await.unwrap().is_none());
}

#[tokio::test]
async fn unreachable_relay_is_skipped_without_callback() {
    let cache = Arc::new(MemoryCache::new());
    let offline = MockRelay::new("wss://offline.test/", Behavior::Offline, events([1]));
    let good = MockRelay::new(GOOD, Behavior::Negentropy, events([2]));
    let sync = engine(&cache, vec![offline.clone(), good]);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let options = SyncOptions::new().on_relay_error(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let result = sync.sync(all_notes(), options).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.need, ids([2]));
    let offline_report = result
        .reports
        .iter()
        .find(|report| report.url == "wss://offline.test/")
        .unwrap();
    assert_eq!(offline_report.outcome, RelayOutcome::Unreachable);
    assert!(sync.relay_capability("wss://offline.test/").await.unwrap().is_none());

    let status = cache
        .get_relay_status("wss://offline.test/")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.consecutive_failures, 1);
}

#[tokio::test]
async fn relay_rejections_are_cached_as_unsupported() {
    for (behavior, marker) in [
        (Behavior::NegErr, "NEG-ERR"),
        (Behavior::UnsupportedNotice, "NOTICE"),
    ] {
        let cache = Arc::new(MemoryCache::new());
        let relay = MockRelay::new(GOOD, behavior, vec![]);
        let sync = engine(&cache, vec![relay.clone()]);

        let result = sync.sync(all_notes(), SyncOptions::new()).await.unwrap();
        assert_eq!(result.reports[0].outcome, RelayOutcome::Partial);

        let verdict = sync.relay_capability(GOOD).await.unwrap().unwrap();
        assert!(!verdict.supports_negentropy);
        assert!(verdict.last_error.unwrap().contains(marker));

        // The next call trusts the verdict.
        sync.sync(all_notes(), SyncOptions::new()).await.unwrap();
        assert_eq!(relay.opens(), 1);
    }
}

#[tokio::test]
async fn overall_timeout_bounds_the_call() {
    let cache = Arc::new(MemoryCache::new());
    let silent = MockRelay::new("wss://silent.test/", Behavior::Silent, vec![]);
    let sync = engine(&cache, vec![silent]);

    let started = tokio::time::Instant::now();
    let result = sync
        .sync(
            all_notes(),
            SyncOptions::new().overall_timeout(Duration::from_millis(150)),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.reports[0].outcome, RelayOutcome::Partial);
    assert!(result.reports[0].error.as_deref().unwrap().contains("exceeded"));
}

#[tokio::test]
async fn check_relay_support_uses_cache() {
    let cache = Arc::new(MemoryCache::new());
    let good = MockRelay::new(GOOD, Behavior::Negentropy, events([1]));
    let notice = MockRelay::new("wss://notice.test/", Behavior::UnsupportedNotice, vec![]);
    let sync = engine(&cache, vec![good.clone(), notice.clone()]);

    assert!(sync.check_relay_support(GOOD).await.unwrap());
    assert!(sync.check_relay_support(GOOD).await.unwrap());
    assert_eq!(good.opens(), 1);

    assert!(!sync.check_relay_support("wss://notice.test").await.unwrap());
    assert!(matches!(
        sync.check_relay_support("wss://elsewhere.test").await,
        Err(ClientError::InvalidRequest(_))
    ));

    let supported = sync.negentropy_relays().await.unwrap();
    let urls: Vec<&str> = supported.iter().map(|relay| relay.url()).collect();
    assert_eq!(urls, vec![GOOD]);
    assert_eq!(good.opens(), 1);
    assert_eq!(notice.opens(), 1);
}

#[tokio::test]
async fn session_reports_partial_results_on_timeout() {
    let silent = MockRelay::new("wss://silent.test/", Behavior::Silent, vec![]);
    let session = SyncSession::new(
        silent,
        NegentropyStorage::default(),
        json!({}),
        0,
        Duration::from_millis(50),
    )
    .unwrap();
    assert!(session.subscription_id().starts_with("neg-"));

    let outcome = session.run().await;
    assert_eq!(outcome.state, SessionState::TimedOut);
    assert!(outcome.need.is_empty());
    assert!(matches!(outcome.error, Some(ClientError::Timeout(_))));
    assert_eq!(outcome.stats.rounds, 0);
    assert!(outcome.stats.bytes_sent > 0);
}
