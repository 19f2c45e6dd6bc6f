//! Rate gate against a real Redis server.
//!
//! Needs `REDIS_URL` and is skipped when it is unset. Each test uses its own
//! quota key, so runs against a shared server do not interfere.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::future::join_all;
use herald_core::RealClock;
use herald_dispatch::{
    rate_gate::{Admission, RateGate, RateGateConfig, RateStore, RedisRateStore},
    RatePermit,
};
use herald_testing::Invariants;

/// Grant times are read on the client after the script returns, so two
/// grants may look closer together than the server counted them.
const CLIENT_SKEW: Duration = Duration::from_millis(50);

async fn redis_store() -> Option<RedisRateStore> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set, skipping");
        return None;
    };
    Some(RedisRateStore::connect(&url).await.unwrap())
}

fn unique_identity(test: &str) -> String {
    format!("{test}-{}-{:08x}", std::process::id(), rand::random::<u32>())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_concurrent_acquirers_share_one_redis_window() {
    let Some(store) = redis_store().await else { return };
    let config = RateGateConfig::default();
    let gate = Arc::new(RateGate::new(Arc::new(store), Arc::new(RealClock::new()), config.clone()));
    let identity = unique_identity("bound");

    let started = Instant::now();
    let permits = join_all((0..100).map(|_| {
        let gate = gate.clone();
        let identity = identity.clone();
        tokio::spawn(async move { gate.acquire(&identity).await })
    }))
    .await;
    let elapsed = started.elapsed();

    let grants: Vec<Instant> = permits
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .map(|permit: RatePermit| permit.granted_at())
        .collect();

    assert_eq!(grants.len(), 100);
    Invariants::window_rate_bound(&grants, 23, config.window - CLIENT_SKEW).unwrap();

    // 100 grants at 23 per window span at least four full windows.
    assert!(elapsed >= config.window * 4 - CLIENT_SKEW, "finished in {elapsed:?}");
}

#[tokio::test]
async fn full_window_reports_the_wait_until_the_oldest_grant_expires() {
    let Some(store) = redis_store().await else { return };
    let key = format!("mailing:send:{}", unique_identity("wait"));
    let window = Duration::from_secs(2);

    for _ in 0..3 {
        assert_eq!(store.try_acquire(&key, 3, window).await.unwrap(), Admission::Granted);
    }

    match store.try_acquire(&key, 3, window).await.unwrap() {
        Admission::Wait(wait) => {
            assert!(wait > Duration::ZERO && wait <= window, "wait {wait:?}");
        },
        Admission::Granted => panic!("fourth acquisition admitted inside a rate-3 window"),
    }
}
