use std::{env, future::Future, time::Duration};

use redis::aio::ConnectionManager;

use crate::{KeyPrefix, Limiter, LimiterOptions};

pub(super) fn block_on<F: Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(f)
}

pub(super) async fn sleep(d: Duration) {
    tokio::time::sleep(d).await;
}

/// Redis tests are skipped when `REDIS_URL` is not set.
pub(super) fn redis_url() -> Option<String> {
    env::var("REDIS_URL").ok()
}

pub(super) fn unique_prefix(namespace: &str) -> KeyPrefix {
    let n: u64 = rand::random();
    KeyPrefix::try_from(format!("admission_test_{n}:{namespace}:")).unwrap()
}

pub(super) struct TestStore {
    pub(super) limiter: Limiter,
    pub(super) conn: ConnectionManager,
    pub(super) rate_prefix: KeyPrefix,
    pub(super) concurrency_prefix: KeyPrefix,
}

impl TestStore {
    pub(super) fn rate_key(&self, key: &str) -> String {
        format!("{}{}", &*self.rate_prefix, key)
    }

    pub(super) fn concurrency_key(&self, key: &str) -> String {
        format!("{}{}", &*self.concurrency_prefix, key)
    }
}

pub(super) async fn build_store(url: &str) -> TestStore {
    let client = redis::Client::open(url).unwrap();
    let conn = client.get_connection_manager().await.unwrap();
    let rate_prefix = unique_prefix("rate");
    let concurrency_prefix = unique_prefix("concurrency");

    let limiter = Limiter::new(LimiterOptions {
        connection_manager: conn.clone(),
        rate_prefix: Some(rate_prefix.clone()),
        concurrency_prefix: Some(concurrency_prefix.clone()),
        timeout: Some(Duration::from_secs(5)),
    })
    .unwrap();

    TestStore {
        limiter,
        conn,
        rate_prefix,
        concurrency_prefix,
    }
}

#[track_caller]
pub(super) fn assert_near(actual: Duration, expected: Duration, tolerance: Duration) {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };

    assert!(
        diff <= tolerance,
        "expected {actual:?} to be within {tolerance:?} of {expected:?}"
    );
}
