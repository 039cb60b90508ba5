use std::time::Duration;

use redis::AsyncCommands;

use crate::{AdmissionError, Limit};

use super::support::{assert_near, block_on, build_store, redis_url, sleep};

const TOLERANCE: Duration = Duration::from_millis(50);

#[test]
fn allow_n_drains_and_refuses() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let rate = store.limiter.rate();
        let limit = Limit::per_second(10);

        let res = rate.allow("k", &limit).await.unwrap();
        assert_eq!(res.allowed, 1);
        assert_eq!(res.remaining, 9);
        assert_eq!(res.retry_after, None);
        assert_near(res.reset_after, Duration::from_millis(100), TOLERANCE);

        let res = rate.allow_n("k", &limit, 2).await.unwrap();
        assert_eq!(res.allowed, 2);
        assert_eq!(res.remaining, 7);
        assert_eq!(res.retry_after, None);
        assert_near(res.reset_after, Duration::from_millis(300), TOLERANCE);

        let res = rate.allow_n("k", &limit, 7).await.unwrap();
        assert_eq!(res.allowed, 7);
        assert_eq!(res.remaining, 0);
        assert_eq!(res.retry_after, None);
        assert_near(res.reset_after, Duration::from_secs(1), TOLERANCE);

        // All or nothing: a refused request consumes nothing.
        let res = rate.allow_n("k", &limit, 1000).await.unwrap();
        assert_eq!(res.allowed, 0);
        assert_eq!(res.remaining, 0);
        assert!(!res.is_allowed());
        assert_near(res.retry_after.unwrap(), Duration::from_secs(100), TOLERANCE);
        assert_near(res.reset_after, Duration::from_secs(1), TOLERANCE);

        let res = rate.allow("k", &limit).await.unwrap();
        assert_eq!(res.allowed, 0);
        assert_near(res.retry_after.unwrap(), Duration::from_millis(100), TOLERANCE);
    });
}

#[test]
fn allow_at_most_admits_what_fits() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let rate = store.limiter.rate();
        let limit = Limit::per_second(10);

        let res = rate.allow_n("k", &limit, 3).await.unwrap();
        assert_eq!(res.remaining, 7);

        let res = rate.allow_at_most("k", &limit, 10).await.unwrap();
        assert_eq!(res.allowed, 7);
        assert_eq!(res.remaining, 0);
        assert_near(res.retry_after.unwrap(), Duration::from_millis(100), TOLERANCE);
        assert_near(res.reset_after, Duration::from_secs(1), TOLERANCE);

        let res = rate.allow_at_most("k", &limit, 1000).await.unwrap();
        assert_eq!(res.allowed, 0);
        assert_eq!(res.remaining, 0);
        assert_near(res.retry_after.unwrap(), Duration::from_millis(100), TOLERANCE);
        assert_near(res.reset_after, Duration::from_secs(1), TOLERANCE);
    });
}

#[test]
fn allow_at_most_within_capacity_has_no_retry() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let limit = Limit::per_second(10);

        let res = store.limiter.rate().allow_at_most("k", &limit, 4).await.unwrap();
        assert_eq!(res.allowed, 4);
        assert_eq!(res.remaining, 6);
        assert_eq!(res.retry_after, None);
    });
}

#[test]
fn zero_cost_is_a_peek() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let rate = store.limiter.rate();
        let mut conn = store.conn.clone();
        let limit = Limit::per_second(10);

        let res = rate.allow_n("k", &limit, 0).await.unwrap();
        assert_eq!(res.allowed, 0);
        assert_eq!(res.remaining, 10);
        assert_eq!(res.retry_after, None);
        assert_eq!(res.reset_after, Duration::ZERO);

        let exists: bool = conn.exists(store.rate_key("k")).await.unwrap();
        assert!(!exists, "a peek must not create the bucket");

        rate.allow("k", &limit).await.unwrap();
        let before: String = conn.get(store.rate_key("k")).await.unwrap();

        let res = rate.allow_n("k", &limit, 0).await.unwrap();
        assert_eq!(res.allowed, 0);
        assert_eq!(res.remaining, 9);

        let res = rate.allow_at_most("k", &limit, 0).await.unwrap();
        assert_eq!(res.allowed, 0);
        assert_eq!(res.remaining, 9);
        assert_eq!(res.retry_after, None);

        let after: String = conn.get(store.rate_key("k")).await.unwrap();
        assert_eq!(before, after);
    });
}

#[test]
fn bucket_ttl_covers_drain_time() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let mut conn = store.conn.clone();

        store
            .limiter
            .rate()
            .allow_n("k", &Limit::per_second(10), 5)
            .await
            .unwrap();

        let pttl: i64 = conn.pttl(store.rate_key("k")).await.unwrap();
        assert!(pttl > 400 && pttl <= 500, "pttl = {pttl}");
    });
}

#[test]
fn burst_caps_instantaneous_admission() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let rate = store.limiter.rate();
        let limit = Limit::per_minute(60).with_burst(5);

        for expected_remaining in (0..5).rev() {
            let res = rate.allow("k", &limit).await.unwrap();
            assert_eq!(res.allowed, 1);
            assert_eq!(res.remaining, expected_remaining);
        }

        let res = rate.allow("k", &limit).await.unwrap();
        assert_eq!(res.allowed, 0);
        assert_near(res.retry_after.unwrap(), Duration::from_secs(1), TOLERANCE);
        assert_near(res.reset_after, Duration::from_secs(5), TOLERANCE);
    });
}

#[test]
fn capacity_refills_over_time() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let rate = store.limiter.rate();
        let limit = Limit::per_second(20);

        rate.allow_n("k", &limit, 20).await.unwrap();
        assert_eq!(rate.allow("k", &limit).await.unwrap().allowed, 0);

        sleep(Duration::from_millis(120)).await;

        let res = rate.allow("k", &limit).await.unwrap();
        assert_eq!(res.allowed, 1);
    });
}

#[test]
fn sub_millisecond_interval_retry_is_small() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let rate = store.limiter.rate();
        let limit = Limit::new(1, Duration::from_millis(1));

        for _ in 0..5 {
            let res = rate.allow("k", &limit).await.unwrap();
            if let Some(retry_after) = res.retry_after {
                assert!(retry_after <= Duration::from_millis(1), "{retry_after:?}");
            }
        }
    });
}

#[test]
fn sub_microsecond_interval_never_exceeds_burst() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let rate = store.limiter.rate();
        // 0.25µs per unit.
        let limit = Limit::new(4_000_000, Duration::from_secs(1)).with_burst(5);

        let res = rate.allow_n("k", &limit, 6).await.unwrap();
        assert_eq!(res.allowed, 0);
        assert_eq!(res.remaining, 5);

        let res = rate.allow_n("k", &limit, 5).await.unwrap();
        assert_eq!(res.allowed, 5);
        assert_eq!(res.remaining, 0);
    });
}

#[test]
fn reset_forgets_consumed_capacity() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let rate = store.limiter.rate();
        let limit = Limit::per_second(10);

        rate.allow_n("k", &limit, 10).await.unwrap();
        assert_eq!(rate.allow("k", &limit).await.unwrap().allowed, 0);

        rate.reset("k").await.unwrap();

        let res = rate.allow("k", &limit).await.unwrap();
        assert_eq!(res.allowed, 1);
        assert_eq!(res.remaining, 9);

        // Resetting a key that was never used is fine.
        rate.reset("never_used").await.unwrap();
    });
}

#[test]
fn per_key_state_is_independent() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let rate = store.limiter.rate();
        let limit = Limit::per_second(2);

        rate.allow_n("a", &limit, 2).await.unwrap();
        assert_eq!(rate.allow("a", &limit).await.unwrap().allowed, 0);

        let res = rate.allow("b", &limit).await.unwrap();
        assert_eq!(res.allowed, 1);
        assert_eq!(res.remaining, 1);
    });
}

#[test]
fn invalid_limits_are_rejected_before_contacting_redis() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let store = build_store(&url).await;
        let rate = store.limiter.rate();
        let mut conn = store.conn.clone();

        assert!(matches!(
            rate.allow("k", &Limit::per_second(0)).await,
            Err(AdmissionError::InvalidArgument(_))
        ));
        assert!(matches!(
            rate.allow_n("k", &Limit::new(1, Duration::ZERO), 1).await,
            Err(AdmissionError::InvalidArgument(_))
        ));
        assert!(matches!(
            rate.allow_at_most("k", &Limit::new(0, Duration::ZERO), 1).await,
            Err(AdmissionError::InvalidArgument(_))
        ));

        let exists: bool = conn.exists(store.rate_key("k")).await.unwrap();
        assert!(!exists);
    });
}
