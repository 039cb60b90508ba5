//! Top-level entrypoint wiring the rate limiter, the concurrency limiter and the
//! pipeline onto one Redis connection and one set of scripts.

use std::{sync::Arc, time::Duration};

use redis::aio::ConnectionManager;

use crate::{
    AdmissionError, ConcurrencyLimiter, KeyPrefix, Pipeline, RateLimiter,
    redis::{
        batch::BatchExecutor, clock, common::KeyGenerator, connection::StoreConnection,
    },
};

/// Configuration for [`Limiter`].
///
/// # Requirements
///
/// - **Redis version:** >= 6.2.0
/// - **Runtime:** Tokio
///
/// # Examples
///
/// ```no_run
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// use std::time::Duration;
/// use redis_admission::{KeyPrefix, Limiter, LimiterOptions};
///
/// let client = redis::Client::open("redis://127.0.0.1:6379/")?;
/// let connection_manager = client.get_connection_manager().await?;
///
/// let limiter = Limiter::new(LimiterOptions {
///     connection_manager,
///     rate_prefix: Some(KeyPrefix::try_from("myapp:rate:")?),
///     concurrency_prefix: None,
///     timeout: Some(Duration::from_millis(250)),
/// })?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LimiterOptions {
    /// Redis connection manager from the `redis` crate.
    ///
    /// It is cloned for every round trip; the underlying connection is shared.
    pub connection_manager: ConnectionManager,

    /// Prefix of the rate limit bucket keys. Defaults to `"rate:"`.
    pub rate_prefix: Option<KeyPrefix>,

    /// Prefix of the concurrency slot keys. Defaults to `"concurrency:"`.
    ///
    /// Neither prefix may start with the other, so the two key spaces never meet.
    pub concurrency_prefix: Option<KeyPrefix>,

    /// Upper bound for each round trip to Redis. `None` waits indefinitely.
    ///
    /// A round trip that times out fails with [`AdmissionError::Timeout`]; whether
    /// Redis applied it is unknown.
    pub timeout: Option<Duration>,
}

/// Distributed admission control on top of Redis.
///
/// Cheap to clone; clones share the connection and the script registry.
///
/// # Examples
///
/// ```no_run
/// # async fn run(limiter: redis_admission::Limiter) -> Result<(), redis_admission::AdmissionError> {
/// use std::time::Duration;
/// use redis_admission::{ConcurrencyLimit, Limit};
///
/// let decision = limiter.rate().allow("user_123", &Limit::per_second(10)).await?;
/// if !decision.is_allowed() {
///     // send 429, retry after decision.retry_after
/// }
///
/// let limit = ConcurrencyLimit::new(4).with_request_max_duration(Duration::from_secs(30));
/// let slot = limiter.concurrency().take("export_jobs", "req-42", &limit).await?;
/// if slot.allowed {
///     // ... do the work ...
///     limiter.concurrency().release("export_jobs", "req-42", &limit).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Limiter {
    executor: Arc<BatchExecutor>,
    rate: RateLimiter,
    concurrency: ConcurrencyLimiter,
}

impl Limiter {
    /// Create a new [`Limiter`].
    ///
    /// Scripts are loaded lazily on first use; call [`Limiter::load_scripts`] to load
    /// them up front.
    pub fn new(options: LimiterOptions) -> Result<Self, AdmissionError> {
        let keys = KeyGenerator::new(
            options.rate_prefix.unwrap_or_else(KeyPrefix::default_rate),
            options
                .concurrency_prefix
                .unwrap_or_else(KeyPrefix::default_concurrency),
        )?;

        let executor = BatchExecutor::new(StoreConnection::new(
            options.connection_manager,
            options.timeout,
        ));

        Ok(Self {
            rate: RateLimiter::new(executor.clone(), keys.clone()),
            concurrency: ConcurrencyLimiter::new(executor.clone(), keys),
            executor,
        })
    }

    /// Access the rate limiter.
    pub fn rate(&self) -> &RateLimiter {
        &self.rate
    }

    /// Access the concurrency limiter.
    pub fn concurrency(&self) -> &ConcurrencyLimiter {
        &self.concurrency
    }

    /// Start a batch of checks sent together.
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(self)
    }

    /// Register all scripts with Redis.
    ///
    /// Checks reload scripts on their own when Redis has dropped them, so calling this
    /// is optional.
    pub async fn load_scripts(&self) -> Result<(), AdmissionError> {
        self.executor.scripts().load(self.executor.connection()).await
    }

    /// Current Redis server time, as a duration since the Unix epoch.
    ///
    /// This is the clock every admission decision is made against.
    pub async fn server_time(&self) -> Result<Duration, AdmissionError> {
        clock::server_time(self.executor.connection()).await
    }

    #[cfg(test)]
    pub(crate) fn script_generation(&self) -> u64 {
        self.executor.scripts().generation()
    }
}
