use std::sync::Arc;

use redis::Script;

use crate::{
    AdmissionError, Limit, RateLimitResult,
    redis::{
        batch::{BatchExecutor, ScriptCall},
        common::KeyGenerator,
        reply,
        scripts::ScriptRegistry,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// All requested units or none.
    AllOrNothing,
    /// As many of the requested units as currently fit.
    AtMost,
}

/// One rate limit check, ready to be sent.
#[derive(Clone, Debug)]
pub(crate) struct RateCall {
    key: String,
    bucket_key: String,
    limit: Limit,
    cost: u64,
    admission: Admission,
}

impl ScriptCall for RateCall {
    type Output = RateLimitResult;

    fn key(&self) -> &str {
        &self.key
    }

    fn script<'a>(&self, scripts: &'a ScriptRegistry) -> &'a Script {
        match self.admission {
            Admission::AllOrNothing => scripts.allow_n(),
            Admission::AtMost => scripts.allow_at_most(),
        }
    }

    fn invoke(&self, script: &Script, pipe: &mut redis::Pipeline) {
        let interval_us = self.limit.period.as_secs_f64() * 1e6 / self.limit.rate as f64;

        pipe.invoke_script(
            script
                .key(self.bucket_key.as_str())
                .arg(self.limit.effective_burst())
                .arg(interval_us)
                .arg(self.cost),
        );
    }

    fn decode(&self, reply: redis::Value) -> Result<RateLimitResult, String> {
        let [allowed, remaining, retry_after_us, reset_after_us] = reply::integers::<4>(reply)?;

        Ok(RateLimitResult {
            limit: self.limit,
            allowed: reply::count(allowed, "allowed")?,
            remaining: reply::count(remaining, "remaining")?,
            retry_after: reply::optional_micros(retry_after_us),
            reset_after: reply::micros(reset_after_us),
        })
    }
}

/// GCRA rate limiter backed by Redis.
///
/// Each key owns one bucket holding its theoretical arrival time (TAT). Admitting a
/// unit pushes the TAT forward by `period / rate`; the bucket admits work while the
/// TAT runs at most `burst` units ahead of the Redis clock. The bucket expires on its
/// own once fully drained.
///
/// All checks for one key are serialized by Redis: each runs as a single atomic
/// script, so any number of processes may share the same keys.
#[derive(Clone)]
pub struct RateLimiter {
    executor: Arc<BatchExecutor>,
    keys: KeyGenerator,
}

impl RateLimiter {
    pub(crate) fn new(executor: Arc<BatchExecutor>, keys: KeyGenerator) -> Self {
        Self { executor, keys }
    }

    /// Admit a single unit for `key`. Same as `allow_n(key, limit, 1)`.
    pub async fn allow(&self, key: &str, limit: &Limit) -> Result<RateLimitResult, AdmissionError> {
        self.allow_n(key, limit, 1).await
    }

    /// Admit all `n` units for `key`, or none of them.
    ///
    /// When refused, `retry_after` is the wait until all `n` units would fit. With
    /// `n == 0` this only reports the bucket state and changes nothing.
    pub async fn allow_n(
        &self,
        key: &str,
        limit: &Limit,
        n: u64,
    ) -> Result<RateLimitResult, AdmissionError> {
        let call = self.call(key, limit, n, Admission::AllOrNothing)?;
        self.run_one(call).await
    }

    /// Admit as many of the `n` units for `key` as currently fit.
    ///
    /// When fewer than `n` are admitted, `retry_after` is the wait until one more unit
    /// would fit. With `n == 0` this only reports the bucket state and changes nothing.
    pub async fn allow_at_most(
        &self,
        key: &str,
        limit: &Limit,
        n: u64,
    ) -> Result<RateLimitResult, AdmissionError> {
        let call = self.call(key, limit, n, Admission::AtMost)?;
        self.run_one(call).await
    }

    /// Forget all consumed capacity for `key`.
    pub async fn reset(&self, key: &str) -> Result<(), AdmissionError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.keys.rate_key(key));

        let _: i64 = self.executor.connection().query_cmd(&cmd).await?;

        Ok(())
    }

    pub(crate) fn call(
        &self,
        key: &str,
        limit: &Limit,
        cost: u64,
        admission: Admission,
    ) -> Result<RateCall, AdmissionError> {
        limit.validate()?;

        Ok(RateCall {
            key: key.to_string(),
            bucket_key: self.keys.rate_key(key),
            limit: *limit,
            cost,
            admission,
        })
    }

    pub(crate) async fn run_batch(
        &self,
        calls: &[RateCall],
    ) -> Result<Vec<Result<RateLimitResult, AdmissionError>>, AdmissionError> {
        self.executor.execute(calls).await
    }

    async fn run_one(&self, call: RateCall) -> Result<RateLimitResult, AdmissionError> {
        self.run_batch(std::slice::from_ref(&call))
            .await?
            .pop()
            .unwrap_or_else(|| {
                Err(AdmissionError::ProtocolViolation(
                    "no reply for rate limit check".to_string(),
                ))
            })
    }
}
