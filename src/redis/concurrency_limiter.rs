use std::sync::Arc;

use redis::Script;

use crate::{
    AdmissionError, ConcurrencyLimit, ConcurrencyResult,
    redis::{
        batch::{BatchExecutor, ScriptCall},
        common::KeyGenerator,
        reply,
        scripts::ScriptRegistry,
    },
};

/// One slot acquisition, ready to be sent.
#[derive(Clone, Debug)]
pub(crate) struct TakeCall {
    key: String,
    slots_key: String,
    request_id: String,
    limit: ConcurrencyLimit,
    hold_ms: u64,
}

impl ScriptCall for TakeCall {
    type Output = ConcurrencyResult;

    fn key(&self) -> &str {
        &self.key
    }

    fn script<'a>(&self, scripts: &'a ScriptRegistry) -> &'a Script {
        scripts.concurrency_take()
    }

    fn invoke(&self, script: &Script, pipe: &mut redis::Pipeline) {
        pipe.invoke_script(
            script
                .key(self.slots_key.as_str())
                .arg(self.request_id.as_str())
                .arg(self.limit.max)
                .arg(self.hold_ms),
        );
    }

    fn decode(&self, reply: redis::Value) -> Result<ConcurrencyResult, String> {
        let [allowed, used, retry_after_ms] = reply::integers::<3>(reply)?;
        let used = reply::count(used, "used")?;

        Ok(ConcurrencyResult {
            key: self.key.clone(),
            limit: self.limit,
            allowed: allowed != 0,
            used,
            remaining: self.limit.max.saturating_sub(used),
            retry_after: reply::optional_millis(retry_after_ms),
        })
    }
}

/// Concurrency limiter backed by Redis.
///
/// Each key owns a hash of slot holders (request id → expiration). A slot is held
/// until it is released or until `request_max_duration` passes, whichever comes
/// first; expired holders are dropped the next time the key is checked. The hash
/// itself expires after five times `request_max_duration` without a successful take,
/// so keys whose releases were all lost do not linger.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    executor: Arc<BatchExecutor>,
    keys: KeyGenerator,
}

impl ConcurrencyLimiter {
    pub(crate) fn new(executor: Arc<BatchExecutor>, keys: KeyGenerator) -> Self {
        Self { executor, keys }
    }

    /// Try to acquire one slot of `key` for `request_id`.
    ///
    /// Taking again with a request id that already holds a slot refreshes its
    /// expiration without occupying a second slot. It is still refused when the key
    /// is at capacity, like any other take.
    pub async fn take(
        &self,
        key: &str,
        request_id: &str,
        limit: &ConcurrencyLimit,
    ) -> Result<ConcurrencyResult, AdmissionError> {
        let limits = [(key, *limit)];
        let mut results = self.take_many(request_id, &limits).await?;

        results.pop().unwrap_or_else(|| {
            Err(AdmissionError::ProtocolViolation(
                "no reply for slot acquisition".to_string(),
            ))
        })
    }

    /// Try to acquire one slot of every key for `request_id`, in one round trip.
    ///
    /// Keys are independent: a denied key does not undo the slots acquired on others.
    /// Results are returned in the order of `limits`.
    pub async fn take_many(
        &self,
        request_id: &str,
        limits: &[(&str, ConcurrencyLimit)],
    ) -> Result<Vec<Result<ConcurrencyResult, AdmissionError>>, AdmissionError> {
        let calls = limits
            .iter()
            .map(|(key, limit)| self.call(key, request_id, limit))
            .collect::<Result<Vec<_>, _>>()?;

        self.run_batch(&calls).await
    }

    /// Give back the slot `request_id` holds on `key`. Releasing a slot that is not
    /// held is a no-op.
    pub async fn release(
        &self,
        key: &str,
        request_id: &str,
        _limit: &ConcurrencyLimit,
    ) -> Result<(), AdmissionError> {
        self.release_many(request_id, &[key]).await
    }

    /// Give back the slots `request_id` holds on every key, in one round trip.
    pub async fn release_many(&self, request_id: &str, keys: &[&str]) -> Result<(), AdmissionError> {
        validate_request_id(request_id)?;

        if keys.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::Pipeline::new();
        for key in keys {
            pipe.hdel(self.keys.concurrency_key(key), request_id).ignore();
        }

        let _: () = self.executor.connection().query_pipeline(&pipe).await?;

        Ok(())
    }

    pub(crate) fn call(
        &self,
        key: &str,
        request_id: &str,
        limit: &ConcurrencyLimit,
    ) -> Result<TakeCall, AdmissionError> {
        validate_request_id(request_id)?;
        let hold_ms = limit.request_max_millis()?;

        Ok(TakeCall {
            key: key.to_string(),
            slots_key: self.keys.concurrency_key(key),
            request_id: request_id.to_string(),
            limit: *limit,
            hold_ms,
        })
    }

    pub(crate) async fn run_batch(
        &self,
        calls: &[TakeCall],
    ) -> Result<Vec<Result<ConcurrencyResult, AdmissionError>>, AdmissionError> {
        self.executor.execute(calls).await
    }
}

fn validate_request_id(request_id: &str) -> Result<(), AdmissionError> {
    if request_id.is_empty() {
        return Err(AdmissionError::InvalidArgument(
            "request id must not be empty".to_string(),
        ));
    }

    Ok(())
}
