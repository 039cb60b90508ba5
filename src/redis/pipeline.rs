use tokio::sync::oneshot;

use crate::{
    AdmissionError, ConcurrencyLimit, ConcurrencyResult, Limit, Limiter, RateLimitResult,
    redis::{concurrency_limiter::TakeCall, rate_limiter::{Admission, RateCall}},
};

/// Handle to the outcome of one check queued on a [`Pipeline`].
///
/// It resolves when [`Pipeline::exec`] completes.
#[derive(Debug)]
pub struct Pending<T> {
    receiver: oneshot::Receiver<Result<T, AdmissionError>>,
}

impl<T> Pending<T> {
    fn channel() -> (oneshot::Sender<Result<T, AdmissionError>>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }

    fn ready(result: Result<T, AdmissionError>) -> Self {
        let (sender, pending) = Self::channel();
        let _ = sender.send(result);
        pending
    }

    /// The outcome of the check.
    ///
    /// Returns [`AdmissionError::Unresolved`] if the pipeline was not executed.
    pub fn result(mut self) -> Result<T, AdmissionError> {
        self.receiver
            .try_recv()
            .unwrap_or(Err(AdmissionError::Unresolved))
    }
}

/// Batches rate limit checks and slot acquisitions for many keys.
///
/// Rate limit checks go to Redis in one round trip and slot acquisitions in another;
/// the two are never mixed. Keys are independent of each other: every check gets its
/// own outcome, and a check that cannot be decoded does not affect the others.
///
/// # Examples
///
/// ```no_run
/// # async fn run(limiter: redis_admission::Limiter) -> Result<(), redis_admission::AdmissionError> {
/// use redis_admission::Limit;
///
/// let mut pipeline = limiter.pipeline();
/// let per_tenant = pipeline.allow("tenant:acme/second", &Limit::per_second(100));
/// let per_ip = pipeline.allow("ip:10.0.0.1/hour", &Limit::per_hour(5000));
/// pipeline.exec().await?;
///
/// let allowed = per_tenant.result()?.is_allowed() && per_ip.result()?.is_allowed();
/// # Ok(())
/// # }
/// ```
pub struct Pipeline<'a> {
    limiter: &'a Limiter,
    rate_calls: Vec<RateCall>,
    rate_senders: Vec<oneshot::Sender<Result<RateLimitResult, AdmissionError>>>,
    take_calls: Vec<TakeCall>,
    take_senders: Vec<oneshot::Sender<Result<ConcurrencyResult, AdmissionError>>>,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(limiter: &'a Limiter) -> Self {
        Self {
            limiter,
            rate_calls: Vec::new(),
            rate_senders: Vec::new(),
            take_calls: Vec::new(),
            take_senders: Vec::new(),
        }
    }

    /// Queue [`RateLimiter::allow`](crate::RateLimiter::allow).
    pub fn allow(&mut self, key: &str, limit: &Limit) -> Pending<RateLimitResult> {
        self.allow_n(key, limit, 1)
    }

    /// Queue [`RateLimiter::allow_n`](crate::RateLimiter::allow_n).
    pub fn allow_n(&mut self, key: &str, limit: &Limit, n: u64) -> Pending<RateLimitResult> {
        self.queue_rate(key, limit, n, Admission::AllOrNothing)
    }

    /// Queue [`RateLimiter::allow_at_most`](crate::RateLimiter::allow_at_most).
    pub fn allow_at_most(&mut self, key: &str, limit: &Limit, n: u64) -> Pending<RateLimitResult> {
        self.queue_rate(key, limit, n, Admission::AtMost)
    }

    /// Queue [`ConcurrencyLimiter::take`](crate::ConcurrencyLimiter::take).
    pub fn take(
        &mut self,
        key: &str,
        request_id: &str,
        limit: &ConcurrencyLimit,
    ) -> Pending<ConcurrencyResult> {
        match self.limiter.concurrency().call(key, request_id, limit) {
            Ok(call) => {
                let (sender, pending) = Pending::channel();
                self.take_calls.push(call);
                self.take_senders.push(sender);
                pending
            }
            Err(err) => Pending::ready(Err(err)),
        }
    }

    /// Number of checks that will be sent to Redis.
    pub fn len(&self) -> usize {
        self.rate_calls.len() + self.take_calls.len()
    }

    /// Whether no check will be sent to Redis.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send every queued check and resolve all [`Pending`] handles.
    ///
    /// If a round trip fails, every handle in that round trip resolves to the same
    /// error, and the first such error is returned.
    pub async fn exec(self) -> Result<(), AdmissionError> {
        let Pipeline {
            limiter,
            rate_calls,
            rate_senders,
            take_calls,
            take_senders,
        } = self;

        let rate = limiter.rate().run_batch(&rate_calls).await;
        let rate = resolve(rate, rate_senders);

        let take = limiter.concurrency().run_batch(&take_calls).await;
        let take = resolve(take, take_senders);

        rate.and(take)
    }

    fn queue_rate(
        &mut self,
        key: &str,
        limit: &Limit,
        n: u64,
        admission: Admission,
    ) -> Pending<RateLimitResult> {
        match self.limiter.rate().call(key, limit, n, admission) {
            Ok(call) => {
                let (sender, pending) = Pending::channel();
                self.rate_calls.push(call);
                self.rate_senders.push(sender);
                pending
            }
            Err(err) => Pending::ready(Err(err)),
        }
    }
}

fn resolve<T>(
    outcome: Result<Vec<Result<T, AdmissionError>>, AdmissionError>,
    senders: Vec<oneshot::Sender<Result<T, AdmissionError>>>,
) -> Result<(), AdmissionError> {
    match outcome {
        Ok(results) => {
            for (sender, result) in senders.into_iter().zip(results) {
                // The handle may have been dropped.
                let _ = sender.send(result);
            }
            Ok(())
        }
        Err(err) => {
            for sender in senders {
                let _ = sender.send(Err(err.clone()));
            }
            Err(err)
        }
    }
}
