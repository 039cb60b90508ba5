use std::future::Future;

use crate::AdmissionError;

/// Reloads allowed before giving up on a store that keeps evicting scripts.
pub(crate) const MAX_RELOAD_DEPTH: usize = 10;

/// Outcome of one round trip that may have found the scripts missing.
pub(crate) enum Attempt<T> {
    Complete(T),
    /// The scripts were not in the Redis script cache. `generation` is the registry
    /// generation observed before the round trip was sent.
    ScriptMissing { generation: u64 },
}

/// Run `attempt` until it completes, calling `reload` each time the scripts are
/// missing. Fails with [`AdmissionError::TooManyRetries`] once the scripts are still
/// missing after [`MAX_RELOAD_DEPTH`] reloads. Any other error is returned as is.
pub(crate) async fn run_with_reload<T, A, AF, R, RF>(
    mut attempt: A,
    mut reload: R,
) -> Result<T, AdmissionError>
where
    A: FnMut() -> AF,
    AF: Future<Output = Result<Attempt<T>, AdmissionError>>,
    R: FnMut(u64) -> RF,
    RF: Future<Output = Result<(), AdmissionError>>,
{
    let mut depth = 0;

    loop {
        let generation = match attempt().await? {
            Attempt::Complete(value) => return Ok(value),
            Attempt::ScriptMissing { generation } => generation,
        };

        if depth >= MAX_RELOAD_DEPTH {
            tracing::error!(depth, "redis.scripts.missing, giving up");
            return Err(AdmissionError::TooManyRetries {
                attempts: depth + 1,
            });
        }

        tracing::warn!(depth, generation, "redis.scripts.missing, reloading scripts");
        reload(generation).await?;
        depth += 1;
    }
}
