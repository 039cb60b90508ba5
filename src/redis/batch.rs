use std::sync::Arc;

use redis::Script;

use crate::{
    AdmissionError,
    redis::{
        connection::StoreConnection,
        reply,
        retry::{Attempt, run_with_reload},
        scripts::ScriptRegistry,
    },
};

/// One script invocation for one key, as part of a batch.
pub(crate) trait ScriptCall {
    type Output;

    /// Logical key, used in error reports.
    fn key(&self) -> &str;

    fn script<'a>(&self, scripts: &'a ScriptRegistry) -> &'a Script;

    /// Append the invocation of `script` to `pipe`.
    fn invoke(&self, script: &Script, pipe: &mut redis::Pipeline);

    fn decode(&self, reply: redis::Value) -> Result<Self::Output, String>;
}

/// Per-call outcomes, in the order the calls were given.
pub(crate) type BatchResults<T> = Vec<Result<T, AdmissionError>>;

/// Sends batches of script calls to Redis in a single round trip each.
///
/// Every round trip starts with a `SCRIPT EXISTS` for the scripts the batch uses,
/// followed by one `EVALSHA` per call. Error replies are kept per command, so a
/// script failing for one key only fails that key. When any call is answered with
/// `NOSCRIPT` the whole batch is sent again after reloading the scripts. Each call is
/// its own atomic script run, so a call is either fully applied or not at all.
pub(crate) struct BatchExecutor {
    connection: StoreConnection,
    scripts: ScriptRegistry,
}

impl BatchExecutor {
    pub(crate) fn new(connection: StoreConnection) -> Arc<Self> {
        Arc::new(Self {
            connection,
            scripts: ScriptRegistry::new(),
        })
    }

    pub(crate) fn connection(&self) -> &StoreConnection {
        &self.connection
    }

    pub(crate) fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    /// Run `calls` in one round trip, reloading scripts as needed.
    ///
    /// A failed round trip fails the whole batch. A reply that cannot be decoded fails
    /// only the call it belongs to.
    pub(crate) async fn execute<C: ScriptCall>(
        &self,
        calls: &[C],
    ) -> Result<BatchResults<C::Output>, AdmissionError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        run_with_reload(
            move || self.attempt(calls),
            move |generation| self.scripts.reload(generation, &self.connection),
        )
        .await
    }

    async fn attempt<C: ScriptCall>(
        &self,
        calls: &[C],
    ) -> Result<Attempt<BatchResults<C::Output>>, AdmissionError> {
        let generation = self.scripts.generation();

        let mut hashes: Vec<&str> = calls
            .iter()
            .map(|call| call.script(&self.scripts).get_hash())
            .collect();
        hashes.sort_unstable();
        hashes.dedup();

        let mut pipe = redis::Pipeline::new();
        pipe.ignore_errors();
        pipe.cmd("SCRIPT").arg("EXISTS").arg(&hashes);
        for call in calls {
            call.invoke(call.script(&self.scripts), &mut pipe);
        }

        let replies: Vec<redis::Value> = match self.connection.query_pipeline(&pipe).await {
            Ok(replies) => replies,
            Err(err) if err.is_missing_script() => {
                return Ok(Attempt::ScriptMissing { generation });
            }
            Err(err) => {
                tracing::error!(error = ?err, calls = calls.len(), "redis.batch.error, error executing pipeline");
                return Err(err);
            }
        };

        let mut replies = replies.into_iter();
        let present = reply::presence(replies.next(), hashes.len())?;

        if replies.len() != calls.len() {
            return Err(AdmissionError::ProtocolViolation(format!(
                "pipeline returned {} script replies for {} calls",
                replies.len(),
                calls.len()
            )));
        }

        let replies: Vec<Result<redis::Value, AdmissionError>> =
            replies.map(reply::server_error).collect();

        if replies
            .iter()
            .any(|reply| matches!(reply, Err(err) if err.is_missing_script()))
        {
            return Ok(Attempt::ScriptMissing { generation });
        }

        // No EVALSHA hit NOSCRIPT, so the calls ran even if the presence check saw a
        // script missing (another client loaded it in between). Re-sending would apply
        // them twice.
        if present.contains(&false) {
            tracing::debug!(
                generation,
                "redis.scripts.presence, script loaded concurrently during round trip"
            );
        }

        let results = calls
            .iter()
            .zip(replies)
            .map(|(call, reply)| match reply {
                Ok(reply) => call
                    .decode(reply)
                    .map_err(|reason| AdmissionError::UnexpectedReply {
                        key: call.key().to_string(),
                        reason,
                    }),
                Err(err) => {
                    tracing::warn!(key = call.key(), error = ?err, "redis.batch.call_error, script failed for key");
                    Err(err)
                }
            })
            .collect();

        Ok(Attempt::Complete(results))
    }
}
