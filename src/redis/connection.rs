use std::{future::Future, time::Duration};

use redis::{FromRedisValue, RedisResult, aio::ConnectionManager};

use crate::AdmissionError;

/// A [`ConnectionManager`] plus the deadline applied to every round trip.
#[derive(Clone)]
pub(crate) struct StoreConnection {
    connection_manager: ConnectionManager,
    timeout: Option<Duration>,
}

impl StoreConnection {
    pub(crate) fn new(connection_manager: ConnectionManager, timeout: Option<Duration>) -> Self {
        Self {
            connection_manager,
            timeout,
        }
    }

    /// Send a pipeline in one round trip.
    pub(crate) async fn query_pipeline<T: FromRedisValue>(
        &self,
        pipe: &redis::Pipeline,
    ) -> Result<T, AdmissionError> {
        let mut connection_manager = self.connection_manager.clone();
        bounded(self.timeout, pipe.query_async(&mut connection_manager)).await
    }

    /// Send a single command.
    pub(crate) async fn query_cmd<T: FromRedisValue>(
        &self,
        cmd: &redis::Cmd,
    ) -> Result<T, AdmissionError> {
        let mut connection_manager = self.connection_manager.clone();
        bounded(self.timeout, cmd.query_async(&mut connection_manager)).await
    }
}

async fn bounded<T>(
    timeout: Option<Duration>,
    round_trip: impl Future<Output = RedisResult<T>>,
) -> Result<T, AdmissionError> {
    let Some(limit) = timeout else {
        return Ok(round_trip.await?);
    };

    match tokio::time::timeout(limit, round_trip).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            tracing::error!(timeout = ?limit, "redis.round_trip.timeout, outcome unknown");
            Err(AdmissionError::Timeout(limit))
        }
    }
}
