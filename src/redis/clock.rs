//! Time source shared by every limiter process: the Redis server clock.
//!
//! Scripts read the clock with `TIME` inside the script itself, so the timestamp and
//! the state change it drives are part of the same atomic step. Client clocks are
//! never consulted.

use std::time::Duration;

use crate::{AdmissionError, redis::connection::StoreConnection};

/// Lua prelude defining `now_us`: microseconds since 2017-01-01T00:00:00Z.
///
/// The shifted epoch keeps microsecond timestamps well inside the 53 bits a Lua
/// number holds exactly.
macro_rules! lua_clock {
    () => {
        r#"
    local clock = redis.call("TIME")
    local now_us = (tonumber(clock[1]) - 1483228800) * 1000000 + tonumber(clock[2])
"#
    };
}

pub(crate) use lua_clock;

/// Read the Redis server time as a duration since the Unix epoch.
pub(crate) async fn server_time(connection: &StoreConnection) -> Result<Duration, AdmissionError> {
    let (secs, micros): (u64, u64) = connection.query_cmd(&redis::cmd("TIME")).await?;

    Ok(Duration::from_secs(secs) + Duration::from_micros(micros))
}
