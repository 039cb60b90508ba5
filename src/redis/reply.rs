//! Decoding of raw Redis replies into the shapes the scripts return.

use std::time::Duration;

use redis::Value;

use crate::AdmissionError;

/// Decode the `SCRIPT EXISTS` reply: one flag per hash that was asked about.
pub(crate) fn presence(reply: Option<Value>, expected: usize) -> Result<Vec<bool>, AdmissionError> {
    let Some(reply) = reply else {
        return Err(AdmissionError::ProtocolViolation(
            "missing SCRIPT EXISTS reply".to_string(),
        ));
    };

    let flags = match reply {
        Value::Array(flags) => flags,
        other => {
            return Err(AdmissionError::ProtocolViolation(format!(
                "SCRIPT EXISTS returned {other:?}, expected an array"
            )));
        }
    };

    if flags.len() != expected {
        return Err(AdmissionError::ProtocolViolation(format!(
            "SCRIPT EXISTS returned {} flags for {expected} scripts",
            flags.len()
        )));
    }

    flags
        .iter()
        .map(|flag| match flag {
            Value::Boolean(present) => Ok(*present),
            other => integer(other)
                .map(|n| n != 0)
                .map_err(AdmissionError::ProtocolViolation),
        })
        .collect()
}

/// Turn an error reply into that command's own error. Error replies come back in
/// place because batches are sent with `ignore_errors`.
pub(crate) fn server_error(reply: Value) -> Result<Value, AdmissionError> {
    match reply {
        Value::ServerError(err) => Err(redis::RedisError::from(err).into()),
        other => Ok(other),
    }
}

/// Decode a script reply made of exactly `N` integers.
pub(crate) fn integers<const N: usize>(reply: Value) -> Result<[i64; N], String> {
    let items = match reply {
        Value::Array(items) => items,
        other => return Err(format!("expected an array of {N} integers, got {other:?}")),
    };

    if items.len() != N {
        return Err(format!(
            "expected an array of {N} integers, got {} items",
            items.len()
        ));
    }

    let mut out = [0i64; N];
    for (slot, item) in out.iter_mut().zip(&items) {
        *slot = integer(item)?;
    }

    Ok(out)
}

fn integer(value: &Value) -> Result<i64, String> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| format!("expected an integer, got {bytes:?}")),
        Value::SimpleString(s) => s
            .parse()
            .map_err(|_| format!("expected an integer, got {s:?}")),
        other => Err(format!("expected an integer, got {other:?}")),
    }
}

/// Non-negative count.
pub(crate) fn count(n: i64, what: &str) -> Result<u64, String> {
    u64::try_from(n).map_err(|_| format!("{what} must not be negative, got {n}"))
}

/// Scripts use `-1` for "no wait".
pub(crate) fn optional_micros(value: i64) -> Option<Duration> {
    u64::try_from(value).ok().map(Duration::from_micros)
}

/// Scripts use `-1` for "no wait".
pub(crate) fn optional_millis(value: i64) -> Option<Duration> {
    u64::try_from(value).ok().map(Duration::from_millis)
}

/// Negative values are clamped to zero.
pub(crate) fn micros(value: i64) -> Duration {
    optional_micros(value).unwrap_or(Duration::ZERO)
}
