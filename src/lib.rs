#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod common;
pub use common::{
    ConcurrencyLimit, ConcurrencyResult, DEFAULT_REQUEST_MAX_DURATION, Limit, RateLimitResult,
};

mod error;
pub use error::*;

mod limiter;
pub use limiter::*;

mod redis;
pub use self::redis::{ConcurrencyLimiter, KeyPrefix, Pending, Pipeline, RateLimiter};

#[cfg(test)]
mod tests;
