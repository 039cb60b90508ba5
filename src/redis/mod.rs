pub(crate) mod batch;
pub(crate) mod clock;
pub(crate) mod connection;
pub(crate) mod reply;
pub(crate) mod retry;
pub(crate) mod scripts;

pub(crate) mod common;
pub use common::KeyPrefix;

pub(crate) mod rate_limiter;
pub use rate_limiter::RateLimiter;

pub(crate) mod concurrency_limiter;
pub use concurrency_limiter::ConcurrencyLimiter;

mod pipeline;
pub use pipeline::{Pending, Pipeline};
