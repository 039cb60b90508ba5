mod support;

mod test_rate_limiter;
