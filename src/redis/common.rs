use std::{ops::Deref, sync::Arc};

use crate::AdmissionError;

/// A validated prefix for the Redis keys written by the limiter.
///
/// This is a string with the following constraints:
/// - Must not be empty
/// - Must not be longer than 255 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix(Arc<str>);

impl KeyPrefix {
    /// Default prefix for rate limit buckets.
    pub fn default_rate() -> Self {
        Self(Arc::from("rate:"))
    }

    /// Default prefix for concurrency slot sets.
    pub fn default_concurrency() -> Self {
        Self(Arc::from("concurrency:"))
    }
}

impl Deref for KeyPrefix {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<String> for KeyPrefix {
    type Error = AdmissionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(AdmissionError::InvalidArgument(
                "key prefix must not be empty".to_string(),
            ))
        } else if value.len() > 255 {
            Err(AdmissionError::InvalidArgument(
                "key prefix must not be longer than 255 bytes".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for KeyPrefix {
    type Error = AdmissionError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

/// Builds the Redis keys for the two namespaces.
#[derive(Clone, Debug)]
pub(crate) struct KeyGenerator {
    rate_prefix: KeyPrefix,
    concurrency_prefix: KeyPrefix,
}

impl KeyGenerator {
    pub(crate) fn new(
        rate_prefix: KeyPrefix,
        concurrency_prefix: KeyPrefix,
    ) -> Result<Self, AdmissionError> {
        if rate_prefix.starts_with(&*concurrency_prefix)
            || concurrency_prefix.starts_with(&*rate_prefix)
        {
            return Err(AdmissionError::InvalidArgument(format!(
                "rate prefix {:?} and concurrency prefix {:?} overlap, neither may start with the other",
                &*rate_prefix, &*concurrency_prefix
            )));
        }

        Ok(Self {
            rate_prefix,
            concurrency_prefix,
        })
    }

    pub(crate) fn rate_key(&self, key: &str) -> String {
        format!("{}{}", &*self.rate_prefix, key)
    }

    pub(crate) fn concurrency_key(&self, key: &str) -> String {
        format!("{}{}", &*self.concurrency_prefix, key)
    }
}
