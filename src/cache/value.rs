/// the reply to a cache Get
///
use serde::Serialize;

use crate::error::{CacheError, Result};

/// An explicit found flag travels with the payload so that a stored empty string is never
/// mistaken for a missing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Value {
    found: bool,
    value: Option<String>,
}

impl Value {
    pub fn found<V: Into<String>>(value: V) -> Value {
        Value {
            found: true,
            value: Some(value.into()),
        }
    }

    pub fn not_found() -> Value {
        Value {
            found: false,
            value: None,
        }
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn into_inner(self) -> Option<String> {
        self.value
    }
}

impl From<Option<String>> for Value {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(v) => Value::found(v),
            None => Value::not_found(),
        }
    }
}

/// keys are the addressing unit of the cache and may not be empty
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        Err(CacheError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}
