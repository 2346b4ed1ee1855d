//! Memoized Functions
//!
//! [`Memoized`] wraps an async function so calls go through
//! [`CacheStrategy::get_or_compute`] under a key derived from the arguments.
//!
//! Keys are `prefix:part:part...`. Arguments are serialized to JSON first:
//! struct/map fields contribute sorted `name:value` pairs, tuple/sequence
//! elements contribute their values in order, and a unit argument contributes
//! nothing. Equal arguments always produce equal keys regardless of field
//! order.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::strategy::CacheStrategy;
use crate::error::{BoxError, Error, Result};

/// Build the cache key for `args` under `prefix`
pub fn build_key<A>(prefix: &str, args: &A) -> Result<String>
where
    A: Serialize + ?Sized,
{
    let value = serde_json::to_value(args)
        .map_err(|e| Error::Serialization(format!("failed to encode key arguments: {}", e)))?;

    let mut parts = vec![prefix.to_string()];
    match &value {
        Value::Null => {}
        Value::Object(fields) => {
            let mut names: Vec<&String> = fields.keys().collect();
            names.sort();
            for name in names {
                parts.push(name.clone());
                parts.push(render(&fields[name]));
            }
        }
        Value::Array(items) => parts.extend(items.iter().map(render)),
        scalar => parts.push(render(scalar)),
    }
    Ok(parts.join(":"))
}

/// Render one key part; strings appear without quotes
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Async function memoized through a [`CacheStrategy`]
pub struct Memoized<F> {
    strategy: Arc<CacheStrategy>,
    func: F,
    data_type: String,
    prefix: String,
}

impl<F> Memoized<F> {
    pub(crate) fn new(
        strategy: Arc<CacheStrategy>,
        func: F,
        data_type: impl Into<String>,
        key_prefix: Option<&str>,
    ) -> Self {
        let prefix = key_prefix
            .map(str::to_string)
            .unwrap_or_else(|| std::any::type_name::<F>().to_string());
        Self {
            strategy,
            func,
            data_type: data_type.into(),
            prefix,
        }
    }

    /// Key prefix used for every call
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// Cache key `call(args)` would use
    pub fn key_for<A>(&self, args: &A) -> Result<String>
    where
        A: Serialize,
    {
        build_key(&self.prefix, args)
    }

    /// Return the cached result for `args`, computing it on a miss
    pub async fn call<A, V, Fut, E>(&self, args: A) -> Result<V>
    where
        A: Serialize,
        F: Fn(A) -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        V: Serialize + DeserializeOwned,
        E: Into<BoxError>,
    {
        let key = build_key(&self.prefix, &args)?;
        self.strategy
            .get_or_compute(&key, &self.data_type, None, || (self.func)(args))
            .await
    }
}

impl CacheStrategy {
    /// Memoize `func` under `data_type`'s policy.
    ///
    /// Keys are prefixed with `key_prefix`, or the function's type name.
    pub fn wrap<F>(
        self: &Arc<Self>,
        func: F,
        data_type: impl Into<String>,
        key_prefix: Option<&str>,
    ) -> Memoized<F> {
        Memoized::new(Arc::clone(self), func, data_type, key_prefix)
    }
}

// =============================================================================
// Tests
// =============================================================================
