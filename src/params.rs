// ABOUTME: Static/dynamic header and query-param resolution for stream handles and sessions
// ABOUTME: Dynamic values (e.g. a refreshed bearer token) are resolved on every request

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::types::HeaderParamPatch;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A header or query-param value that is either fixed for the handle's lifetime,
/// or recomputed before every request (e.g. a token refreshed from an external
/// source).
#[derive(Clone)]
pub enum ParamValue {
    /// A value that never changes.
    Static(String),
    /// A value resolved asynchronously immediately before each request.
    Dynamic(Arc<dyn Fn() -> BoxFuture<'static, String> + Send + Sync>),
}

impl ParamValue {
    /// Build a dynamic value from an async closure.
    pub fn dynamic<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = String> + Send + 'static,
    {
        Self::Dynamic(Arc::new(move || Box::pin(f())))
    }

    /// Resolve this value, awaiting the closure if it's [`ParamValue::Dynamic`].
    pub async fn resolve(&self) -> String {
        match self {
            Self::Static(value) => value.clone(),
            Self::Dynamic(resolver) => resolver().await,
        }
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Static(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Static(value.to_owned())
    }
}

impl fmt::Debug for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// A named set of headers and query params attached to a stream handle, resolved
/// fresh before each request a session or producer makes.
#[derive(Debug, Clone, Default)]
pub struct ParamSet {
    headers: HashMap<String, ParamValue>,
    query: HashMap<String, ParamValue>,
}

impl ParamSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a header value.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add or replace a query-param value.
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Merge `other` into `self`, with `other`'s entries winning on key collision.
    #[must_use]
    pub fn merged_with(mut self, other: Self) -> Self {
        self.headers.extend(other.headers);
        self.query.extend(other.query);
        self
    }

    /// Resolve every header and query param to its current string value.
    pub async fn resolve(&self) -> (HashMap<String, String>, HashMap<String, String>) {
        let mut headers = HashMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.resolve().await);
        }
        let mut query = HashMap::with_capacity(self.query.len());
        for (name, value) in &self.query {
            query.insert(name.clone(), value.resolve().await);
        }
        (headers, query)
    }

    /// Merge an `on_error` hook's [`HeaderParamPatch`] into this set as new static
    /// overrides, applied to every subsequent request on the same handle.
    pub fn apply_patch(&mut self, patch: HeaderParamPatch) {
        for (name, value) in patch.headers {
            self.headers.insert(name, ParamValue::Static(value));
        }
        for (name, value) in patch.params {
            self.query.insert(name, ParamValue::Static(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_values_resolve_unchanged() {
        let set = ParamSet::new()
            .with_header("Authorization", "Bearer abc")
            .with_query("tenant", "acme");
        let (headers, query) = set.resolve().await;
        assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer abc"));
        assert_eq!(query.get("tenant").map(String::as_str), Some("acme"));
    }

    #[tokio::test]
    async fn dynamic_values_are_recomputed_each_call() {
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter_clone = counter.clone();
        let set = ParamSet::new().with_header(
            "Authorization",
            ParamValue::dynamic(move || {
                let counter = counter_clone.clone();
                async move {
                    let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    format!("token-{n}")
                }
            }),
        );

        let (first, _) = set.resolve().await;
        let (second, _) = set.resolve().await;
        assert_eq!(first.get("Authorization").map(String::as_str), Some("token-0"));
        assert_eq!(second.get("Authorization").map(String::as_str), Some("token-1"));
    }

    #[tokio::test]
    async fn patch_overrides_are_sticky() {
        let mut set = ParamSet::new().with_header("X-A", "orig");
        let mut patch = HeaderParamPatch::default();
        patch.headers.insert("X-A".to_owned(), "patched".to_owned());
        set.apply_patch(patch);

        let (headers, _) = set.resolve().await;
        assert_eq!(headers.get("X-A").map(String::as_str), Some("patched"));
    }
}
