// ABOUTME: Shared HTTP client construction for stream handles and sessions
// ABOUTME: An injectable, per-instance Arc so multiple configurations can coexist

use std::sync::Arc;
use std::time::Duration;

/// Default request timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Options controlling the underlying `reqwest::Client` used by a [`SharedClient`].
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Whole-request timeout.
    pub timeout: Duration,
    /// Connection-establishment timeout.
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// A `reqwest::Client` shared across stream handles, read sessions, and producers.
///
/// Callers may need several independently-configured clients (different timeouts
/// per downstream, or per-tenant connection pools), so rather than a single
/// process-global client this is expressed as an owned, cheaply `Clone`-able `Arc`
/// instance that can be built once and shared wherever it applies.
#[derive(Debug, Clone)]
pub struct SharedClient {
    inner: Arc<reqwest::Client>,
}

impl SharedClient {
    /// Build a new shared client from `options`. Panics only if `reqwest` itself
    /// cannot construct a client (TLS backend missing) — the same failure mode as
    /// `reqwest::Client::new()`.
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        let inner = reqwest::Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Wrap an already-constructed `reqwest::Client` (e.g. one configured with a
    /// custom proxy or TLS trust store by the caller).
    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(client),
        }
    }

    /// Borrow the underlying `reqwest::Client`.
    #[must_use]
    pub fn get(&self) -> &reqwest::Client {
        &self.inner
    }
}

impl Default for SharedClient {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}
