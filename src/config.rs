//! Client configuration.
//!
//! The idle socket timeout is process-wide: [`set_socket_timeout`] changes it for every
//! socket obtained afterwards by any client which does not override it in its own [`Config`].

use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "tls")]
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::Backoff;

/// Default idle socket timeout.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(60_000);

static SOCKET_TIMEOUT_MS: AtomicU64 = AtomicU64::new(60_000);

/// The current process-wide idle socket timeout.
pub fn socket_timeout() -> Duration {
    Duration::from_millis(SOCKET_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// Set the process-wide idle socket timeout.
///
/// Sub-millisecond precision is discarded.
pub fn set_socket_timeout(timeout: Duration) {
    let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    SOCKET_TIMEOUT_MS.store(millis, Ordering::Relaxed);
}

/// Per-client configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Idle socket timeout for this client.
    ///
    /// When unset, the process-wide [`socket_timeout`] is read each time a socket is attached.
    pub socket_timeout: Option<Duration>,

    /// Backoff used between reconnection attempts.
    pub backoff: Backoff,

    /// TLS configuration for `https` targets.
    ///
    /// When unset, the platform's native root certificates are loaded on first use.
    #[cfg(feature = "tls")]
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Config {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the idle socket timeout for this client.
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    /// Use a different backoff policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Use a custom TLS configuration for `https` targets.
    #[cfg(feature = "tls")]
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// The idle timeout to apply to a socket attached now.
    pub fn effective_socket_timeout(&self) -> Duration {
        self.socket_timeout.unwrap_or_else(socket_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_global() {
        let config = Config::new().with_socket_timeout(Duration::from_millis(25));
        assert_eq!(config.effective_socket_timeout(), Duration::from_millis(25));
    }

    #[test]
    fn global_timeout_is_mutable() {
        assert_eq!(DEFAULT_SOCKET_TIMEOUT, Duration::from_secs(60));

        set_socket_timeout(Duration::from_millis(1500));
        assert_eq!(socket_timeout(), Duration::from_millis(1500));
        assert_eq!(
            Config::new().effective_socket_timeout(),
            Duration::from_millis(1500)
        );

        set_socket_timeout(DEFAULT_SOCKET_TIMEOUT);
        assert_eq!(socket_timeout(), DEFAULT_SOCKET_TIMEOUT);
    }

    #[test]
    fn default_backoff() {
        assert_eq!(Config::default().backoff, Backoff::default());
    }
}
