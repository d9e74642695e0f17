//! Connection configuration.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;

use crate::connection::Connection;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::reconnect::HookOutcome;

/// Hook invoked after every successful handshake (initial connect and each
/// reset). The returned future gates handshake completion; its failure fails
/// the handshake.
pub type ConnectHook<D> =
    Arc<dyn Fn(&Connection<D>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Hook consulted after a successful automatic reset, before the failed
/// command is resubmitted. Receives the connection and the original error.
pub type ReconnectHook<D> = Arc<dyn Fn(&Connection<D>, &Error) -> HookOutcome + Send + Sync>;

/// Environment fallback for the connect deadline, in whole seconds.
fn env_connect_timeout() -> Option<Duration> {
    static DEFAULT: Lazy<Option<Duration>> = Lazy::new(|| {
        std::env::var("PGCONNECT_TIMEOUT")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    });
    *DEFAULT
}

/// Per-connection configuration.
///
/// Built in the fluent style; zero durations disable the corresponding
/// deadline.
pub struct ConnectOptions<D: Driver> {
    connect_timeout: Option<Duration>,
    query_timeout: Option<Duration>,
    async_autoreconnect: Option<bool>,
    on_autoreconnect: Option<ReconnectHook<D>>,
    on_connect: Option<ConnectHook<D>>,
}

impl<D: Driver> Default for ConnectOptions<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Driver> Clone for ConnectOptions<D> {
    fn clone(&self) -> Self {
        Self {
            connect_timeout: self.connect_timeout,
            query_timeout: self.query_timeout,
            async_autoreconnect: self.async_autoreconnect,
            on_autoreconnect: self.on_autoreconnect.clone(),
            on_connect: self.on_connect.clone(),
        }
    }
}

impl<D: Driver> ConnectOptions<D> {
    pub fn new() -> Self {
        Self {
            connect_timeout: env_connect_timeout(),
            query_timeout: None,
            async_autoreconnect: None,
            on_autoreconnect: None,
            on_connect: None,
        }
    }

    /// Bound the connect/reset handshake. `Duration::ZERO` disables.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = normalize(timeout);
        self
    }

    /// Bound each command's quiet interval. `Duration::ZERO` disables.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = normalize(timeout);
        self
    }

    /// Reconnect-and-resubmit on connection loss. Defaults to true when an
    /// `on_autoreconnect` hook is set, false otherwise.
    pub fn async_autoreconnect(mut self, enabled: bool) -> Self {
        self.async_autoreconnect = Some(enabled);
        self
    }

    pub fn on_autoreconnect(
        mut self,
        hook: impl Fn(&Connection<D>, &Error) -> HookOutcome + Send + Sync + 'static,
    ) -> Self {
        self.on_autoreconnect = Some(Arc::new(hook));
        self
    }

    pub fn on_connect(
        mut self,
        hook: impl Fn(&Connection<D>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    pub(crate) fn get_connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub(crate) fn get_query_timeout(&self) -> Option<Duration> {
        self.query_timeout
    }

    pub(crate) fn autoreconnect_enabled(&self) -> bool {
        self.async_autoreconnect
            .unwrap_or(self.on_autoreconnect.is_some())
    }

    pub(crate) fn autoreconnect_hook(&self) -> Option<ReconnectHook<D>> {
        self.on_autoreconnect.clone()
    }

    pub(crate) fn connect_hook(&self) -> Option<ConnectHook<D>> {
        self.on_connect.clone()
    }

    pub(crate) fn set_query_timeout(&mut self, timeout: Duration) {
        self.query_timeout = normalize(timeout);
    }

    pub(crate) fn set_autoreconnect(&mut self, enabled: bool) {
        self.async_autoreconnect = Some(enabled);
    }
}

fn normalize(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::normalize;
    use std::time::Duration;

    #[test]
    fn test_zero_duration_disables() {
        assert_eq!(normalize(Duration::ZERO), None);
        assert_eq!(
            normalize(Duration::from_secs(3)),
            Some(Duration::from_secs(3))
        );
    }
}
