//! Connection manager: the public send/suspend/resume/close surface.
//!
//! The manager keeps one connection task per endpoint in a table and
//! forwards operations to the owning task over its command channel. All
//! per-endpoint state lives inside the task; the table itself only maps
//! endpoints to handles, so the lock around it is held for lookups only
//! and never across I/O.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::info;

use crate::codec::ResponsePayload;
use crate::connection::{self, Command, ConnectionHandle};
use crate::error::{LinkError, LinkResult};
use crate::listener::ErrorListeners;
use crate::protocol::Request;

/// A Modbus TCP endpoint, identified by host and port. At most one live
/// connection exists per endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId {
    pub host: String,
    pub port: u16,
}

impl EndpointId {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Timing and retry parameters shared by all connections of a manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// How long a request may wait for its reply, measured from enqueue.
    pub response_timeout: Duration,
    /// TCP connect deadline per attempt.
    pub connect_timeout: Duration,
    /// Reconnect is forced when no bytes arrive for this long.
    pub watchdog_timeout: Duration,
    /// First reconnect delay; doubles per consecutive failure.
    pub backoff_base_ms: u64,
    /// Upper bound on the reconnect delay.
    pub backoff_cap_ms: u64,
    /// Consecutive failed connects before the endpoint is suspended.
    pub max_reconnect_attempts: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            watchdog_timeout: Duration::from_secs(30),
            backoff_base_ms: 2000,
            backoff_cap_ms: 30000,
            max_reconnect_attempts: 5,
        }
    }
}

/// Manages one connection per endpoint and serializes requests to each.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct LinkManager {
    endpoints: Mutex<HashMap<EndpointId, ConnectionHandle>>,
    listeners: ErrorListeners,
    config: LinkConfig,
}

impl LinkManager {
    pub fn new() -> Self {
        Self::with_config(LinkConfig::default())
    }

    pub fn with_config(config: LinkConfig) -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            listeners: ErrorListeners::new(),
            config,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Send a request to an endpoint, opening its connection on first
    /// use, and wait for the decoded reply.
    ///
    /// Sends to a suspended endpoint fail immediately with
    /// [`LinkError::Closed`]; everything else queues FIFO behind earlier
    /// requests to the same endpoint.
    pub async fn send(&self, endpoint: &EndpointId, request: Request) -> LinkResult<ResponsePayload> {
        let handle = self.handle_for(endpoint);
        if handle.is_suspended() {
            return Err(LinkError::closed("endpoint suspended"));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .commands
            .send(Command::Send {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::closed("connection task stopped"))?;
        reply_rx
            .await
            .map_err(|_| LinkError::closed("connection task stopped"))?
    }

    /// Force-close the endpoint's connection and stop all reconnection
    /// until [`resume`](Self::resume). Queued requests are rejected.
    pub async fn suspend(&self, endpoint: &EndpointId) {
        let handle = self.handle_for(endpoint);
        self.acknowledge(&handle, |done| Command::Suspend { done })
            .await;
    }

    /// Clear suspension, reset the failure counter, and reconnect.
    pub async fn resume(&self, endpoint: &EndpointId) {
        let handle = self.handle_for(endpoint);
        self.acknowledge(&handle, |done| Command::Resume { done })
            .await;
    }

    pub fn is_suspended(&self, endpoint: &EndpointId) -> bool {
        self.endpoints
            .lock()
            .expect("endpoint table poisoned")
            .get(endpoint)
            .map(ConnectionHandle::is_suspended)
            .unwrap_or(false)
    }

    /// Close one endpoint: reject its queue, cancel its timers, and drop
    /// its state from the table.
    pub async fn close(&self, endpoint: &EndpointId) {
        let handle = self
            .endpoints
            .lock()
            .expect("endpoint table poisoned")
            .remove(endpoint);
        if let Some(handle) = handle {
            self.acknowledge(&handle, |done| Command::Close { done })
                .await;
        }
    }

    /// Close every endpoint. Rejects all queued requests with a closed
    /// error and leaves no timers pending.
    pub async fn close_all(&self) {
        let handles: Vec<(EndpointId, ConnectionHandle)> = self
            .endpoints
            .lock()
            .expect("endpoint table poisoned")
            .drain()
            .collect();
        for (endpoint, handle) in handles {
            info!(endpoint = %endpoint, "closing");
            self.acknowledge(&handle, |done| Command::Close { done })
                .await;
        }
    }

    /// Register a listener invoked on every connection-level failure:
    /// connect errors, socket errors, watchdog expiry, request timeouts.
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&EndpointId, &LinkError) + Send + Sync + 'static,
    {
        self.listeners.register(listener);
    }

    fn handle_for(&self, endpoint: &EndpointId) -> ConnectionHandle {
        self.endpoints
            .lock()
            .expect("endpoint table poisoned")
            .entry(endpoint.clone())
            .or_insert_with(|| {
                info!(endpoint = %endpoint, "creating connection");
                connection::spawn(endpoint.clone(), self.config.clone(), self.listeners.clone())
            })
            .clone()
    }

    async fn acknowledge<F>(&self, handle: &ConnectionHandle, command: F)
    where
        F: FnOnce(oneshot::Sender<()>) -> Command,
    {
        let (done_tx, done_rx) = oneshot::channel();
        if handle.commands.send(command(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl Default for LinkManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let endpoint = EndpointId::new("192.168.1.50", 502);
        assert_eq!(endpoint.to_string(), "192.168.1.50:502");
    }

    #[test]
    fn test_endpoints_hash_by_host_and_port() {
        let mut table = HashMap::new();
        table.insert(EndpointId::new("a", 502), 1);
        table.insert(EndpointId::new("a", 503), 2);
        assert_eq!(table.get(&EndpointId::new("a", 502)), Some(&1));
        assert_eq!(table.get(&EndpointId::new("a", 503)), Some(&2));
    }

    #[test]
    fn test_config_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert_eq!(config.watchdog_timeout, Duration::from_secs(30));
        assert_eq!(config.backoff_base_ms, 2000);
        assert_eq!(config.backoff_cap_ms, 30000);
        assert_eq!(config.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_unknown_endpoint_is_not_suspended() {
        let manager = LinkManager::new();
        assert!(!manager.is_suspended(&EndpointId::new("nowhere", 502)));
    }
}
