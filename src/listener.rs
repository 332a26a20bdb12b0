//! Error-listener registry.
//!
//! Callers register callbacks to observe connection-level failures
//! (connect errors, socket errors, watchdog expiry, timeouts). Listener
//! failures never feed back into the connection state machine.

use std::sync::{Arc, Mutex};

use crate::error::LinkError;
use crate::manager::EndpointId;

/// Callback invoked with the endpoint and the error that occurred.
pub type ErrorCallback = Box<dyn Fn(&EndpointId, &LinkError) + Send + Sync>;

/// Shared registry of error listeners.
///
/// Cloning yields a handle to the same list, so connection tasks and the
/// manager observe registrations made at any time.
#[derive(Clone, Default)]
pub struct ErrorListeners {
    callbacks: Arc<Mutex<Vec<Arc<ErrorCallback>>>>,
}

impl ErrorListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners persist for the registry's lifetime.
    pub fn register<F>(&self, callback: F)
    where
        F: Fn(&EndpointId, &LinkError) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .expect("listener registry poisoned")
            .push(Arc::new(Box::new(callback)));
    }

    /// Invoke every registered listener with the given failure.
    pub fn notify(&self, endpoint: &EndpointId, error: &LinkError) {
        let callbacks: Vec<Arc<ErrorCallback>> = self
            .callbacks
            .lock()
            .expect("listener registry poisoned")
            .clone();
        for callback in callbacks {
            callback(endpoint, error);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .lock()
            .expect("listener registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ErrorListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorListeners")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notify_reaches_all_listeners() {
        let listeners = ErrorListeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            listeners.register(move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let endpoint = EndpointId::new("10.0.0.5", 502);
        listeners.notify(&endpoint, &LinkError::transport("boom"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_clone_shares_registrations() {
        let listeners = ErrorListeners::new();
        let other = listeners.clone();
        other.register(|_, _| {});
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_listener_sees_endpoint_and_error() {
        let listeners = ErrorListeners::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        listeners.register(move |endpoint, error| {
            *sink.lock().unwrap() = Some((endpoint.clone(), error.clone()));
        });

        let endpoint = EndpointId::new("lamp-1.local", 502);
        listeners.notify(&endpoint, &LinkError::timeout("request", 5000));

        let captured = seen.lock().unwrap().clone().unwrap();
        assert_eq!(captured.0, endpoint);
        assert!(captured.1.is_recoverable());
    }
}
