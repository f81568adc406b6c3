//! Scoped, one-shot completion watchers over a shared traffic feed.
//!
//! A [`ResponseBus`] stands in for the network traffic of one automation
//! connection. An adapter installs an [`ExtractionWatcher`] for the
//! duration of a single job; the watcher's listener is removed when it is
//! dropped, whichever way the job ends.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::traits::AdapterError;

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Listener<T> {
    filter: Filter<T>,
    tx: oneshot::Sender<T>,
}

/// Watcher failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("No matching response within {0:?}")]
    Expired(Duration),
    #[error("Response feed closed")]
    Closed,
}

impl From<WatchError> for AdapterError {
    fn from(err: WatchError) -> Self {
        match err {
            WatchError::Expired(window) => Self::TimedOut(window),
            WatchError::Closed => Self::Transient(err.to_string()),
        }
    }
}

/// Shared registry of response listeners.
pub struct ResponseBus<T> {
    listeners: Mutex<HashMap<u64, Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for ResponseBus<T> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Clone + Send + 'static> ResponseBus<T> {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install a one-shot watcher for the first response matching `filter`.
    #[must_use]
    pub fn watch<F>(self: &Arc<Self>, filter: F) -> ExtractionWatcher<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.listeners.lock().insert(
            id,
            Listener {
                filter: Box::new(filter),
                tx,
            },
        );
        ExtractionWatcher {
            bus: Arc::clone(self),
            id,
            rx,
        }
    }

    /// Feed one response to the installed watchers.
    ///
    /// Every matching watcher fires once and is removed. Returns how many
    /// fired.
    pub fn publish(&self, response: &T) -> usize {
        let mut listeners = self.listeners.lock();
        let matched: Vec<u64> = listeners
            .iter()
            .filter(|(_, l)| (l.filter)(response))
            .map(|(id, _)| *id)
            .collect();
        for id in &matched {
            if let Some(listener) = listeners.remove(id) {
                let _ = listener.tx.send(response.clone());
            }
        }
        matched.len()
    }

    /// Number of installed watchers.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn remove(&self, id: u64) {
        self.listeners.lock().remove(&id);
    }
}

/// One-shot watcher; its listener is removed on drop.
pub struct ExtractionWatcher<T: Clone + Send + 'static> {
    bus: Arc<ResponseBus<T>>,
    id: u64,
    rx: oneshot::Receiver<T>,
}

impl<T: Clone + Send + 'static> ExtractionWatcher<T> {
    /// Wait up to `window` for the matching response.
    ///
    /// # Errors
    /// Returns `WatchError::Expired` when the window passes without a match.
    pub async fn wait(mut self, window: Duration) -> Result<T, WatchError> {
        match tokio::time::timeout(window, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(WatchError::Closed),
            Err(_) => Err(WatchError::Expired(window)),
        }
    }
}

impl<T: Clone + Send + 'static> Drop for ExtractionWatcher<T> {
    fn drop(&mut self) {
        self.bus.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Response {
        url: &'static str,
        body: &'static str,
    }

    #[tokio::test]
    async fn test_watcher_fires_on_match_and_is_removed() {
        let bus = ResponseBus::<Response>::new();
        let watcher = bus.watch(|r| r.url.ends_with("/generate"));
        assert_eq!(bus.listener_count(), 1);

        assert_eq!(bus.publish(&Response { url: "/health", body: "" }), 0);
        assert_eq!(
            bus.publish(&Response { url: "/api/generate", body: "img" }),
            1
        );

        let got = watcher.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.body, "img");
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_expires_and_is_removed() {
        let bus = ResponseBus::<Response>::new();
        let watcher = bus.watch(|_| true);

        let err = watcher.wait(Duration::from_secs(120)).await.unwrap_err();
        assert_eq!(err, WatchError::Expired(Duration::from_secs(120)));
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(
            AdapterError::from(err),
            AdapterError::TimedOut(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_dropping_unawaited_watcher_removes_listener() {
        let bus = ResponseBus::<Response>::new();
        {
            let _a = bus.watch(|_| true);
            let _b = bus.watch(|_| true);
            assert_eq!(bus.listener_count(), 2);
        }
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_watcher_fires_only_once() {
        let bus = ResponseBus::<Response>::new();
        let _watcher = bus.watch(|_| true);
        let response = Response { url: "/x", body: "" };
        assert_eq!(bus.publish(&response), 1);
        assert_eq!(bus.publish(&response), 0);
    }
}
