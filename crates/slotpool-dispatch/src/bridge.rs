//! Reference-counted local bridges to authenticated upstream proxies.
//!
//! Browsers cannot authenticate to some proxies directly, so each upstream
//! is fronted by a local endpoint. One bridge serves every slot configured
//! with the same upstream; it opens with the first lease and closes when
//! the last lease is dropped.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use slotpool_core::{AdapterError, EventStore, LifecycleEvent};

/// Opens and closes local bridge endpoints.
#[async_trait]
pub trait BridgeConnector: Send + Sync {
    /// Open a local endpoint forwarding to `upstream`.
    ///
    /// # Errors
    /// Returns error if the bridge cannot be started.
    async fn open(&self, upstream: &str) -> Result<String, AdapterError>;

    /// Close a previously opened endpoint.
    fn close(&self, upstream: &str, endpoint: &str);
}

/// Connector that hands the upstream through unchanged.
pub struct PassthroughBridge;

#[async_trait]
impl BridgeConnector for PassthroughBridge {
    async fn open(&self, upstream: &str) -> Result<String, AdapterError> {
        Ok(upstream.to_string())
    }

    fn close(&self, _upstream: &str, _endpoint: &str) {}
}

struct Bridge {
    endpoint: String,
    refs: usize,
}

struct Inner {
    connector: Arc<dyn BridgeConnector>,
    bridges: Mutex<HashMap<String, Bridge>>,
    events: Arc<EventStore>,
}

impl Inner {
    fn release(&self, upstream: &str) {
        let closed = {
            let mut bridges = self.bridges.lock();
            let Some(bridge) = bridges.get_mut(upstream) else {
                return;
            };
            bridge.refs = bridge.refs.saturating_sub(1);
            if bridge.refs > 0 {
                return;
            }
            bridges.remove(upstream)
        };

        if let Some(bridge) = closed {
            self.connector.close(upstream, &bridge.endpoint);
            tracing::info!(upstream, endpoint = %bridge.endpoint, "Bridge closed");
            self.events.push(LifecycleEvent::BridgeClosed {
                upstream: upstream.to_string(),
            });
        }
    }
}

/// Registry of open bridges.
#[derive(Clone)]
pub struct BridgeRegistry {
    inner: Arc<Inner>,
}

impl BridgeRegistry {
    /// Create a registry backed by `connector`.
    #[must_use]
    pub fn new(connector: Arc<dyn BridgeConnector>, events: Arc<EventStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                bridges: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Take a lease on the bridge for `upstream`, opening it if needed.
    ///
    /// # Errors
    /// Returns the connector's error if the bridge had to be opened and
    /// could not be.
    pub async fn acquire(&self, upstream: &str) -> Result<BridgeLease, AdapterError> {
        if let Some(lease) = self.reuse(upstream) {
            return Ok(lease);
        }

        let endpoint = self.inner.connector.open(upstream).await?;

        let raced = {
            let mut bridges = self.inner.bridges.lock();
            if let Some(bridge) = bridges.get_mut(upstream) {
                bridge.refs += 1;
                Some(bridge.endpoint.clone())
            } else {
                bridges.insert(
                    upstream.to_string(),
                    Bridge {
                        endpoint: endpoint.clone(),
                        refs: 1,
                    },
                );
                None
            }
        };

        let endpoint = match raced {
            // Another slot opened the same upstream while we were connecting.
            Some(existing) => {
                self.inner.connector.close(upstream, &endpoint);
                existing
            }
            None => {
                tracing::info!(upstream, %endpoint, "Bridge opened");
                self.inner.events.push(LifecycleEvent::BridgeOpened {
                    upstream: upstream.to_string(),
                });
                endpoint
            }
        };

        Ok(BridgeLease {
            inner: Arc::clone(&self.inner),
            upstream: upstream.to_string(),
            endpoint,
        })
    }

    fn reuse(&self, upstream: &str) -> Option<BridgeLease> {
        let mut bridges = self.inner.bridges.lock();
        let bridge = bridges.get_mut(upstream)?;
        bridge.refs += 1;
        Some(BridgeLease {
            inner: Arc::clone(&self.inner),
            upstream: upstream.to_string(),
            endpoint: bridge.endpoint.clone(),
        })
    }

    /// Number of leases currently held on `upstream`.
    #[must_use]
    pub fn refs(&self, upstream: &str) -> usize {
        self.inner.bridges.lock().get(upstream).map_or(0, |b| b.refs)
    }

    /// Number of open bridges.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.bridges.lock().len()
    }
}

/// A held reference on one bridge.
pub struct BridgeLease {
    inner: Arc<Inner>,
    upstream: String,
    endpoint: String,
}

impl BridgeLease {
    /// Local endpoint to hand to the browser.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn upstream(&self) -> &str {
        &self.upstream
    }
}

impl Drop for BridgeLease {
    fn drop(&mut self) {
        self.inner.release(&self.upstream);
    }
}

impl std::fmt::Debug for BridgeLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeLease")
            .field("upstream", &self.upstream)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingBridge {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl BridgeConnector for CountingBridge {
        async fn open(&self, upstream: &str) -> Result<String, AdapterError> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(format!("http://127.0.0.1:{}/{upstream}", 9000 + n))
        }

        fn close(&self, _upstream: &str, _endpoint: &str) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingBridge;

    #[async_trait]
    impl BridgeConnector for FailingBridge {
        async fn open(&self, upstream: &str) -> Result<String, AdapterError> {
            Err(AdapterError::Fatal(format!("cannot reach {upstream}")))
        }

        fn close(&self, _upstream: &str, _endpoint: &str) {}
    }

    #[tokio::test]
    async fn test_shared_until_last_lease() {
        let connector = Arc::new(CountingBridge::default());
        let events = Arc::new(EventStore::new());
        let registry = BridgeRegistry::new(
            Arc::clone(&connector) as Arc<dyn BridgeConnector>,
            Arc::clone(&events),
        );

        let first = registry.acquire("socks5://u:p@proxy:1080").await.unwrap();
        let second = registry.acquire("socks5://u:p@proxy:1080").await.unwrap();
        assert_eq!(first.endpoint(), second.endpoint());
        assert_eq!(registry.refs("socks5://u:p@proxy:1080"), 2);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);

        drop(first);
        assert_eq!(registry.open_count(), 1);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 0);

        drop(second);
        assert_eq!(registry.open_count(), 0);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);

        let kinds: Vec<_> = events.history();
        assert_eq!(
            kinds,
            vec![
                LifecycleEvent::BridgeOpened {
                    upstream: "socks5://u:p@proxy:1080".into()
                },
                LifecycleEvent::BridgeClosed {
                    upstream: "socks5://u:p@proxy:1080".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_distinct_upstreams_get_distinct_bridges() {
        let connector = Arc::new(CountingBridge::default());
        let registry = BridgeRegistry::new(connector, Arc::new(EventStore::new()));

        let a = registry.acquire("http://a").await.unwrap();
        let b = registry.acquire("http://b").await.unwrap();
        assert_ne!(a.endpoint(), b.endpoint());
        assert_eq!(registry.open_count(), 2);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_nothing_behind() {
        let registry = BridgeRegistry::new(Arc::new(FailingBridge), Arc::new(EventStore::new()));
        let err = registry.acquire("http://down").await.unwrap_err();
        assert!(matches!(err, AdapterError::Fatal(_)));
        assert_eq!(registry.open_count(), 0);
    }

    #[tokio::test]
    async fn test_passthrough() {
        let registry = BridgeRegistry::new(Arc::new(PassthroughBridge), Arc::new(EventStore::new()));
        let lease = registry.acquire("http://proxy:3128").await.unwrap();
        assert_eq!(lease.endpoint(), "http://proxy:3128");
        assert_eq!(lease.upstream(), "http://proxy:3128");
    }
}
