/// Backing key/value store seam.
///
/// The store connector only ever talks to a store through these two traits; the wire protocol
/// of a real store lives behind a `Connector` implementation. `MemoryStore` is the in-process
/// backend, with a reachability switch and call counters for exercising failure paths.
///
use async_std::sync::Mutex;
use async_trait::async_trait;
use hashbrown::HashMap;
use log::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// an open connection to the backing store
#[async_trait]
pub trait KeyValueStore: Send + 'static {
    /// `Ok(None)` is an explicit "not found", never an error
    async fn get(&mut self, key: &str) -> Result<Option<String>>;
    async fn set(&mut self, key: &str, value: &str) -> Result<()>;
}

/// opens connections; invoked once per store connector instance
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: KeyValueStore;

    async fn connect(&self) -> Result<Self::Connection>;
}

#[derive(Debug)]
struct Inner {
    data: Mutex<HashMap<String, String>>,
    online: AtomicBool,
    latency_ms: AtomicU64,
    gets: AtomicUsize,
    sets: AtomicUsize,
    connects: AtomicUsize,
}

/// shared in-memory store; clones see the same data
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            inner: Arc::new(Inner {
                data: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
                gets: AtomicUsize::new(0),
                sets: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// an offline store refuses connections and fails every call on open connections
    pub fn set_online(&self, online: bool) {
        info!("memory store online: {}", online);
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// delay applied to every get and set
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn get_count(&self) -> usize {
        self.inner.gets.load(Ordering::SeqCst)
    }

    pub fn set_count(&self) -> usize {
        self.inner.sets.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// read a value directly, bypassing connections and counters
    pub async fn value(&self, key: &str) -> Option<String> {
        self.inner.data.lock().await.get(key).cloned()
    }

    /// seed a value directly, bypassing connections and counters
    pub async fn insert(&self, key: &str, value: &str) {
        self.inner
            .data
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
    }

    pub async fn len(&self) -> usize {
        self.inner.data.lock().await.len()
    }

    fn check_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(CacheError::Connection(
                "backing store unreachable".to_string(),
            ))
        }
    }

    async fn delay(&self) {
        let ms = self.inner.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            async_std::task::sleep(Duration::from_millis(ms)).await;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    store: MemoryStore,
}

#[async_trait]
impl KeyValueStore for MemoryConnection {
    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        self.store.delay().await;
        self.store.check_online()?;
        self.store.inner.gets.fetch_add(1, Ordering::SeqCst);

        Ok(self.store.value(key).await)
    }

    async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.store.delay().await;
        self.store.check_online()?;
        self.store.inner.sets.fetch_add(1, Ordering::SeqCst);
        self.store.insert(key, value).await;

        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryStore {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection> {
        self.check_online()?;
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryConnection {
            store: self.clone(),
        })
    }
}
