//! Bounded cache of live objects with TTL eviction and single-flight loads.
//!
//! At most one load runs per key: the first caller installs a pending slot
//! and spawns the load on its own task; coalesced callers wait on the slot.
//! Cancelling a waiting `get` does not cancel the running load, so the other
//! waiters still receive it. A failed load is published to every waiter and
//! not cached.
//!
//! Entries are refcounted through [`CacheGuard`]s; an entry is eligible for
//! eviction once its refcount is zero and its last release is older than the
//! TTL. A periodic sweep closes and removes eligible entries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus_client::metrics::counter::Counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default sweep period of the garbage collector.
pub const DEFAULT_GC_PERIOD: Duration = Duration::from_secs(60);

/// Errors surfaced by cache operations.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CacheError {
    #[error("object is not cached")]
    NotFound,
    #[error("object is still referenced")]
    InUse,
    #[error("cache is closed")]
    Closed,
    #[error("load failed: {0}")]
    Load(Arc<anyhow::Error>),
}

/// How the loader should obtain the object.
#[derive(Debug, Clone)]
pub enum LoadMode<P> {
    /// Open an existing object.
    Open,
    /// Create the object from the given payload first.
    Create(P),
}

/// Typed loader input; replaces ambient context values with explicit data.
#[derive(Debug, Clone)]
pub struct LoadRequest<P> {
    pub id: String,
    pub mode: LoadMode<P>,
}

/// An object the cache can own.
pub trait CacheObject: Send + Sync + 'static {
    /// Called when the cache evicts the object.
    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Loads objects on cache misses.
pub trait Loader: Send + Sync + 'static {
    type Object: CacheObject;
    type CreatePayload: Send + 'static;

    fn load(
        &self,
        req: LoadRequest<Self::CreatePayload>,
    ) -> impl Future<Output = anyhow::Result<Self::Object>> + Send;
}

struct CacheEntry<T> {
    value: T,
    refs: AtomicU32,
    last_release: Mutex<Instant>,
    remove_pending: AtomicBool,
}

type LoadOutcome<T> = Result<Arc<CacheEntry<T>>, Arc<anyhow::Error>>;

enum Slot<T> {
    Loading(watch::Receiver<Option<LoadOutcome<T>>>),
    Ready(Arc<CacheEntry<T>>),
}

struct CacheState<T> {
    entries: Mutex<HashMap<String, Slot<T>>>,
    ttl: Duration,
    closed: AtomicBool,
    evictions: Counter,
}

/// A borrowed cache entry. Dropping the guard releases the reference and
/// stamps the release time used for TTL eviction.
pub struct CacheGuard<T: CacheObject> {
    key: String,
    entry: Arc<CacheEntry<T>>,
    state: Arc<CacheState<T>>,
}

impl<T: CacheObject> std::fmt::Debug for CacheGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGuard").field("key", &self.key).finish()
    }
}

impl<T: CacheObject> std::ops::Deref for CacheGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.entry.value
    }
}

impl<T: CacheObject> CacheGuard<T> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T: CacheObject> Drop for CacheGuard<T> {
    fn drop(&mut self) {
        *self.entry.last_release.lock() = Instant::now();
        let remaining = self.entry.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.entry.remove_pending.load(Ordering::SeqCst) {
            let mut entries = self.state.entries.lock();
            if let Some(Slot::Ready(current)) = entries.get(&self.key) {
                if Arc::ptr_eq(current, &self.entry) {
                    entries.remove(&self.key);
                    drop(entries);
                    if let Err(err) = self.entry.value.close() {
                        warn!(key = %self.key, %err, "closing removed cache object failed");
                    }
                }
            }
        }
    }
}

/// The cache itself; generic over the loader.
pub struct ObjectCache<L: Loader> {
    state: Arc<CacheState<L::Object>>,
    loader: Arc<L>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
    gc_period: Duration,
}

impl<L: Loader> ObjectCache<L> {
    pub fn new(loader: L, ttl: Duration) -> Self {
        Self::with_gc_period(loader, ttl, DEFAULT_GC_PERIOD)
    }

    pub fn with_gc_period(loader: L, ttl: Duration, gc_period: Duration) -> Self {
        ObjectCache {
            state: Arc::new(CacheState {
                entries: Mutex::new(HashMap::new()),
                ttl,
                closed: AtomicBool::new(false),
                evictions: Counter::default(),
            }),
            loader: Arc::new(loader),
            gc_task: Mutex::new(None),
            gc_period,
        }
    }

    /// The eviction counter, for registration with a metrics registry.
    pub fn evictions(&self) -> Counter {
        self.state.evictions.clone()
    }

    /// Starts the periodic GC sweep. Idempotent.
    pub fn run_gc(&self) {
        let mut task = self.gc_task.lock();
        if task.is_some() {
            return;
        }
        let state = self.state.clone();
        let period = self.gc_period;
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                sweep(&state);
            }
        }));
    }

    /// Borrows the object, loading it when absent. Concurrent callers for the
    /// same key share one load.
    pub async fn get(
        &self,
        req: LoadRequest<L::CreatePayload>,
    ) -> Result<CacheGuard<L::Object>, CacheError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        let key = req.id.clone();
        let rx = {
            let mut entries = self.state.entries.lock();
            match entries.get(&key) {
                Some(Slot::Ready(entry)) => {
                    entry.refs.fetch_add(1, Ordering::SeqCst);
                    return Ok(CacheGuard {
                        key,
                        entry: entry.clone(),
                        state: self.state.clone(),
                    });
                }
                Some(Slot::Loading(rx)) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    entries.insert(key.clone(), Slot::Loading(rx.clone()));
                    self.spawn_load(key.clone(), req, tx);
                    rx
                }
            }
        };
        self.wait_for(key, rx).await
    }

    fn spawn_load(
        &self,
        key: String,
        req: LoadRequest<L::CreatePayload>,
        tx: watch::Sender<Option<LoadOutcome<L::Object>>>,
    ) {
        let loader = self.loader.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let outcome = match loader.load(req).await {
                Ok(value) => {
                    let entry = Arc::new(CacheEntry {
                        value,
                        refs: AtomicU32::new(0),
                        last_release: Mutex::new(Instant::now()),
                        remove_pending: AtomicBool::new(false),
                    });
                    let mut entries = state.entries.lock();
                    entries.insert(key.clone(), Slot::Ready(entry.clone()));
                    Ok(entry)
                }
                Err(err) => {
                    debug!(%key, %err, "cache load failed");
                    // failed loads are not cached
                    state.entries.lock().remove(&key);
                    Err(Arc::new(err))
                }
            };
            let _ = tx.send(Some(outcome));
        });
    }

    async fn wait_for(
        &self,
        key: String,
        mut rx: watch::Receiver<Option<LoadOutcome<L::Object>>>,
    ) -> Result<CacheGuard<L::Object>, CacheError> {
        let outcome = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| CacheError::Closed)?
            .clone();
        match outcome {
            Some(Ok(entry)) => {
                entry.refs.fetch_add(1, Ordering::SeqCst);
                Ok(CacheGuard {
                    key,
                    entry,
                    state: self.state.clone(),
                })
            }
            Some(Err(err)) => Err(CacheError::Load(err)),
            None => Err(CacheError::Closed),
        }
    }

    /// Borrows the object only if it is already loaded.
    pub fn pick(&self, id: &str) -> Result<CacheGuard<L::Object>, CacheError> {
        let entries = self.state.entries.lock();
        match entries.get(id) {
            Some(Slot::Ready(entry)) => {
                entry.refs.fetch_add(1, Ordering::SeqCst);
                Ok(CacheGuard {
                    key: id.to_string(),
                    entry: entry.clone(),
                    state: self.state.clone(),
                })
            }
            _ => Err(CacheError::NotFound),
        }
    }

    /// Enumerates loaded entries without touching reference counts.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &L::Object),
    {
        let entries = self.state.entries.lock();
        for (key, slot) in entries.iter() {
            if let Slot::Ready(entry) = slot {
                f(key, &entry.value);
            }
        }
    }

    /// Loaded entry count.
    pub fn len(&self) -> usize {
        self.state
            .entries
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forces eviction. Fails with [`CacheError::InUse`] while the object is
    /// referenced; eviction then happens on the last release.
    pub fn remove(&self, id: &str) -> Result<(), CacheError> {
        let mut entries = self.state.entries.lock();
        match entries.get(id) {
            Some(Slot::Ready(entry)) => {
                if entry.refs.load(Ordering::SeqCst) > 0 {
                    entry.remove_pending.store(true, Ordering::SeqCst);
                    return Err(CacheError::InUse);
                }
                let entry = entry.clone();
                entries.remove(id);
                drop(entries);
                if let Err(err) = entry.value.close() {
                    warn!(key = %id, %err, "closing removed cache object failed");
                }
                Ok(())
            }
            Some(Slot::Loading(_)) => Err(CacheError::InUse),
            None => Err(CacheError::NotFound),
        }
    }

    /// Runs one GC sweep immediately.
    pub fn sweep_now(&self) {
        sweep(&self.state);
    }

    /// Stops the GC and closes every loaded entry.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.gc_task.lock().take() {
            task.abort();
        }
        let drained: Vec<(String, Slot<L::Object>)> =
            self.state.entries.lock().drain().collect();
        for (key, slot) in drained {
            if let Slot::Ready(entry) = slot {
                if let Err(err) = entry.value.close() {
                    warn!(%key, %err, "closing cache object failed");
                }
            }
        }
    }
}

fn sweep<T: CacheObject>(state: &Arc<CacheState<T>>) {
    let now = Instant::now();
    let mut evicted: Vec<(String, Arc<CacheEntry<T>>)> = Vec::new();
    {
        let mut entries = state.entries.lock();
        entries.retain(|key, slot| {
            let Slot::Ready(entry) = slot else {
                return true;
            };
            if entry.refs.load(Ordering::SeqCst) > 0 {
                return true;
            }
            let expired = now.duration_since(*entry.last_release.lock()) >= state.ttl;
            if expired || entry.remove_pending.load(Ordering::SeqCst) {
                evicted.push((key.clone(), entry.clone()));
                false
            } else {
                true
            }
        });
    }
    for (key, entry) in evicted {
        state.evictions.inc();
        debug!(%key, "evicting idle cache object");
        if let Err(err) = entry.value.close() {
            warn!(%key, %err, "closing evicted cache object failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct TestObject {
        id: String,
        closed: Arc<AtomicBool>,
    }

    impl CacheObject for TestObject {
        fn close(&self) -> anyhow::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct TestLoader {
        loads: Arc<AtomicUsize>,
        delay: Duration,
        fail: bool,
        closed_flags: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    }

    impl TestLoader {
        fn new() -> Self {
            TestLoader {
                loads: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
                fail: false,
                closed_flags: Arc::new(Mutex::new(HashMap::new())),
            }
        }
    }

    impl Loader for TestLoader {
        type Object = TestObject;
        type CreatePayload = ();

        fn load(
            &self,
            req: LoadRequest<()>,
        ) -> impl Future<Output = anyhow::Result<TestObject>> + Send {
            let loads = self.loads.clone();
            let delay = self.delay;
            let fail = self.fail;
            let flags = self.closed_flags.clone();
            async move {
                loads.fetch_add(1, Ordering::SeqCst);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if fail {
                    anyhow::bail!("load refused");
                }
                let closed = Arc::new(AtomicBool::new(false));
                flags.lock().insert(req.id.clone(), closed.clone());
                Ok(TestObject {
                    id: req.id,
                    closed,
                })
            }
        }
    }

    fn open(id: &str) -> LoadRequest<()> {
        LoadRequest {
            id: id.to_string(),
            mode: LoadMode::Open,
        }
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_load() {
        let loader = TestLoader {
            delay: Duration::from_millis(20),
            ..TestLoader::new()
        };
        let loads = loader.loads.clone();
        let cache = Arc::new(ObjectCache::new(loader, Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.get(open("k")).await.unwrap().id.clone() },
            ));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "k");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn failed_load_reaches_all_waiters_and_is_not_cached() {
        let loader = TestLoader {
            delay: Duration::from_millis(10),
            fail: true,
            ..TestLoader::new()
        };
        let loads = loader.loads.clone();
        let cache = Arc::new(ObjectCache::new(loader, Duration::from_secs(60)));

        let a = cache.get(open("k"));
        let b = cache.get(open("k"));
        let (ra, rb) = tokio::join!(a, b);
        assert!(matches!(ra, Err(CacheError::Load(_))));
        assert!(matches!(rb, Err(CacheError::Load(_))));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        // not cached: the next get loads again
        assert!(cache.get(open("k")).await.is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ttl_eviction_after_release() {
        let loader = TestLoader::new();
        let flags = loader.closed_flags.clone();
        let cache = ObjectCache::new(loader, Duration::from_millis(30));

        {
            let guard = cache.get(open("k")).await.unwrap();
            assert_eq!(guard.id, "k");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.sweep_now();
        assert!(matches!(cache.pick("k"), Err(CacheError::NotFound)));
        assert!(flags.lock()["k"].load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn referenced_entries_are_not_evicted() {
        let loader = TestLoader::new();
        let cache = ObjectCache::new(loader, Duration::from_millis(10));

        let guard = cache.get(open("k")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.sweep_now();
        assert!(cache.pick("k").is_ok());
        drop(guard);
    }

    #[tokio::test]
    async fn remove_defers_while_referenced() {
        let loader = TestLoader::new();
        let flags = loader.closed_flags.clone();
        let cache = ObjectCache::new(loader, Duration::from_secs(60));

        let guard = cache.get(open("k")).await.unwrap();
        let picked = cache.pick("k").unwrap();
        drop(picked);
        assert!(matches!(cache.remove("k"), Err(CacheError::InUse)));
        assert!(!flags.lock()["k"].load(Ordering::SeqCst));

        drop(guard);
        // the deferred eviction ran on the last release
        assert!(matches!(cache.pick("k"), Err(CacheError::NotFound)));
        assert!(flags.lock()["k"].load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn for_each_does_not_touch_refcounts() {
        let loader = TestLoader::new();
        let cache = ObjectCache::new(loader, Duration::from_secs(60));
        let _ = cache.get(open("a")).await.unwrap();
        let _ = cache.get(open("b")).await.unwrap();

        let mut seen = Vec::new();
        cache.for_each(|key, obj| {
            assert_eq!(key, obj.id);
            seen.push(key.to_string());
        });
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);

        // both guards were dropped above; remove succeeds immediately
        cache.remove("a").unwrap();
        cache.remove("b").unwrap();
    }
}
