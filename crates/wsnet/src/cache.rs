//! Reuse of dialers per key with single-flight creation and background
//! eviction of dead or idle entries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::watch;

use crate::dial::Dialer;
use crate::error::Error;

/// Dialers that have requested this many channels are replaced.
pub const MAX_CHANNELS_REQUESTED: usize = 32_500;
const PING_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_EVICT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("dialer cache closed")]
    Closed,
    #[error(transparent)]
    Dial(Arc<Error>),
}

/// What the cache needs from a dialer to judge its health.
#[async_trait]
pub trait CachedDialer: Send + Sync + 'static {
    fn is_closed(&self) -> bool;
    fn active_connections(&self) -> usize;
    fn channels_requested(&self) -> usize {
        0
    }
    async fn ping(&self) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

#[async_trait]
impl CachedDialer for Dialer {
    fn is_closed(&self) -> bool {
        Dialer::is_closed(self)
    }

    fn active_connections(&self) -> usize {
        Dialer::active_connections(self)
    }

    fn channels_requested(&self) -> usize {
        Dialer::channels_requested(self)
    }

    async fn ping(&self) -> Result<(), Error> {
        Dialer::ping(self).await
    }

    async fn close(&self) -> Result<(), Error> {
        Dialer::close(self).await
    }
}

type Flight<D> = Shared<BoxFuture<'static, Result<Arc<D>, Arc<Error>>>>;

enum Joined<D> {
    Cached(Arc<D>),
    Flight(Flight<D>),
}

struct Entries<D> {
    dialers: HashMap<String, Arc<D>>,
    atime: HashMap<String, Instant>,
}

struct CacheInner<D> {
    ttl: Duration,
    entries: RwLock<Entries<D>>,
    flights: Mutex<HashMap<String, Flight<D>>>,
    closed: watch::Sender<bool>,
}

/// Dialers keyed by destination. Entries unused for `ttl` without open
/// streams, or that fail a ping, are closed and removed every interval.
pub struct DialerCache<D: CachedDialer = Dialer> {
    inner: Arc<CacheInner<D>>,
}

impl<D: CachedDialer> DialerCache<D> {
    /// Must be called within a tokio runtime; the eviction task is spawned
    /// immediately.
    pub fn new(ttl: Duration) -> Self {
        Self::with_interval(ttl, DEFAULT_EVICT_INTERVAL)
    }

    pub fn with_interval(ttl: Duration, interval: Duration) -> Self {
        let (closed, closed_rx) = watch::channel(false);
        let inner = Arc::new(CacheInner {
            ttl,
            entries: RwLock::new(Entries {
                dialers: HashMap::new(),
                atime: HashMap::new(),
            }),
            flights: Mutex::new(HashMap::new()),
            closed,
        });
        spawn_evictor(Arc::downgrade(&inner), interval, closed_rx);
        Self { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().dialers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Returns the live dialer for `key`, creating one with `factory` if
    /// needed. Concurrent callers for the same key share one creation. The
    /// flag is true when an existing dialer was reused. Failures are not
    /// cached.
    pub async fn dial<F, Fut>(&self, key: &str, factory: F) -> Result<(Arc<D>, bool), CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<D, Error>> + Send + 'static,
    {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        if let Some(dialer) = self.cached(key) {
            return Ok((dialer, true));
        }

        let flight = match self.join_flight(key, factory) {
            Joined::Cached(dialer) => return Ok((dialer, true)),
            Joined::Flight(flight) => flight,
        };
        let dialer = flight.await.map_err(CacheError::Dial)?;

        if self.is_closed() {
            let _ = dialer.close().await;
            return Err(CacheError::Closed);
        }
        Ok((dialer, false))
    }

    /// Joins the in-flight creation for `key` or starts one. A flight that
    /// finished after the fast path missed has already stored its dialer, so
    /// the map is checked again under the flights lock.
    fn join_flight<F, Fut>(&self, key: &str, factory: F) -> Joined<D>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<D, Error>> + Send + 'static,
    {
        let mut flights = self.inner.flights.lock();
        if let Some(flight) = flights.get(key) {
            return Joined::Flight(flight.clone());
        }
        if let Some(dialer) = self.cached(key) {
            return Joined::Cached(dialer);
        }
        let flight = start_flight(self.inner.clone(), key.to_string(), factory());
        flights.insert(key.to_string(), flight.clone());
        Joined::Flight(flight)
    }

    fn cached(&self, key: &str) -> Option<Arc<D>> {
        let dialer = {
            let entries = self.inner.entries.read();
            entries.dialers.get(key).filter(|d| !d.is_closed()).cloned()
        }?;
        self.inner
            .entries
            .write()
            .atime
            .insert(key.to_string(), Instant::now());
        Some(dialer)
    }

    /// Closes and removes dialers that are closed, exhausted, idle past the
    /// ttl, or unresponsive.
    pub async fn evict(&self) {
        self.inner.evict().await;
    }

    /// Closes every cached dialer. Later calls to [`DialerCache::dial`]
    /// fail with [`CacheError::Closed`].
    pub async fn close(&self) -> Result<(), Error> {
        if self.inner.closed.send_replace(true) {
            return Ok(());
        }
        self.inner.flights.lock().clear();
        let dialers: Vec<_> = {
            let mut entries = self.inner.entries.write();
            entries.atime.clear();
            entries.dialers.drain().map(|(_, dialer)| dialer).collect()
        };
        let mut result = Ok(());
        for dialer in dialers {
            if let Err(err) = dialer.close().await {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

fn start_flight<D, Fut>(inner: Arc<CacheInner<D>>, key: String, dial: Fut) -> Flight<D>
where
    D: CachedDialer,
    Fut: Future<Output = Result<D, Error>> + Send + 'static,
{
    async move {
        let outcome = dial.await;
        let outcome = match outcome {
            Ok(dialer) => {
                let dialer = Arc::new(dialer);
                let mut entries = inner.entries.write();
                entries.dialers.insert(key.clone(), dialer.clone());
                entries.atime.insert(key.clone(), Instant::now());
                Ok(dialer)
            }
            Err(err) => {
                tracing::debug!(target = "wsnet::cache", key = %key, error = %err, "dial failed");
                Err(Arc::new(err))
            }
        };
        inner.flights.lock().remove(&key);
        outcome
    }
    .boxed()
    .shared()
}

impl<D: CachedDialer> CacheInner<D> {
    async fn evict(&self) {
        let snapshot: Vec<(String, Arc<D>, Option<Instant>)> = {
            let entries = self.entries.read();
            entries
                .dialers
                .iter()
                .map(|(key, dialer)| (key.clone(), dialer.clone(), entries.atime.get(key).copied()))
                .collect()
        };
        let ttl = self.ttl;
        let checks = snapshot.into_iter().map(|(key, dialer, atime)| async move {
            let evict = should_evict(dialer.as_ref(), atime, ttl).await;
            (key, dialer, evict)
        });

        for (key, dialer, evict) in join_all(checks).await {
            if !evict {
                continue;
            }
            tracing::debug!(target = "wsnet::cache", key = %key, "evicting dialer");
            if let Err(err) = dialer.close().await {
                tracing::debug!(target = "wsnet::cache", key = %key, error = %err, "close evicted dialer");
            }
            let mut entries = self.entries.write();
            let current = entries
                .dialers
                .get(&key)
                .is_some_and(|stored| Arc::ptr_eq(stored, &dialer));
            if current {
                entries.dialers.remove(&key);
                entries.atime.remove(&key);
            }
        }
    }
}

async fn should_evict<D: CachedDialer>(dialer: &D, atime: Option<Instant>, ttl: Duration) -> bool {
    if dialer.is_closed() || dialer.channels_requested() > MAX_CHANNELS_REQUESTED {
        return true;
    }
    let idle = atime.map_or(true, |atime| atime.elapsed() >= ttl);
    if dialer.active_connections() == 0 && idle {
        return true;
    }
    !matches!(
        tokio::time::timeout(PING_TIMEOUT, dialer.ping()).await,
        Ok(Ok(()))
    )
}

fn spawn_evictor<D: CachedDialer>(
    inner: Weak<CacheInner<D>>,
    interval: Duration,
    mut closed: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = crate::wait_closed(&mut closed) => return,
            }
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.evict().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct MockDialer {
        closed: AtomicBool,
        active: AtomicUsize,
        requested: AtomicUsize,
        pings: AtomicUsize,
        ping_fails: AtomicBool,
    }

    #[async_trait]
    impl CachedDialer for MockDialer {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn active_connections(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }

        fn channels_requested(&self) -> usize {
            self.requested.load(Ordering::SeqCst)
        }

        async fn ping(&self) -> Result<(), Error> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.ping_fails.load(Ordering::SeqCst) {
                return Err(Error::ConnectionClosed);
            }
            Ok(())
        }

        async fn close(&self) -> Result<(), Error> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn cache(ttl: Duration) -> DialerCache<MockDialer> {
        DialerCache::with_interval(ttl, Duration::from_secs(3600))
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn concurrent_dials_share_one_creation() {
        let cache = cache(Duration::from_secs(60));
        let created = Arc::new(AtomicUsize::new(0));
        let factory = || {
            let created = created.clone();
            move || async move {
                created.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(MockDialer::default())
            }
        };

        let (first, second) = tokio::join!(
            cache.dial("workspace", factory()),
            cache.dial("workspace", factory())
        );
        let (first, first_cached) = first.unwrap();
        let (second, second_cached) = second.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first_cached && !second_cached);
        assert_eq!(created.load(Ordering::SeqCst), 1);

        let (third, cached) = cache.dial("workspace", factory()).await.unwrap();
        assert!(cached);
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn finished_flights_are_not_repeated() {
        let cache = cache(Duration::from_secs(60));
        let (first, _) = cache
            .dial("key", || async { Ok(MockDialer::default()) })
            .await
            .unwrap();

        // A caller whose fast path missed just before the flight stored its
        // dialer must pick up that dialer instead of dialing again.
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let joined = cache.join_flight("key", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(MockDialer::default())
        });
        match joined {
            Joined::Cached(dialer) => assert!(Arc::ptr_eq(&first, &dialer)),
            Joined::Flight(_) => panic!("a live dialer was dialed again"),
        }
        assert_eq!(created.load(Ordering::SeqCst), 0);

        first.close().await.unwrap();
        match cache.join_flight("key", || async { Ok(MockDialer::default()) }) {
            Joined::Flight(flight) => {
                let replacement = flight.await.unwrap();
                assert!(!Arc::ptr_eq(&first, &replacement));
            }
            Joined::Cached(_) => panic!("closed dialer was reused"),
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn closed_dialers_are_replaced() {
        let cache = cache(Duration::from_secs(60));
        let (first, _) = cache
            .dial("key", || async { Ok(MockDialer::default()) })
            .await
            .unwrap();
        first.close().await.unwrap();

        let (second, cached) = cache
            .dial("key", || async { Ok(MockDialer::default()) })
            .await
            .unwrap();
        assert!(!cached);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn failures_are_not_cached() {
        let cache = cache(Duration::from_secs(60));
        let err = cache
            .dial("key", || async { Err::<MockDialer, _>(Error::Timeout("test dial")) })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Dial(inner) if matches!(*inner, Error::Timeout(_))));
        assert!(cache.is_empty());

        let (_, cached) = cache
            .dial("key", || async { Ok(MockDialer::default()) })
            .await
            .unwrap();
        assert!(!cached);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn idle_dialers_are_evicted_without_a_ping() {
        let cache = cache(Duration::ZERO);
        let (dialer, _) = cache
            .dial("key", || async { Ok(MockDialer::default()) })
            .await
            .unwrap();
        cache.evict().await;
        assert!(cache.is_empty());
        assert!(dialer.is_closed());
        assert_eq!(dialer.pings.load(Ordering::SeqCst), 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn busy_dialers_are_kept_while_they_answer_pings() {
        let cache = cache(Duration::ZERO);
        let (dialer, _) = cache
            .dial("key", || async { Ok(MockDialer::default()) })
            .await
            .unwrap();
        dialer.active.store(1, Ordering::SeqCst);

        cache.evict().await;
        assert_eq!(cache.len(), 1);
        assert_eq!(dialer.pings.load(Ordering::SeqCst), 1);

        dialer.ping_fails.store(true, Ordering::SeqCst);
        cache.evict().await;
        assert!(cache.is_empty());
        assert!(dialer.is_closed());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn exhausted_dialers_are_evicted() {
        let cache = cache(Duration::from_secs(60));
        let (dialer, _) = cache
            .dial("key", || async { Ok(MockDialer::default()) })
            .await
            .unwrap();
        dialer.active.store(1, Ordering::SeqCst);
        dialer
            .requested
            .store(MAX_CHANNELS_REQUESTED + 1, Ordering::SeqCst);
        cache.evict().await;
        assert!(cache.is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn closing_the_cache_closes_dialers() {
        let cache = cache(Duration::from_secs(60));
        let (dialer, _) = cache
            .dial("key", || async { Ok(MockDialer::default()) })
            .await
            .unwrap();
        cache.close().await.unwrap();
        assert!(dialer.is_closed());
        assert!(cache.close().await.is_ok());
        let err = cache
            .dial("key", || async { Ok(MockDialer::default()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Closed));
    }
}
