// Remote resource cache — serves from the durable store or performs one network fetch per load.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::Dispatcher;
use super::key::key_for_locator;
use super::scheduler::Scheduler;
use super::stats::{CacheStats, CacheStatsSnapshot};
use super::store::DiskStore;
use super::task::{Completion, TaskUnit};
use crate::config::{CacheConfig, Environment};
use crate::decode::Decode;
use crate::error::CacheError;
use crate::source::http_source::HttpSource;
use crate::source::traits::RemoteSource;

type Deliver<A> = Box<dyn FnOnce(Result<A, CacheError>) + Send + 'static>;
/// Coalescing slot: loads share a flight only when both the cache key and
/// the credentials match.
type FlightKey = (String, Option<String>);
type FlightMap<A> = Mutex<HashMap<FlightKey, Arc<Flight<A>>>>;

struct Waiter<A> {
    token: CancellationToken,
    deliver: Deliver<A>,
}

/// One outstanding fetch/decode for a key and the callers waiting on it.
struct Flight<A> {
    key: String,
    auth_token: Option<String>,
    token: CancellationToken,
    waiters: Mutex<Vec<Waiter<A>>>,
    registry: Option<Weak<FlightMap<A>>>,
}

impl<A> Flight<A> {
    fn new(key: String, auth_token: Option<String>, registry: Option<Weak<FlightMap<A>>>) -> Self {
        Self {
            key,
            auth_token,
            token: CancellationToken::new(),
            waiters: Mutex::new(Vec::new()),
            registry,
        }
    }

    fn slot(&self) -> FlightKey {
        (self.key.clone(), self.auth_token.clone())
    }

    fn attach(&self, waiter: Waiter<A>) {
        self.waiters.lock().push(waiter);
    }

    fn take_waiters(&self) -> Vec<Waiter<A>> {
        std::mem::take(&mut *self.waiters.lock())
    }
}

/// Type-erased cancellation side of a flight.
trait FlightControl: Send + Sync {
    fn release(&self);
}

impl<A: Send + 'static> FlightControl for Flight<A> {
    /// Abort the shared work once no live waiter remains.
    fn release(&self) {
        // Registry before waiters, the same order joins and seals use.
        let registry = self.registry.as_ref().and_then(Weak::upgrade);
        let mut map = registry.as_ref().map(|r| r.lock());

        let idle = self.waiters.lock().iter().all(|w| w.token.is_cancelled());
        if !idle {
            return;
        }
        self.token.cancel();

        if let Some(map) = map.as_mut() {
            let slot = self.slot();
            let ours = map
                .get(&slot)
                .is_some_and(|f| std::ptr::eq(Arc::as_ptr(f), self as *const Self));
            if ours {
                map.remove(&slot);
            }
        }
    }
}

/// Returned by every load. Cancelling after the result was handed to the
/// dispatcher is a no-op.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    flight: Option<Arc<dyn FlightControl>>,
}

impl CancelHandle {
    fn noop() -> Self {
        Self {
            token: CancellationToken::new(),
            flight: None,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
        if let Some(flight) = &self.flight {
            flight.release();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

enum Resolved<A> {
    Hit(A),
    Fetched(A, Bytes),
    Failed(CacheError),
    Cancelled,
}

struct CacheInner<D: Decode> {
    environment: Environment,
    store: Arc<DiskStore>,
    decoder: Arc<D>,
    source: Arc<dyn RemoteSource>,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    stats: CacheStats,
    inflight: Option<Arc<FlightMap<D::Artifact>>>,
    closed: AtomicBool,
}

/// Keyed cache of remote resources backed by a directory on disk.
///
/// Construct once and pass it to call sites; clones share the same store,
/// scheduler and dispatcher.
pub struct ResourceCache<D: Decode> {
    inner: Arc<CacheInner<D>>,
}

impl<D: Decode> Clone for ResourceCache<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Decode> ResourceCache<D> {
    /// Open a cache using the HTTP transport and a dedicated callback task.
    pub fn open(config: &CacheConfig, decoder: D) -> Result<Self> {
        Self::open_with(
            config,
            decoder,
            Arc::new(HttpSource::new()),
            Dispatcher::dedicated()?,
        )
    }

    pub fn open_with(
        config: &CacheConfig,
        decoder: D,
        source: Arc<dyn RemoteSource>,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        config.validate()?;
        let dir = config.resolve_cache_dir();
        let store = DiskStore::open(&dir)?;
        let scheduler = Scheduler::new(config.max_concurrency)?;

        info!(
            "resource cache opened dir={} env={} concurrency={} coalesce={}",
            dir.display(),
            config.environment,
            config.max_concurrency,
            config.coalesce_requests
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                environment: config.environment,
                store: Arc::new(store),
                decoder: Arc::new(decoder),
                source,
                scheduler,
                dispatcher,
                stats: CacheStats::new(),
                inflight: config
                    .coalesce_requests
                    .then(|| Arc::new(Mutex::new(HashMap::new()))),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Load `locator`, calling `on_loaded` with the artifact on success.
    /// Failures and cancellation produce no call.
    pub fn load<F>(&self, locator: &str, auth_token: Option<&str>, on_loaded: F) -> CancelHandle
    where
        F: FnOnce(D::Artifact) + Send + 'static,
    {
        self.start(
            locator,
            auth_token,
            Box::new(move |result| {
                if let Ok(artifact) = result {
                    on_loaded(artifact);
                }
            }),
            false,
        )
    }

    /// Like [`load`](Self::load) but every outcome other than the caller's
    /// own cancellation is reported.
    pub fn load_with_result<F>(
        &self,
        locator: &str,
        auth_token: Option<&str>,
        on_result: F,
    ) -> CancelHandle
    where
        F: FnOnce(Result<D::Artifact, CacheError>) + Send + 'static,
    {
        self.start(locator, auth_token, Box::new(on_result), true)
    }

    /// Await the outcome of a load. Requires the dispatcher to be drained.
    pub async fn get(
        &self,
        locator: &str,
        auth_token: Option<&str>,
    ) -> Result<D::Artifact, CacheError> {
        let (tx, rx) = oneshot::channel();
        let _handle = self.load_with_result(locator, auth_token, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(CacheError::Cancelled))
    }

    /// Overwrite the durable entry for `locator` without validating `data`.
    pub fn replace_in_cache(&self, locator: &str, data: &[u8]) -> Result<(), CacheError> {
        let (_, key) = key_for_locator(locator)?;
        self.inner
            .store
            .write(&key, data)
            .map_err(|e| CacheError::Store(e.to_string()))?;
        debug!("cache entry replaced key={} bytes={}", key, data.len());
        Ok(())
    }

    /// Whether a durable entry exists for `locator`. Says nothing about validity.
    pub fn contains(&self, locator: &str) -> bool {
        match key_for_locator(locator) {
            Ok((_, key)) => self.inner.store.contains(&key),
            Err(_) => false,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        self.inner.store.root()
    }

    pub fn environment(&self) -> Environment {
        self.inner.environment
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stop accepting loads and cancel queued ones. Entries on disk are kept.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            info!("resource cache closed dir={}", self.inner.store.root().display());
            self.inner.scheduler.shutdown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn start(
        &self,
        locator: &str,
        auth_token: Option<&str>,
        deliver: Deliver<D::Artifact>,
        report_errors: bool,
    ) -> CancelHandle {
        if self.is_closed() {
            debug!("load rejected, cache closed: {}", locator);
            if report_errors {
                self.inner
                    .dispatcher
                    .dispatch(Box::new(move || deliver(Err(CacheError::Closed))));
            }
            return CancelHandle::noop();
        }

        let (url, key) = match key_for_locator(locator) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("load rejected: {}", e);
                if report_errors {
                    self.inner.dispatcher.dispatch(Box::new(move || deliver(Err(e))));
                }
                return CancelHandle::noop();
            }
        };

        let waiter = Waiter {
            token: CancellationToken::new(),
            deliver,
        };
        let token = waiter.token.clone();

        let (flight, is_new) = self.join_flight(key, auth_token.map(str::to_string), waiter);
        if is_new {
            let inner = Arc::clone(&self.inner);
            let task_flight = Arc::clone(&flight);
            let unit = TaskUnit::with_token(flight.token.clone(), move |_token, completion| {
                Self::run_load(inner, task_flight, url, completion)
            });
            self.inner.scheduler.submit(unit);
        }

        CancelHandle {
            token,
            flight: Some(flight as Arc<dyn FlightControl>),
        }
    }

    /// Attach to a live flight for `key` and `auth_token` when coalescing,
    /// else start a new one.
    fn join_flight(
        &self,
        key: String,
        auth_token: Option<String>,
        waiter: Waiter<D::Artifact>,
    ) -> (Arc<Flight<D::Artifact>>, bool) {
        let Some(registry) = &self.inner.inflight else {
            let flight = Arc::new(Flight::new(key, auth_token, None));
            flight.attach(waiter);
            return (flight, true);
        };

        let mut map = registry.lock();
        let slot = (key, auth_token);
        if let Some(existing) = map.get(&slot) {
            if !existing.token.is_cancelled() {
                debug!("joining in-flight load key={}", slot.0);
                existing.attach(waiter);
                return (Arc::clone(existing), false);
            }
        }

        let flight = Arc::new(Flight::new(
            slot.0.clone(),
            slot.1.clone(),
            Some(Arc::downgrade(registry)),
        ));
        flight.attach(waiter);
        map.insert(slot, Arc::clone(&flight));
        (flight, true)
    }

    /// Detach the waiters of a finished flight; no new waiter can join after this.
    fn seal(inner: &CacheInner<D>, flight: &Arc<Flight<D::Artifact>>) -> Vec<Waiter<D::Artifact>> {
        match &inner.inflight {
            Some(registry) => {
                let mut map = registry.lock();
                let slot = flight.slot();
                if map.get(&slot).is_some_and(|f| Arc::ptr_eq(f, flight)) {
                    map.remove(&slot);
                }
                flight.take_waiters()
            }
            None => flight.take_waiters(),
        }
    }

    async fn run_load(
        inner: Arc<CacheInner<D>>,
        flight: Arc<Flight<D::Artifact>>,
        url: Url,
        completion: Completion,
    ) {
        inner.stats.increment_workers();
        let resolved = Self::resolve(&inner, &flight, &url).await;

        match resolved {
            Resolved::Hit(artifact) => {
                Self::deliver(&inner, &flight, Ok(artifact));
            }
            Resolved::Fetched(artifact, raw) => {
                Self::deliver(&inner, &flight, Ok(artifact));
                Self::persist(&inner, &flight.key, raw).await;
            }
            Resolved::Failed(error) => {
                Self::deliver(&inner, &flight, Err(error));
            }
            Resolved::Cancelled => {
                inner.stats.record_cancelled();
                let dropped = Self::seal(&inner, &flight).len();
                debug!("load cancelled key={} waiters={}", flight.key, dropped);
            }
        }

        inner.stats.decrement_workers();
        completion.signal();
    }

    /// Disk first, network on miss or unreadable entry. Polls the flight's
    /// token before and after each blocking step.
    async fn resolve(
        inner: &Arc<CacheInner<D>>,
        flight: &Flight<D::Artifact>,
        url: &Url,
    ) -> Resolved<D::Artifact> {
        let token = &flight.token;
        let key = &flight.key;
        let auth_token = flight.auth_token.as_deref();
        if token.is_cancelled() {
            return Resolved::Cancelled;
        }

        match Self::read_cached(inner, key).await {
            Ok(Some(artifact)) => {
                if token.is_cancelled() {
                    return Resolved::Cancelled;
                }
                debug!("cache hit key={}", key);
                inner.stats.record_hit();
                return Resolved::Hit(artifact);
            }
            Ok(None) => {}
            Err(e) => {
                // The entry is left on disk; a successful fetch replaces it.
                warn!("cached entry unusable key={}: {:#}", key, e);
                inner.stats.record_decode_failure();
            }
        }

        if token.is_cancelled() {
            return Resolved::Cancelled;
        }
        inner.stats.record_miss();
        inner.stats.record_fetch();
        debug!("cache miss key={}, fetching {}", key, url);

        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("fetch aborted key={}", key);
                return Resolved::Cancelled;
            }
            res = inner.source.fetch(url, auth_token) => res,
        };
        let raw = match fetched {
            Ok(raw) => raw,
            Err(e) => {
                warn!("fetch failed key={}: {:#}", key, e);
                inner.stats.record_fetch_failure();
                return Resolved::Failed(CacheError::Fetch(e.to_string()));
            }
        };

        if token.is_cancelled() {
            return Resolved::Cancelled;
        }

        let decoder = Arc::clone(&inner.decoder);
        let payload = raw.clone();
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&payload))
            .await
            .map_err(|e| anyhow!("decode task failed: {}", e))
            .and_then(|res| res);

        match decoded {
            Ok(artifact) => {
                if token.is_cancelled() {
                    return Resolved::Cancelled;
                }
                Resolved::Fetched(artifact, raw)
            }
            Err(e) => {
                warn!("fetched payload undecodable key={}: {:#}", key, e);
                inner.stats.record_decode_failure();
                Resolved::Failed(CacheError::Decode(e.to_string()))
            }
        }
    }

    async fn read_cached(inner: &Arc<CacheInner<D>>, key: &str) -> Result<Option<D::Artifact>> {
        let store = Arc::clone(&inner.store);
        let decoder = Arc::clone(&inner.decoder);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || match store.read(&key)? {
            Some(raw) => decoder.decode(&raw).map(Some),
            None => Ok(None),
        })
        .await
        .map_err(|e| anyhow!("cache read task failed: {}", e))?
    }

    /// Hand the outcome to every waiter that has not cancelled.
    fn deliver(
        inner: &CacheInner<D>,
        flight: &Arc<Flight<D::Artifact>>,
        result: Result<D::Artifact, CacheError>,
    ) {
        for waiter in Self::seal(inner, flight) {
            if waiter.token.is_cancelled() {
                inner.stats.record_cancelled();
                continue;
            }
            if result.is_ok() {
                inner.stats.record_delivery();
            }
            let result = result.clone();
            let deliver = waiter.deliver;
            inner.dispatcher.dispatch(Box::new(move || deliver(result)));
        }
    }

    async fn persist(inner: &Arc<CacheInner<D>>, key: &str, raw: Bytes) {
        let store = Arc::clone(&inner.store);
        let owned_key = key.to_string();
        let written = tokio::task::spawn_blocking(move || store.write(&owned_key, &raw))
            .await
            .map_err(|e| anyhow!("cache write task failed: {}", e))
            .and_then(|res| res);

        match written {
            Ok(()) => {
                inner.stats.record_write();
                debug!("cache entry written key={}", key);
            }
            Err(e) => warn!("cache write failed key={}: {:#}", key, e),
        }
    }
}
