use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{CacheKey, EntrySnapshot, Outcome, Payload, Query, QueryStatus, Tag, TagIndex};

/// Keep unobserved entries for one minute before collecting them.
const DEFAULT_GC_DELAY_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an entry with no subscribers survives
    pub gc_delay: Duration,
    /// Fulfilled data older than this is refetched on the next read.
    /// `None` means only invalidation makes data stale.
    pub max_age: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gc_delay: Duration::from_secs(DEFAULT_GC_DELAY_SECS),
            max_age: None,
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Outcome>>;

struct Inflight {
    id: u64,
    /// Tag index sequence number when the fetch started
    started_seq: u64,
    /// Hit by an invalidation while the fetch was running
    invalidated: bool,
    future: SharedFetch,
}

struct Entry {
    query: Query,
    status: QueryStatus,
    data: Option<Payload>,
    error: Option<crate::api::QueryError>,
    tags: Vec<Tag>,
    subscribers: usize,
    fulfilled_at: Option<DateTime<Utc>>,
    /// Monotonic twin of `fulfilled_at`, used for `max_age`
    fetched_at: Option<Instant>,
    stale: bool,
    inflight: Option<Inflight>,
    gc: Option<JoinHandle<()>>,
    gc_generation: u64,
    tx: watch::Sender<EntrySnapshot>,
}

impl Entry {
    fn new(query: Query) -> Self {
        let (tx, _rx) = watch::channel(EntrySnapshot::uninitialized(query.key().clone()));
        Self {
            query,
            status: QueryStatus::Uninitialized,
            data: None,
            error: None,
            tags: Vec::new(),
            subscribers: 0,
            fulfilled_at: None,
            fetched_at: None,
            stale: false,
            inflight: None,
            gc: None,
            gc_generation: 0,
            tx,
        }
    }

    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            key: self.query.key().clone(),
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            tags: self.tags.clone(),
            subscribers: self.subscribers,
            fulfilled_at: self.fulfilled_at,
            stale: self.stale,
        }
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot());
    }

    /// Data that can be served without touching the network
    fn fresh_data(&self, max_age: Option<Duration>, now: Instant) -> Option<Payload> {
        if self.status != QueryStatus::Fulfilled || self.stale {
            return None;
        }
        if let (Some(max_age), Some(at)) = (max_age, self.fetched_at) {
            if now.saturating_duration_since(at) > max_age {
                return None;
            }
        }
        self.data.clone()
    }

    fn cancel_gc(&mut self) {
        self.gc_generation += 1;
        if let Some(handle) = self.gc.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    tags: TagIndex,
    next_flight: u64,
}

struct CacheInner {
    state: Mutex<CacheState>,
    config: CacheConfig,
}

/// Keyed store of query results with request deduplication and tag invalidation.
///
/// Clone is cheap and every clone shares the same entries. State transitions
/// happen under one lock that is never held across an `.await`, so each
/// transition is atomic with respect to the others. Methods that may start a
/// fetch must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct RequestCache {
    inner: Arc<CacheInner>,
}

/// Non-owning handle, used by timers and the dispatcher.
#[derive(Clone)]
pub struct WeakRequestCache {
    inner: Weak<CacheInner>,
}

impl WeakRequestCache {
    pub fn upgrade(&self) -> Option<RequestCache> {
        self.inner.upgrade().map(|inner| RequestCache { inner })
    }
}

impl RequestCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::default()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakRequestCache {
        WeakRequestCache {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return cached data for the query, joining or starting a fetch as needed.
    pub async fn read(&self, query: &Query) -> Outcome {
        let fetch = {
            let mut guard = self.state();
            let state = &mut *guard;
            let entry = state
                .entries
                .entry(query.key().clone())
                .or_insert_with(|| Entry::new(query.clone()));

            if let Some(flight) = &entry.inflight {
                trace!(key = %query.key(), "Joining in-flight request");
                flight.future.clone()
            } else if let Some(data) = entry.fresh_data(self.inner.config.max_age, Instant::now()) {
                trace!(key = %query.key(), "Cache hit");
                return Ok(data);
            } else {
                self.launch(state, query)
            }
        };
        fetch.await
    }

    /// Register a subscriber and return a receiver of entry snapshots.
    ///
    /// The first subscriber of an entry that has no usable data starts a fetch.
    pub fn subscribe(&self, query: &Query) -> watch::Receiver<EntrySnapshot> {
        let mut guard = self.state();
        let state = &mut *guard;
        let entry = state
            .entries
            .entry(query.key().clone())
            .or_insert_with(|| Entry::new(query.clone()));

        entry.cancel_gc();
        entry.subscribers += 1;
        entry.query = query.clone();

        let needs_fetch = entry.subscribers == 1
            && entry.inflight.is_none()
            && entry.fresh_data(self.inner.config.max_age, Instant::now()).is_none();
        let rx = entry.tx.subscribe();
        entry.publish();
        debug!(key = %query.key(), subscribers = entry.subscribers, needs_fetch, "Subscribed");

        if needs_fetch {
            self.launch(state, query);
        }
        rx
    }

    /// Drop one subscriber. The last one out starts the GC timer.
    pub fn unsubscribe(&self, key: &CacheKey) {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(entry) = state.entries.get_mut(key) else {
            warn!(key = %key, "Unsubscribe for unknown cache entry");
            return;
        };
        if entry.subscribers == 0 {
            warn!(key = %key, "Unsubscribe without a matching subscribe");
            return;
        }

        entry.subscribers -= 1;
        entry.publish();
        debug!(key = %key, subscribers = entry.subscribers, "Unsubscribed");

        // A pending fetch schedules GC itself once it settles
        if entry.subscribers == 0 && entry.inflight.is_none() {
            self.schedule_gc(state, key);
        }
    }

    /// Mark every entry provided under a tag matching `tags` as stale.
    ///
    /// Subscribed entries refetch right away, unobserved ones are dropped and
    /// entries with a fetch in flight refetch once more after it settles.
    pub fn invalidate(&self, tags: &[Tag]) -> Vec<CacheKey> {
        if tags.is_empty() {
            return Vec::new();
        }

        let mut guard = self.state();
        let state = &mut *guard;
        let keys = state.tags.invalidate(tags);

        let mut refetch = Vec::new();
        let mut evict = Vec::new();
        for key in &keys {
            let Some(entry) = state.entries.get_mut(key) else {
                continue;
            };
            entry.stale = true;
            if let Some(flight) = entry.inflight.as_mut() {
                flight.invalidated = true;
                entry.publish();
            } else if entry.subscribers > 0 {
                refetch.push(entry.query.clone());
            } else {
                evict.push(key.clone());
            }
        }

        debug!(
            tags = ?tags.iter().map(Tag::to_string).collect::<Vec<_>>(),
            hit = keys.len(),
            refetch = refetch.len(),
            evict = evict.len(),
            "Invalidated tags"
        );

        for query in &refetch {
            self.launch(state, query);
        }
        for key in &evict {
            Self::evict(state, key);
        }
        Self::prune_history(state);
        keys.into_iter().collect()
    }

    pub fn snapshot(&self, key: &CacheKey) -> Option<EntrySnapshot> {
        self.state().entries.get(key).map(Entry::snapshot)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self.state().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// Start a fetch for `query` and mark its entry pending.
    fn launch(&self, state: &mut CacheState, query: &Query) -> SharedFetch {
        state.next_flight += 1;
        let id = state.next_flight;
        let started_seq = state.tags.seq();
        let entry = state
            .entries
            .entry(query.key().clone())
            .or_insert_with(|| Entry::new(query.clone()));

        entry.cancel_gc();
        entry.query = query.clone();

        let request = query.fetch();
        let cache = self.clone();
        let key = query.key().clone();
        let future = async move {
            let outcome = request.await.map(Arc::new);
            cache.settle(&key, id, &outcome);
            outcome
        }
        .boxed()
        .shared();

        entry.status = QueryStatus::Pending;
        entry.inflight = Some(Inflight {
            id,
            started_seq,
            invalidated: false,
            future: future.clone(),
        });
        entry.publish();
        debug!(key = %query.key(), flight = id, "Fetch started");

        // Drive the fetch to completion even if every awaiter goes away
        tokio::spawn(future.clone().map(|_| ()));
        future
    }

    /// Record the outcome of fetch `id` on its entry.
    fn settle(&self, key: &CacheKey, id: u64, outcome: &Outcome) {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(entry) = state.entries.get_mut(key) else {
            trace!(key = %key, flight = id, "Fetch settled after eviction");
            return;
        };
        let flight = match entry.inflight.take() {
            Some(flight) if flight.id == id => flight,
            other => {
                entry.inflight = other;
                return;
            }
        };

        match outcome {
            Ok(data) => {
                entry.tags = entry.query.tags_for(data);
                entry.status = QueryStatus::Fulfilled;
                entry.data = Some(data.clone());
                entry.error = None;
                entry.fulfilled_at = Some(Utc::now());
                entry.fetched_at = Some(Instant::now());
            }
            Err(err) => {
                entry.status = QueryStatus::Rejected;
                entry.error = Some(err.clone());
                if entry.tags.is_empty() {
                    entry.tags = entry.query.known_tags().to_vec();
                }
            }
        }
        state.tags.index(key, &entry.tags);

        let invalidated =
            flight.invalidated || state.tags.invalidated_since(&entry.tags, flight.started_seq);
        entry.stale = invalidated;
        entry.publish();
        debug!(
            key = %key,
            flight = id,
            status = %entry.status,
            invalidated,
            "Fetch settled"
        );

        let subscribers = entry.subscribers;
        let query = entry.query.clone();
        if invalidated {
            if subscribers > 0 {
                self.launch(state, &query);
            } else {
                Self::evict(state, key);
            }
        } else if subscribers == 0 {
            self.schedule_gc(state, key);
        }
        Self::prune_history(state);
    }

    /// Forget invalidations no fetch still in flight can be affected by.
    fn prune_history(state: &mut CacheState) {
        let oldest = state
            .entries
            .values()
            .filter_map(|entry| entry.inflight.as_ref().map(|flight| flight.started_seq))
            .min();
        state.tags.prune(oldest);
    }

    fn schedule_gc(&self, state: &mut CacheState, key: &CacheKey) {
        let delay = self.inner.config.gc_delay;
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) if !delay.is_zero() => runtime,
            _ => {
                Self::evict(state, key);
                return;
            }
        };
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };

        entry.cancel_gc();
        let generation = entry.gc_generation;
        let cache = self.downgrade();
        let gc_key = key.clone();
        entry.gc = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(cache) = cache.upgrade() {
                cache.collect(&gc_key, generation);
            }
        }));
        trace!(key = %key, delay_secs = delay.as_secs(), "GC scheduled");
    }

    fn collect(&self, key: &CacheKey, generation: u64) {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        if entry.subscribers > 0 || entry.inflight.is_some() || entry.gc_generation != generation {
            return;
        }
        // This task is the timer; nothing left to abort
        entry.gc = None;
        debug!(key = %key, "Collected unused cache entry");
        Self::evict(state, key);
    }

    fn evict(state: &mut CacheState, key: &CacheKey) {
        if let Some(mut entry) = state.entries.remove(key) {
            entry.cancel_gc();
        }
        state.tags.remove(key);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::QueryError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, &json!(null))
    }

    /// Query whose fetcher counts calls and returns `value`.
    fn counted(name: &str, calls: &Arc<AtomicUsize>, value: Value, tags: Vec<Tag>) -> Query {
        let calls = calls.clone();
        Query::new(key(name), move || {
            let calls = calls.clone();
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        })
        .provides(tags)
    }

    /// Like `counted`, but every fetch waits for a permit from `gate`.
    fn gated(name: &str, calls: &Arc<AtomicUsize>, gate: &Arc<Semaphore>, tags: Vec<Tag>) -> Query {
        let calls = calls.clone();
        let gate = gate.clone();
        Query::new(key(name), move || {
            let calls = calls.clone();
            let gate = gate.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let permit = gate.acquire().await.map_err(|e| QueryError::Network(e.to_string()))?;
                permit.forget();
                Ok(json!({ "fetch": n }))
            }
        })
        .provides(tags)
    }

    async fn settled(rx: &mut watch::Receiver<EntrySnapshot>) -> EntrySnapshot {
        rx.wait_for(|s| s.is_settled() && !s.stale)
            .await
            .expect("cache dropped")
            .clone()
    }

    #[tokio::test]
    async fn test_read_fetches_once_then_hits() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counted("listShops", &calls, json!([{"id": "1"}]), vec![Tag::all("Shop")]);

        let first = cache.read(&query).await.expect("first read");
        let second = cache.read(&query).await.expect("second read");

        assert_eq!(*first, json!([{"id": "1"}]));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snapshot = cache.snapshot(query.key()).expect("entry exists");
        assert_eq!(snapshot.status, QueryStatus::Fulfilled);
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.tags, vec![Tag::all("Shop")]);
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_fetch() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let query = gated("listShops", &calls, &gate, vec![Tag::all("Shop")]);

        let (a, b, ()) = tokio::join!(cache.read(&query), cache.read(&query), async {
            gate.add_permits(10);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let a = a.expect("first awaiter");
        let b = b.expect("second awaiter");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_two_subscribers_share_one_fetch() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counted("listShops", &calls, json!([{"id": "1"}]), vec![Tag::all("Shop")]);

        let mut rx1 = cache.subscribe(&query);
        let mut rx2 = cache.subscribe(&query);
        let s1 = settled(&mut rx1).await;
        let s2 = settled(&mut rx2).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(s1.status, QueryStatus::Fulfilled);
        assert_eq!(s1.data, s2.data);
        assert_eq!(s2.subscribers, 2);
    }

    #[tokio::test]
    async fn test_rejected_keeps_error_and_does_not_retry() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let query = Query::new(key("listOrders"), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(QueryError::Server {
                    status: 503,
                    message: "maintenance".to_string(),
                })
            }
        });

        let mut rx = cache.subscribe(&query);
        let snapshot = settled(&mut rx).await;
        assert_eq!(snapshot.status, QueryStatus::Rejected);
        assert!(snapshot.data.is_none());
        assert!(matches!(snapshot.error, Some(QueryError::Server { status: 503, .. })));

        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Retrying is the caller's call
        let err = cache.read(&query).await.expect_err("still failing");
        assert!(err.is_server());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_refetches_subscribed_entry() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counted("listShops", &calls, json!([]), vec![Tag::all("Shop")]);

        let mut rx = cache.subscribe(&query);
        settled(&mut rx).await;

        let hit = cache.invalidate(&[Tag::new("Shop", "1")]);
        assert_eq!(hit, vec![query.key().clone()]);

        let snapshot = cache.snapshot(query.key()).expect("entry kept");
        assert!(snapshot.stale);
        assert_eq!(snapshot.status, QueryStatus::Pending);
        // Stale data stays visible while revalidating
        assert!(snapshot.data.is_some());

        let snapshot = settled(&mut rx).await;
        assert_eq!(snapshot.status, QueryStatus::Fulfilled);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_drops_unobserved_entry() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counted("listShops", &calls, json!([]), vec![Tag::all("Shop")]);

        cache.read(&query).await.expect("read");
        assert_eq!(cache.len(), 1);

        let hit = cache.invalidate(&[Tag::all("Shop")]);
        assert_eq!(hit.len(), 1);
        assert!(cache.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_hits_exactly_matching_entries() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let shop = counted("getShop", &calls, json!({"id": "1"}), vec![Tag::new("Shop", "1")]);
        let other = counted("getShop2", &calls, json!({"id": "2"}), vec![Tag::new("Shop", "2")]);
        let orders = counted("listOrders", &calls, json!([]), vec![Tag::all("Order")]);

        let mut rx_shop = cache.subscribe(&shop);
        let mut rx_other = cache.subscribe(&other);
        let mut rx_orders = cache.subscribe(&orders);
        settled(&mut rx_shop).await;
        settled(&mut rx_other).await;
        settled(&mut rx_orders).await;

        let hit = cache.invalidate(&[Tag::new("Shop", "1")]);
        assert_eq!(hit, vec![shop.key().clone()]);
        assert!(cache.snapshot(shop.key()).expect("shop").stale);
        assert!(!cache.snapshot(other.key()).expect("other").stale);
        assert!(!cache.snapshot(orders.key()).expect("orders").stale);
    }

    #[tokio::test]
    async fn test_invalidation_during_fetch_refetches_exactly_once() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let query = gated("listShops", &calls, &gate, vec![Tag::all("Shop")]);

        let mut rx = cache.subscribe(&query);
        tokio::task::yield_now().await;

        // Tags are unknown until the first response; both invalidations
        // arrive while it is in flight
        cache.invalidate(&[Tag::all("Shop")]);
        cache.invalidate(&[Tag::new("Shop", "3")]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gate.add_permits(10);
        let snapshot = settled(&mut rx).await;
        assert_eq!(snapshot.data.as_deref(), Some(&json!({"fetch": 2})));

        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_during_fetch_does_not_abort_it() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let query = gated("listShops", &calls, &gate, vec![Tag::all("Shop")]);

        let rx = cache.subscribe(&query);
        drop(rx);
        cache.unsubscribe(query.key());

        let (outcome, ()) = tokio::join!(cache.read(&query), async {
            gate.add_permits(1);
        });
        assert_eq!(*outcome.expect("fetch completes"), json!({"fetch": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_collects_after_delay() {
        let cache = RequestCache::new(CacheConfig {
            gc_delay: Duration::from_secs(30),
            max_age: None,
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counted("listShops", &calls, json!([]), vec![Tag::all("Shop")]);

        let mut rx = cache.subscribe(&query);
        settled(&mut rx).await;
        cache.unsubscribe(query.key());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_cancels_gc() {
        let cache = RequestCache::new(CacheConfig {
            gc_delay: Duration::from_secs(30),
            max_age: None,
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counted("listShops", &calls, json!([]), vec![Tag::all("Shop")]);

        let mut rx = cache.subscribe(&query);
        settled(&mut rx).await;
        cache.unsubscribe(query.key());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let _rx = cache.subscribe(&query);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(cache.len(), 1);
        // Still fresh, so the returning subscriber did not refetch
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_gc_delay_evicts_immediately() {
        let cache = RequestCache::new(CacheConfig {
            gc_delay: Duration::ZERO,
            max_age: None,
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counted("listShops", &calls, json!([]), Vec::new());

        let mut rx = cache.subscribe(&query);
        settled(&mut rx).await;
        cache.unsubscribe(query.key());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_age_expires_data() {
        let cache = RequestCache::new(CacheConfig {
            gc_delay: Duration::from_secs(600),
            max_age: Some(Duration::from_secs(30)),
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counted("listShops", &calls, json!([]), Vec::new());

        cache.read(&query).await.expect("first read");
        tokio::time::advance(Duration::from_secs(10)).await;
        cache.read(&query).await.expect("still fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        cache.read(&query).await.expect("refetched");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidation_history_empties_once_fetches_settle() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let query = gated("listShops", &calls, &gate, vec![Tag::all("Shop")]);

        for i in 0..1000 {
            cache.invalidate(&[Tag::new("Shop", i.to_string())]);
        }
        assert_eq!(cache.state().tags.history_len(), 0);

        // Kept while a fetch that started before them is in flight
        let mut rx = cache.subscribe(&query);
        cache.invalidate(&[Tag::new("Shop", "1")]);
        cache.invalidate(&[Tag::new("Order", "1")]);
        assert!(cache.state().tags.history_len() > 0);

        gate.add_permits(10);
        settled(&mut rx).await;
        assert_eq!(cache.state().tags.history_len(), 0);
    }

    #[tokio::test]
    async fn test_rejected_first_fetch_is_reached_by_known_tags() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let query = Query::new(key("listOrders"), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(QueryError::AuthExpired)
                } else {
                    Ok(json!([]))
                }
            }
        })
        .provides(vec![Tag::all("Order")]);

        let mut rx = cache.subscribe(&query);
        let snapshot = settled(&mut rx).await;
        assert_eq!(snapshot.status, QueryStatus::Rejected);
        assert_eq!(snapshot.tags, vec![Tag::all("Order")]);

        cache.invalidate(&[Tag::new("Order", "4")]);
        let snapshot = settled(&mut rx).await;
        assert_eq!(snapshot.status, QueryStatus::Fulfilled);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_weak_handle_does_not_keep_cache_alive() {
        let cache = RequestCache::new(CacheConfig::default());
        let weak = cache.downgrade();
        assert!(weak.upgrade().is_some());
        drop(cache);
        assert!(weak.upgrade().is_none());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_subscribe_churn_fetches_at_most_once(ops in proptest::collection::vec(any::<bool>(), 1..40)) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");

                let (calls, snapshot) = runtime.block_on(async {
                    let cache = RequestCache::new(CacheConfig::default());
                    let calls = Arc::new(AtomicUsize::new(0));
                    let query = counted("listShops", &calls, json!([{"id": "1"}]), vec![Tag::all("Shop")]);
                    let mut subscribed = 0usize;

                    for subscribe in ops {
                        if subscribe {
                            let _rx = cache.subscribe(&query);
                            subscribed += 1;
                        } else if subscribed > 0 {
                            cache.unsubscribe(query.key());
                            subscribed -= 1;
                        }
                        tokio::task::yield_now().await;
                    }
                    cache.read(&query).await.expect("read");
                    (calls.load(Ordering::SeqCst), cache.snapshot(query.key()))
                });

                prop_assert_eq!(calls, 1);
                let snapshot = snapshot.expect("entry within gc delay");
                prop_assert_eq!(snapshot.status, QueryStatus::Fulfilled);
                prop_assert!(snapshot.data.is_some());
                prop_assert!(snapshot.error.is_none());
            }
        }
    }
}
