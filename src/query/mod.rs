//! Graceful query execution on top of the cache store.
//!
//! A query is a cache key plus a fetch function. Executing it returns the
//! cached entry when fresh, otherwise runs the fetch (deduplicated per key,
//! retried with backoff on transient failures) and writes the outcome back
//! into the store, degrading to fallback data or stale-while-error.
//!
//! # Example
//!
//! ```ignore
//! let queries = QueryExecutor::new(store);
//! let api = api.clone();
//! let fetch = fetch_fn(move || {
//!   let api = api.clone();
//!   async move { api.execute(&Operation::VideoListItems).await }
//! });
//!
//! let entry = queries
//!   .execute(&cache_key!["video", "items"], fetch, QueryOptions::default())
//!   .await;
//! ```

mod observer;

pub use observer::QueryObserver;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::FetchError;
use crate::cache::{CacheEntry, CacheKey, CacheStore, EntryStatus, KeyPattern, Tier};

/// Factory for the future that fetches one key.
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync>;

/// Wrap a closure returning a future into a [`FetchFn`].
pub fn fetch_fn<F, Fut>(fetcher: F) -> FetchFn
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
  Arc::new(move || fetcher().boxed())
}

/// Per-call degradation options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
  /// Written as a fresh answer when the fetch fails
  pub fallback_data: Option<Value>,
  /// Keep failures away from the error reporter
  pub silent_fail: bool,
  /// Override the tier's transient retry count
  pub retry: Option<u32>,
}

impl QueryOptions {
  pub fn with_fallback(fallback: Value) -> Self {
    Self {
      fallback_data: Some(fallback),
      ..Default::default()
    }
  }

  pub fn silent(mut self) -> Self {
    self.silent_fail = true;
    self
  }

  pub fn with_retry(mut self, retries: u32) -> Self {
    self.retry = Some(retries);
    self
  }
}

/// Error-logging collaborator for failed reads.
pub trait ErrorReporter: Send + Sync {
  fn report(&self, key: &CacheKey, error: &FetchError);
}

/// Reports failed reads as `warn` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
  fn report(&self, key: &CacheKey, error: &FetchError) {
    warn!(key = %key, kind = error.kind(), error = %error, "Query failed");
  }
}

/// What the presentation layer reads for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
  pub data: Option<T>,
  pub status: EntryStatus,
  /// No data yet and a fetch is in flight
  pub is_loading: bool,
  /// A fetch is in flight, possibly over existing data
  pub is_fetching: bool,
  pub is_error: bool,
  pub error: Option<FetchError>,
}

impl<T: DeserializeOwned> QueryResult<T> {
  /// Decode an entry's payload. A payload that does not match `T` reads as
  /// an error with no data.
  pub fn from_entry(entry: &CacheEntry) -> Self {
    let decoded = entry
      .data
      .clone()
      .map(serde_json::from_value::<T>)
      .transpose();

    match decoded {
      Ok(data) => Self {
        data,
        status: entry.status,
        is_loading: entry.is_loading(),
        is_fetching: entry.is_fetching,
        is_error: entry.is_error(),
        error: entry.error.clone(),
      },
      Err(e) => Self {
        data: None,
        status: EntryStatus::Error,
        is_loading: false,
        is_fetching: entry.is_fetching,
        is_error: true,
        error: Some(e.into()),
      },
    }
  }
}

impl<T> QueryResult<T> {
  pub fn is_stale(&self) -> bool {
    self.status == EntryStatus::Stale
  }
}

type SharedFetch = Shared<BoxFuture<'static, CacheEntry>>;

struct InflightFetch {
  id: u64,
  future: SharedFetch,
  /// The key was invalidated while this fetch ran; fetch again once it ends
  refetch_after: bool,
}

#[derive(Clone)]
struct RegisteredQuery {
  fetch: FetchFn,
  options: QueryOptions,
}

#[derive(Default)]
struct ExecutorInner {
  /// Pending-request table, keyed like the store
  inflight: HashMap<CacheKey, InflightFetch>,
  /// Last fetch function seen per key, used for refetch after invalidation
  queries: HashMap<CacheKey, RegisteredQuery>,
  next_id: u64,
}

/// Graceful Query Executor. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct QueryExecutor {
  store: CacheStore,
  reporter: Arc<dyn ErrorReporter>,
  inner: Arc<Mutex<ExecutorInner>>,
}

impl QueryExecutor {
  pub fn new(store: CacheStore) -> Self {
    Self::with_reporter(store, Arc::new(TracingReporter))
  }

  pub fn with_reporter(store: CacheStore, reporter: Arc<dyn ErrorReporter>) -> Self {
    Self {
      store,
      reporter,
      inner: Arc::new(Mutex::new(ExecutorInner::default())),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  fn lock(&self) -> MutexGuard<'_, ExecutorInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Return the cached entry for `key` if fresh, otherwise fetch it.
  ///
  /// Concurrent calls for the same key share one fetch. Failures never
  /// propagate: they end up in the returned entry's status.
  pub async fn execute(&self, key: &CacheKey, fetch: FetchFn, options: QueryOptions) -> CacheEntry {
    let policy = self.store.policy_for(key);
    if let Some(entry) = self.store.get(key) {
      if entry.is_fresh(&policy, Instant::now()) {
        debug!(key = %key, "Cache hit");
        return entry;
      }
    }

    debug!(key = %key, "Cache miss");
    self.register(key, fetch.clone(), options.clone());
    self.fetch_shared(key, fetch, options).await
  }

  /// Like [`execute`](Self::execute) but skips the freshness check.
  pub async fn force_fetch(&self, key: &CacheKey, fetch: FetchFn, options: QueryOptions) -> CacheEntry {
    self.register(key, fetch.clone(), options.clone());
    self.fetch_shared(key, fetch, options).await
  }

  /// Refetch `key` with its registered fetch function, ignoring freshness.
  ///
  /// Returns `None` if nothing was ever executed for the key.
  pub async fn refetch(&self, key: &CacheKey) -> Option<CacheEntry> {
    let query = self.lock().queries.get(key).cloned()?;
    Some(self.fetch_shared(key, query.fetch, query.options).await)
  }

  /// Mark everything matching `patterns` stale, then refetch in the
  /// background every matched key that still has subscribers.
  ///
  /// A key whose fetch is already in flight is not joined: that fetch
  /// started before the invalidation, so its result lands stale and a new
  /// fetch follows it.
  ///
  /// Returns the keys a refetch was started or queued for.
  pub fn invalidate(&self, patterns: &[KeyPattern]) -> Vec<CacheKey> {
    let mut subscribed: Vec<CacheKey> = Vec::new();
    for pattern in patterns {
      for (key, subscribers) in self.store.mark_stale(pattern) {
        if subscribers > 0 && !subscribed.contains(&key) {
          subscribed.push(key);
        }
      }
    }

    let mut queued = Vec::new();
    let mut idle = Vec::new();
    {
      let mut inner = self.lock();
      for key in subscribed {
        if !inner.queries.contains_key(&key) {
          continue;
        }
        match inner.inflight.get_mut(&key) {
          Some(inflight) => {
            debug!(key = %key, "Refetch queued behind in-flight fetch");
            inflight.refetch_after = true;
            queued.push(key);
          }
          None => idle.push(key),
        }
      }
    }

    queued.extend(self.start_refetches(idle));
    queued
  }

  /// Background refetch of every subscribed key bound to `tier`.
  pub fn revalidate_tier(&self, tier: Tier) -> Vec<CacheKey> {
    let keys = self
      .store
      .subscribed_keys()
      .into_iter()
      .filter(|key| self.store.registry().tier_for(key) == tier)
      .collect();
    self.start_refetches(keys)
  }

  /// Whether a fetch for `key` is in flight.
  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    self.lock().inflight.contains_key(key)
  }

  fn start_refetches(&self, keys: Vec<CacheKey>) -> Vec<CacheKey> {
    self.prune();
    let mut started = Vec::new();
    for key in keys {
      let query = self.lock().queries.get(&key).cloned();
      if let Some(query) = query {
        // The fetch runs on its own task; nobody needs to await it.
        drop(self.fetch_shared(&key, query.fetch, query.options));
        started.push(key);
      }
    }
    if !started.is_empty() {
      debug!(keys = started.len(), "Started background refetches");
    }
    started
  }

  fn register(&self, key: &CacheKey, fetch: FetchFn, options: QueryOptions) {
    self
      .lock()
      .queries
      .insert(key.clone(), RegisteredQuery { fetch, options });
  }

  /// Drop registered fetch functions of evicted keys.
  fn prune(&self) {
    let store = self.store.clone();
    self.lock().queries.retain(|key, _| store.contains(key));
  }

  /// Join the in-flight fetch for `key` or start one.
  fn fetch_shared(&self, key: &CacheKey, fetch: FetchFn, options: QueryOptions) -> SharedFetch {
    let mut inner = self.lock();
    if let Some(inflight) = inner.inflight.get(key) {
      debug!(key = %key, "Joining in-flight fetch");
      return inflight.future.clone();
    }

    inner.next_id += 1;
    let id = inner.next_id;
    let started_at = self.store.begin_fetch(key);

    let this = self.clone();
    let task_key = key.clone();
    let handle = tokio::spawn(async move {
      let entry = this.run_fetch(&task_key, fetch, options, started_at).await;
      this.finish(&task_key, id);
      entry
    });

    let store = self.store.clone();
    let join_key = key.clone();
    let future = async move {
      match handle.await {
        Ok(entry) => entry,
        Err(e) => {
          warn!(key = %join_key, error = %e, "Fetch task aborted");
          store.end_fetch(&join_key);
          store
            .get(&join_key)
            .unwrap_or_else(|| CacheEntry::empty(join_key.clone(), store.registry().tier_for(&join_key)))
        }
      }
    }
    .boxed()
    .shared();

    inner.inflight.insert(
      key.clone(),
      InflightFetch {
        id,
        future: future.clone(),
        refetch_after: false,
      },
    );
    future
  }

  /// Drop the pending-request entry of fetch `id`, then start the fetch an
  /// invalidation queued behind it.
  fn finish(&self, key: &CacheKey, id: u64) {
    let queued = {
      let mut inner = self.lock();
      if inner.inflight.get(key).map(|f| f.id) != Some(id) {
        return;
      }
      match inner.inflight.remove(key) {
        Some(done) if done.refetch_after => inner.queries.get(key).cloned(),
        _ => None,
      }
    };

    if let Some(query) = queued {
      debug!(key = %key, "Refetching after invalidation");
      drop(self.fetch_shared(key, query.fetch, query.options));
    }
  }

  async fn run_fetch(
    &self,
    key: &CacheKey,
    fetch: FetchFn,
    options: QueryOptions,
    started_at: u64,
  ) -> CacheEntry {
    let policy = self.store.policy_for(key);
    let max_retries = options.retry.unwrap_or(policy.max_retries);

    let mut attempt = 0;
    let outcome = loop {
      match fetch().await {
        Ok(data) => break Ok(data),
        Err(error) if error.is_retriable() && attempt < max_retries => {
          let delay = policy.retry_delay(attempt);
          debug!(key = %key, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %error, "Retrying fetch");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(error) => break Err(error),
      }
    };

    match outcome {
      Ok(data) => self.store.put_fetched(key, data, started_at),
      Err(error) => {
        if !options.silent_fail {
          self.reporter.report(key, &error);
        }
        match options.fallback_data {
          Some(fallback) => {
            debug!(key = %key, kind = error.kind(), "Serving fallback data");
            self.store.put_fetched(key, fallback, started_at)
          }
          None => self.store.put_error(key, error),
        }
      }
    }
  }
}
