//! Poll-based read handle for the presentation layer.
//!
//! A `QueryObserver<T>` subscribes to one cache key for as long as it lives
//! and exposes the three things a view renders: data, a loading flag and an
//! error flag.
//!
//! ```ignore
//! let mut wallet: QueryObserver<WalletBalance> = client.observe(Operation::WalletGetBalance {
//!   id: "u1".into(),
//! });
//! wallet.mount();
//!
//! // In event loop tick
//! if wallet.poll() {
//!   // Entry changed, trigger re-render
//! }
//!
//! match (wallet.data(), wallet.is_loading(), wallet.is_error()) {
//!   (Some(balance), _, _) => render_balance(balance),
//!   (None, true, _) => render_spinner(),
//!   (None, _, true) => render_error(wallet.error()),
//!   _ => {}
//! }
//! ```

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use super::{FetchFn, QueryExecutor, QueryOptions, QueryResult};
use crate::api::FetchError;
use crate::cache::{CacheEntry, CacheKey, EntryStatus, Subscription};

/// Subscriber to one query. Dropping it unsubscribes.
pub struct QueryObserver<T> {
  executor: QueryExecutor,
  subscription: Subscription,
  fetch: FetchFn,
  options: QueryOptions,
  result: QueryResult<T>,
  pending: Option<JoinHandle<CacheEntry>>,
}

impl<T: DeserializeOwned> QueryObserver<T> {
  /// Subscribe to `key` without fetching. Call [`mount`](Self::mount) to load.
  pub fn new(executor: QueryExecutor, key: CacheKey, fetch: FetchFn, options: QueryOptions) -> Self {
    let mut subscription = executor.store().subscribe(&key);
    let result = QueryResult::from_entry(&subscription.current_and_mark_seen());
    Self {
      executor,
      subscription,
      fetch,
      options,
      result,
      pending: None,
    }
  }

  /// Fetch on attach unless the cached entry can be served as is.
  ///
  /// Errored entries are only retried when the key's tier allows retry on
  /// mount. Returns whether a fetch was started.
  pub fn mount(&mut self) -> bool {
    let key = self.subscription.key().clone();
    let policy = self.executor.store().policy_for(&key);
    let status = self
      .executor
      .store()
      .get(&key)
      .map(|entry| entry.status)
      .unwrap_or(EntryStatus::Empty);

    let needed = match status {
      EntryStatus::Fresh => false,
      EntryStatus::Error => policy.retry_on_mount,
      EntryStatus::Empty | EntryStatus::Loading | EntryStatus::Stale => true,
    };
    if needed {
      self.fetch();
    }
    self.poll();
    needed
  }

  /// Start a fetch unless one from this observer is still running.
  pub fn fetch(&mut self) {
    if self.is_pending() {
      return;
    }
    let executor = self.executor.clone();
    let key = self.subscription.key().clone();
    let fetch = self.fetch.clone();
    let options = self.options.clone();
    self.pending = Some(tokio::spawn(async move {
      executor.execute(&key, fetch, options).await
    }));
  }

  /// Fetch even if the cached entry is fresh.
  pub fn refetch(&mut self) {
    let executor = self.executor.clone();
    let key = self.subscription.key().clone();
    let fetch = self.fetch.clone();
    let options = self.options.clone();
    self.pending = Some(tokio::spawn(async move {
      executor.force_fetch(&key, fetch, options).await
    }));
  }

  /// Pick up the latest entry if it changed.
  ///
  /// Returns `true` if the result changed. Call this in your event loop tick.
  pub fn poll(&mut self) -> bool {
    if !self.subscription.has_changed() {
      return false;
    }
    self.result = QueryResult::from_entry(&self.subscription.current_and_mark_seen());
    true
  }

  /// Wait for the next write to the key and pick it up.
  ///
  /// Returns `false` if the entry was evicted.
  pub async fn changed(&mut self) -> bool {
    if !self.subscription.changed().await {
      return false;
    }
    self.result = QueryResult::from_entry(&self.subscription.current_and_mark_seen());
    true
  }

  fn is_pending(&self) -> bool {
    self
      .pending
      .as_ref()
      .map(|handle| !handle.is_finished())
      .unwrap_or(false)
  }
}

impl<T> QueryObserver<T> {
  pub fn key(&self) -> &CacheKey {
    self.subscription.key()
  }

  pub fn result(&self) -> &QueryResult<T> {
    &self.result
  }

  pub fn data(&self) -> Option<&T> {
    self.result.data.as_ref()
  }

  pub fn status(&self) -> EntryStatus {
    self.result.status
  }

  pub fn is_loading(&self) -> bool {
    self.result.is_loading
  }

  pub fn is_error(&self) -> bool {
    self.result.is_error
  }

  pub fn is_stale(&self) -> bool {
    self.result.is_stale()
  }

  pub fn error(&self) -> Option<&FetchError> {
    self.result.error.as_ref()
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for QueryObserver<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", self.subscription.key())
      .field("result", &self.result)
      .finish_non_exhaustive()
  }
}
