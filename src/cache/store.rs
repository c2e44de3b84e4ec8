//! Process-wide keyed table of cache entries.
//!
//! Every entry lives behind a `watch` channel: writes replace the value and
//! wake subscribers in one step, so a subscriber never observes a partial
//! write. The table lock is never held across an `.await`.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheEntry, EntryStatus};
use super::key::{CacheKey, KeyPattern};
use super::policy::{StalenessPolicy, StalenessRegistry};
use crate::api::FetchError;

/// Default time an unsubscribed entry survives before eviction.
pub const DEFAULT_EVICTION_GRACE: Duration = Duration::from_secs(300);

struct Slot {
  tx: watch::Sender<CacheEntry>,
  /// Set while no subscriber is attached
  idle_since: Option<Instant>,
  eviction: Option<AbortHandle>,
  /// Bumped on every subscribe so stale eviction timers do nothing
  generation: u64,
  /// Bumped on every `mark_stale`; fetches started before a bump land stale
  invalidations: u64,
}

impl Slot {
  fn new(entry: CacheEntry) -> Self {
    let (tx, _rx) = watch::channel(entry);
    Self {
      tx,
      idle_since: Some(Instant::now()),
      eviction: None,
      generation: 0,
      invalidations: 0,
    }
  }

  fn entry(&self) -> CacheEntry {
    self.tx.borrow().clone()
  }

  fn write(&self, data: Value, status: EntryStatus) {
    self.tx.send_modify(|entry| {
      entry.data = Some(data);
      entry.status = status;
      entry.fetched_at = Some(Instant::now());
      entry.error = None;
      entry.is_fetching = false;
      entry.version += 1;
    });
  }

  fn cancel_eviction(&mut self) {
    if let Some(handle) = self.eviction.take() {
      handle.abort();
    }
  }
}

#[derive(Default)]
struct StoreInner {
  slots: HashMap<CacheKey, Slot>,
}

/// Shared cache table. Cloning is cheap and every clone sees the same table.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<Mutex<StoreInner>>,
  registry: Arc<StalenessRegistry>,
  eviction_grace: Duration,
}

impl CacheStore {
  pub fn new(registry: StalenessRegistry) -> Self {
    Self {
      inner: Arc::new(Mutex::new(StoreInner::default())),
      registry: Arc::new(registry),
      eviction_grace: DEFAULT_EVICTION_GRACE,
    }
  }

  /// Set the grace period between the last unsubscribe and eviction.
  pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
    self.eviction_grace = grace;
    self
  }

  pub fn registry(&self) -> &StalenessRegistry {
    &self.registry
  }

  pub fn policy_for(&self, key: &CacheKey) -> StalenessPolicy {
    self.registry.policy_for_key(key)
  }

  fn lock(&self) -> MutexGuard<'_, StoreInner> {
    // Writes complete under the lock before it is released, so a poisoned
    // table is still consistent.
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn grace_for(&self, key: &CacheKey) -> Duration {
    self.eviction_grace.min(self.policy_for(key).gc_time)
  }

  fn slot_mut<'a>(&self, inner: &'a mut StoreInner, key: &CacheKey) -> &'a mut Slot {
    inner.slots.entry(key.clone()).or_insert_with(|| {
      let tier = self.registry.tier_for(key);
      debug!(key = %key, tier = %tier, "Creating cache entry");
      Slot::new(CacheEntry::empty(key.clone(), tier))
    })
  }

  /// Current entry for `key`.
  ///
  /// A fresh entry whose age has reached its tier's max-age is moved to
  /// `stale` before it is returned.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    let inner = self.lock();
    let slot = inner.slots.get(key)?;
    let policy = self.policy_for(key);
    let now = Instant::now();
    slot.tx.send_if_modified(|entry| {
      if entry.status == EntryStatus::Fresh && !entry.is_fresh(&policy, now) {
        entry.status = EntryStatus::Stale;
        true
      } else {
        false
      }
    });
    Some(slot.entry())
  }

  /// Replace or create the entry with `data` and `status`, stamping it now.
  ///
  /// Subscribers of this exact key are notified after the write.
  pub fn put(&self, key: &CacheKey, data: Value, status: EntryStatus) -> CacheEntry {
    let mut inner = self.lock();
    let slot = self.slot_mut(&mut inner, key);
    slot.write(data, status);
    debug!(key = %key, status = status.name(), "Stored cache entry");
    slot.entry()
  }

  /// Write a fetch result that started when the entry's invalidation count
  /// was `started_at`.
  ///
  /// The result is `fresh` only if nothing invalidated the key while the
  /// fetch ran; otherwise it is stored `stale`.
  pub(crate) fn put_fetched(&self, key: &CacheKey, data: Value, started_at: u64) -> CacheEntry {
    let mut inner = self.lock();
    let slot = self.slot_mut(&mut inner, key);
    let status = if slot.invalidations == started_at {
      EntryStatus::Fresh
    } else {
      debug!(key = %key, "Fetch result predates an invalidation");
      EntryStatus::Stale
    };
    slot.write(data, status);
    slot.entry()
  }

  /// Record a failed fetch, keeping whatever data the entry already holds.
  pub fn put_error(&self, key: &CacheKey, error: FetchError) -> CacheEntry {
    let mut inner = self.lock();
    let slot = self.slot_mut(&mut inner, key);
    slot.tx.send_modify(|entry| {
      entry.status = EntryStatus::Error;
      entry.error = Some(error);
      entry.is_fetching = false;
      entry.version += 1;
    });
    slot.entry()
  }

  /// Write a previously captured entry back verbatim.
  ///
  /// Data, status, timestamp and error come from `prior`; the current
  /// subscriber count is kept. Passing `None` clears the entry back to empty.
  pub fn restore(&self, key: &CacheKey, prior: Option<&CacheEntry>) -> CacheEntry {
    let mut inner = self.lock();
    let slot = self.slot_mut(&mut inner, key);
    slot.tx.send_modify(|entry| {
      match prior {
        Some(prior) => {
          entry.data = prior.data.clone();
          entry.status = prior.status;
          entry.fetched_at = prior.fetched_at;
          entry.error = prior.error.clone();
        }
        None => {
          entry.data = None;
          entry.status = EntryStatus::Empty;
          entry.fetched_at = None;
          entry.error = None;
        }
      }
      entry.version += 1;
    });
    slot.entry()
  }

  /// Like [`restore`](Self::restore), but only while the entry is still at
  /// `version`. Returns `None` when another writer got there first or the
  /// entry is gone.
  pub(crate) fn restore_if_version(
    &self,
    key: &CacheKey,
    prior: &CacheEntry,
    version: u64,
  ) -> Option<CacheEntry> {
    let inner = self.lock();
    let slot = inner.slots.get(key)?;
    let restored = slot.tx.send_if_modified(|entry| {
      if entry.version != version {
        return false;
      }
      entry.data = prior.data.clone();
      entry.status = prior.status;
      entry.fetched_at = prior.fetched_at;
      entry.error = prior.error.clone();
      entry.version += 1;
      true
    });
    restored.then(|| slot.entry())
  }

  /// Mark a fetch as started: empty entries become `loading`.
  ///
  /// Returns the entry's invalidation count, to hand back to
  /// [`put_fetched`](Self::put_fetched).
  pub(crate) fn begin_fetch(&self, key: &CacheKey) -> u64 {
    let mut inner = self.lock();
    let slot = self.slot_mut(&mut inner, key);
    slot.tx.send_modify(|entry| {
      if entry.status == EntryStatus::Empty {
        entry.status = EntryStatus::Loading;
      }
      entry.is_fetching = true;
    });
    slot.invalidations
  }

  /// Clear the in-flight flag when a fetch ends without writing.
  pub(crate) fn end_fetch(&self, key: &CacheKey) {
    let inner = self.lock();
    if let Some(slot) = inner.slots.get(key) {
      slot.tx.send_if_modified(|entry| {
        let was_fetching = entry.is_fetching;
        entry.is_fetching = false;
        if entry.status == EntryStatus::Loading {
          entry.status = EntryStatus::Empty;
        }
        was_fetching
      });
    }
  }

  /// Mark every entry matching `pattern` stale, keeping its data.
  ///
  /// Returns the matched keys together with their subscriber counts.
  pub fn mark_stale(&self, pattern: &KeyPattern) -> Vec<(CacheKey, usize)> {
    let mut inner = self.lock();
    let mut matched = Vec::new();
    for (key, slot) in inner.slots.iter_mut().filter(|(key, _)| pattern.matches(key)) {
      slot.invalidations += 1;
      slot.tx.send_if_modified(|entry| match entry.status {
        EntryStatus::Fresh | EntryStatus::Error if entry.data.is_some() => {
          entry.status = EntryStatus::Stale;
          true
        }
        _ => false,
      });
      matched.push((key.clone(), slot.tx.borrow().subscriber_count));
    }
    debug!(pattern = %pattern, matched = matched.len(), "Marked entries stale");
    matched
  }

  /// Keys currently in the table that match `pattern`.
  pub fn keys_matching(&self, pattern: &KeyPattern) -> Vec<CacheKey> {
    let inner = self.lock();
    let mut keys: Vec<CacheKey> = inner
      .slots
      .keys()
      .filter(|key| pattern.matches(key))
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  /// Keys with at least one subscriber.
  pub fn subscribed_keys(&self) -> Vec<CacheKey> {
    let inner = self.lock();
    inner
      .slots
      .iter()
      .filter(|(_, slot)| slot.tx.borrow().subscriber_count > 0)
      .map(|(key, _)| key.clone())
      .collect()
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.lock().slots.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.lock().slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Attach a subscriber to `key`, creating an empty entry if needed.
  ///
  /// A pending eviction for the key is cancelled.
  pub fn subscribe(&self, key: &CacheKey) -> Subscription {
    let mut inner = self.lock();
    let slot = self.slot_mut(&mut inner, key);
    slot.cancel_eviction();
    slot.idle_since = None;
    slot.generation += 1;
    slot.tx.send_if_modified(|entry| {
      entry.subscriber_count += 1;
      false
    });
    let rx = slot.tx.subscribe();
    debug!(key = %key, subscribers = rx.borrow().subscriber_count, "Subscribed");

    Subscription {
      key: key.clone(),
      rx,
      store: Arc::downgrade(&self.inner),
      eviction: EvictionSettings {
        grace: self.grace_for(key),
      },
      active: true,
    }
  }

  /// Detach a subscriber. Equivalent to dropping the handle.
  pub fn unsubscribe(&self, subscription: Subscription) {
    drop(subscription);
  }

  /// Remove every unsubscribed entry whose grace period has elapsed.
  ///
  /// Returns the number of evicted entries.
  pub fn sweep(&self) -> usize {
    let now = Instant::now();
    let mut inner = self.lock();
    let expired: Vec<CacheKey> = inner
      .slots
      .iter()
      .filter(|(key, slot)| {
        slot.tx.borrow().subscriber_count == 0
          && slot
            .idle_since
            .map(|since| now.saturating_duration_since(since) >= self.grace_for(key))
            .unwrap_or(false)
      })
      .map(|(key, _)| key.clone())
      .collect();

    for key in &expired {
      if let Some(mut slot) = inner.slots.remove(key) {
        slot.cancel_eviction();
      }
    }
    if !expired.is_empty() {
      debug!(evicted = expired.len(), "Swept idle cache entries");
    }
    expired.len()
  }

  /// Copy of every entry, for persistence and diagnostics.
  pub fn snapshot(&self) -> Vec<CacheEntry> {
    let inner = self.lock();
    let mut entries: Vec<CacheEntry> = inner.slots.values().map(Slot::entry).collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
  }

  /// Seed an entry from a previous session as `stale`.
  ///
  /// Existing entries are left alone.
  pub fn hydrate(&self, key: &CacheKey, data: Value) -> bool {
    let mut inner = self.lock();
    if inner.slots.contains_key(key) {
      return false;
    }
    let slot = self.slot_mut(&mut inner, key);
    slot.tx.send_modify(|entry| {
      entry.data = Some(data);
      entry.status = EntryStatus::Stale;
      entry.version += 1;
    });
    true
  }
}

#[derive(Debug, Clone, Copy)]
struct EvictionSettings {
  grace: Duration,
}

/// Handle for one subscriber of a key.
///
/// Dropping the handle unsubscribes. When the last subscriber leaves, an
/// eviction timer starts; subscribing again before it fires cancels it.
pub struct Subscription {
  key: CacheKey,
  rx: watch::Receiver<CacheEntry>,
  store: Weak<Mutex<StoreInner>>,
  eviction: EvictionSettings,
  active: bool,
}

impl Subscription {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Latest entry value published for this key.
  pub fn current(&self) -> CacheEntry {
    self.rx.borrow().clone()
  }

  /// Whether a write happened since the last `current_and_mark_seen`.
  pub fn has_changed(&self) -> bool {
    self.rx.has_changed().unwrap_or(false)
  }

  /// Latest value, marking it as seen.
  pub fn current_and_mark_seen(&mut self) -> CacheEntry {
    self.rx.borrow_and_update().clone()
  }

  /// Wait for the next write to this key.
  ///
  /// Returns `false` if the entry was evicted.
  pub async fn changed(&mut self) -> bool {
    self.rx.changed().await.is_ok()
  }

  fn release(&mut self) {
    if !self.active {
      return;
    }
    self.active = false;

    let Some(inner) = self.store.upgrade() else {
      return;
    };
    let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(slot) = guard.slots.get_mut(&self.key) else {
      return;
    };

    let mut remaining = 0;
    slot.tx.send_if_modified(|entry| {
      entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
      remaining = entry.subscriber_count;
      false
    });
    debug!(key = %self.key, subscribers = remaining, "Unsubscribed");
    if remaining > 0 {
      return;
    }

    slot.idle_since = Some(Instant::now());
    let generation = slot.generation;
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
      let weak = Weak::clone(&self.store);
      let key = self.key.clone();
      let grace = self.eviction.grace;
      let task = runtime.spawn(async move {
        tokio::time::sleep(grace).await;
        evict_if_idle(&weak, &key, generation);
      });
      slot.eviction = Some(task.abort_handle());
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.release();
  }
}

fn evict_if_idle(store: &Weak<Mutex<StoreInner>>, key: &CacheKey, generation: u64) {
  let Some(inner) = store.upgrade() else {
    return;
  };
  let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
  let idle = guard
    .slots
    .get(key)
    .map(|slot| slot.generation == generation && slot.tx.borrow().subscriber_count == 0)
    .unwrap_or(false);
  if idle {
    guard.slots.remove(key);
    debug!(key = %key, "Evicted cache entry");
  }
}
