//! Optimistic mutation coordinator.
//!
//! Each mutation call walks one explicit state machine:
//!
//! ```text
//! idle -> optimistic -> committed   -> settled
//!                    \-> rolled-back -> settled
//! ```
//!
//! Entering `optimistic` snapshots every entry the patches touch and writes
//! the patched values. Settlement either drops the snapshot (committed) or
//! writes it back (rolled back), and in both cases marks the descriptor's
//! key patterns stale so subscribed keys refetch.

mod invalidation;

pub use invalidation::MutationType;

use serde_json::Value;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, error};

use crate::api::FetchError;
use crate::cache::{CacheEntry, CacheKey, EntryStatus, KeyPattern};
use crate::query::QueryExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
  Idle,
  Optimistic,
  Committed,
  RolledBack,
  Settled,
}

/// What a call site hands the coordinator for one mutation.
#[derive(Debug, Clone)]
pub struct MutationDescriptor {
  pub mutation_type: MutationType,
  pub payload: Value,
  pub affected_patterns: Vec<KeyPattern>,
}

impl MutationDescriptor {
  /// Descriptor whose patterns come from the invalidation graph.
  pub fn new(mutation_type: MutationType, payload: Value) -> Self {
    let affected_patterns = mutation_type.affected_patterns();
    Self {
      mutation_type,
      payload,
      affected_patterns,
    }
  }

  pub fn with_patterns(mut self, patterns: Vec<KeyPattern>) -> Self {
    self.affected_patterns = patterns;
    self
  }
}

type PatchFn = Box<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Speculative rewrite of every cached entry matching `pattern`.
///
/// The function returns `None` to leave an entry untouched.
pub struct Patch {
  pattern: KeyPattern,
  apply: PatchFn,
}

impl Patch {
  pub fn new<F>(pattern: impl Into<KeyPattern>, apply: F) -> Self
  where
    F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
  {
    Self {
      pattern: pattern.into(),
      apply: Box::new(apply),
    }
  }

  /// Patch exactly one key.
  pub fn exact<F>(key: CacheKey, apply: F) -> Self
  where
    F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
  {
    Self::new(KeyPattern::Exact(key), apply)
  }
}

impl std::fmt::Debug for Patch {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Patch")
      .field("pattern", &self.pattern)
      .finish_non_exhaustive()
  }
}

struct SnapshotEntry {
  key: CacheKey,
  prior: CacheEntry,
  /// Version of the optimistic write; rollback only applies on top of it
  written: u64,
}

/// Pre-mutation state of every entry a mutation patched.
///
/// Owned by exactly one in-flight mutation.
#[derive(Default)]
pub struct OptimisticSnapshot {
  entries: Vec<SnapshotEntry>,
}

impl OptimisticSnapshot {
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
    self.entries.iter().map(|e| &e.key)
  }

  /// Entry as it was before this mutation first touched `key`.
  pub fn prior(&self, key: &CacheKey) -> Option<&CacheEntry> {
    self.entries.iter().find(|e| &e.key == key).map(|e| &e.prior)
  }

  fn record(&mut self, key: &CacheKey, prior: CacheEntry, written: u64) {
    match self.entries.iter_mut().find(|e| &e.key == key) {
      Some(existing) => existing.written = written,
      None => self.entries.push(SnapshotEntry {
        key: key.clone(),
        prior,
        written,
      }),
    }
  }
}

/// Failure surfaced to the caller of a mutation.
#[derive(Debug, Clone, Error)]
#[error("{mutation} failed: {source}")]
pub struct MutationError {
  pub mutation: &'static str,
  /// Optimistic entries written back to their pre-mutation state
  pub restored: usize,
  #[source]
  pub source: FetchError,
}

impl MutationError {
  /// Server-provided reason, for user-facing notifications.
  pub fn reason(&self) -> String {
    match &self.source {
      FetchError::Validation { reason, .. } => reason.clone(),
      other => other.to_string(),
    }
  }
}

/// Optimistic Mutation Coordinator. Cheap to clone.
#[derive(Clone)]
pub struct MutationCoordinator {
  queries: QueryExecutor,
}

impl MutationCoordinator {
  pub fn new(queries: QueryExecutor) -> Self {
    Self { queries }
  }

  /// Snapshot and patch the affected entries: `idle -> optimistic`.
  pub fn begin(&self, descriptor: MutationDescriptor, patches: Vec<Patch>) -> OptimisticMutation {
    let store = self.queries.store();
    let mut snapshot = OptimisticSnapshot::default();

    for patch in &patches {
      for key in store.keys_matching(&patch.pattern) {
        let Some(current) = store.get(&key) else {
          continue;
        };
        let Some(next) = current.data.as_ref().and_then(|data| (patch.apply)(data)) else {
          continue;
        };
        let status = match current.status {
          EntryStatus::Fresh => EntryStatus::Fresh,
          _ => EntryStatus::Stale,
        };
        let written = store.put(&key, next, status);
        let prior = snapshot.prior(&key).cloned().unwrap_or(current);
        snapshot.record(&key, prior, written.version);
      }
    }

    debug!(
      mutation = descriptor.mutation_type.name(),
      patched = snapshot.len(),
      "Mutation optimistic"
    );
    OptimisticMutation {
      descriptor,
      snapshot,
      phase: MutationPhase::Optimistic,
      queries: self.queries.clone(),
    }
  }

  /// Run a whole mutation: patch, await `request`, settle.
  pub async fn run<F>(
    &self,
    descriptor: MutationDescriptor,
    patches: Vec<Patch>,
    request: F,
  ) -> Result<Value, MutationError>
  where
    F: Future<Output = Result<Value, FetchError>>,
  {
    let mutation = self.begin(descriptor, patches);
    let outcome = request.await;
    mutation.settle(outcome)
  }
}

/// One in-flight mutation. Consumed by [`settle`](Self::settle).
pub struct OptimisticMutation {
  descriptor: MutationDescriptor,
  snapshot: OptimisticSnapshot,
  phase: MutationPhase,
  queries: QueryExecutor,
}

impl OptimisticMutation {
  pub fn phase(&self) -> MutationPhase {
    self.phase
  }

  pub fn descriptor(&self) -> &MutationDescriptor {
    &self.descriptor
  }

  pub fn snapshot(&self) -> &OptimisticSnapshot {
    &self.snapshot
  }

  /// Reconcile with the server outcome and invalidate: `-> settled`.
  pub fn settle(mut self, outcome: Result<Value, FetchError>) -> Result<Value, MutationError> {
    let name = self.descriptor.mutation_type.name();

    let result = match outcome {
      Ok(value) => {
        self.transition(MutationPhase::Committed);
        self.snapshot = OptimisticSnapshot::default();
        Ok(value)
      }
      Err(source) => {
        let restored = self.rollback();
        self.transition(MutationPhase::RolledBack);
        error!(mutation = name, restored, error = %source, "Mutation failed");
        Err(MutationError {
          mutation: name,
          restored,
          source,
        })
      }
    };

    self.queries.invalidate(&self.descriptor.affected_patterns);
    self.transition(MutationPhase::Settled);
    result
  }

  /// Write every snapshot entry back, skipping keys another writer changed
  /// after our optimistic write.
  fn rollback(&mut self) -> usize {
    let store = self.queries.store();
    let mut restored = 0;
    for entry in self.snapshot.entries.drain(..) {
      match store.restore_if_version(&entry.key, &entry.prior, entry.written) {
        Some(_) => restored += 1,
        None => debug!(key = %entry.key, "Skipping rollback, entry was overwritten"),
      }
    }
    restored
  }

  fn transition(&mut self, next: MutationPhase) {
    debug!(
      mutation = self.descriptor.mutation_type.name(),
      from = ?self.phase,
      to = ?next,
      "Mutation transition"
    );
    self.phase = next;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::executor::testing::ScriptedExecutor;
  use crate::api::{Operation, RequestExecutor};
  use crate::cache::{CacheStore, StalenessRegistry};
  use crate::cache_key;
  use crate::query::{fetch_fn, QueryOptions};
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  fn coordinator() -> MutationCoordinator {
    MutationCoordinator::new(QueryExecutor::new(CacheStore::new(StalenessRegistry::default())))
  }

  fn add_likes(delta: i64) -> impl Fn(&Value) -> Option<Value> + Send + Sync + 'static {
    move |post| {
      let mut post = post.clone();
      let likes = post["likesCount"].as_i64()? + delta;
      post["likesCount"] = json!(likes);
      Some(post)
    }
  }

  fn like_descriptor(post_id: &str) -> MutationDescriptor {
    MutationDescriptor::new(
      MutationType::ToggleLike {
        post_id: post_id.into(),
      },
      json!({ "postId": post_id }),
    )
  }

  #[tokio::test]
  async fn test_rollback_restores_exact_prior_state() {
    let coordinator = coordinator();
    let store = coordinator.queries.store().clone();
    let key = cache_key!["social", "post", "7"];
    let _a = store.subscribe(&key);
    let _b = store.subscribe(&key);
    let before = store.put(&key, json!({"likesCount": 3}), EntryStatus::Fresh);

    let mutation = coordinator.begin(
      like_descriptor("7").with_patterns(Vec::new()),
      vec![Patch::exact(key.clone(), add_likes(1))],
    );
    assert_eq!(mutation.phase(), MutationPhase::Optimistic);
    assert_eq!(mutation.snapshot().len(), 1);
    assert_eq!(store.get(&key).unwrap().data, Some(json!({"likesCount": 4})));

    let err = mutation
      .settle(Err(FetchError::from_status(400, "already liked")))
      .unwrap_err();
    assert_eq!(err.restored, 1);
    assert_eq!(err.reason(), "already liked");

    let after = store.get(&key).unwrap();
    assert_eq!(after.data, before.data);
    assert_eq!(after.status, before.status);
    assert_eq!(after.fetched_at, before.fetched_at);
    assert_eq!(after.subscriber_count, 2);
  }

  #[tokio::test]
  async fn test_commit_keeps_optimistic_value_and_invalidates() {
    let coordinator = coordinator();
    let store = coordinator.queries.store().clone();
    let post = cache_key!["social", "post", "123"];
    let pages = [cache_key!["social", "posts", 0, 20], cache_key!["social", "posts", 1, 20]];
    let unrelated = cache_key!["social", "post", "999"];
    store.put(&post, json!({"likesCount": 1}), EntryStatus::Fresh);
    for key in pages.iter().chain([&unrelated]) {
      store.put(key, json!({"posts": []}), EntryStatus::Fresh);
    }

    let result = coordinator
      .run(
        like_descriptor("123"),
        vec![Patch::exact(post.clone(), add_likes(1))],
        async { Ok(json!({"liked": true})) },
      )
      .await;
    assert_eq!(result.unwrap(), json!({"liked": true}));

    let entry = store.get(&post).unwrap();
    assert_eq!(entry.status, EntryStatus::Stale);
    assert_eq!(entry.data, Some(json!({"likesCount": 2})));
    for key in &pages {
      assert_eq!(store.get(key).unwrap().status, EntryStatus::Stale);
    }
    assert_eq!(store.get(&unrelated).unwrap().status, EntryStatus::Fresh);
  }

  #[tokio::test]
  async fn test_failed_mutation_still_invalidates() {
    let coordinator = coordinator();
    let store = coordinator.queries.store().clone();
    let page = cache_key!["social", "posts", 0, 20];
    store.put(&page, json!({"posts": []}), EntryStatus::Fresh);

    let result = coordinator
      .run(
        MutationDescriptor::new(MutationType::CreatePost, json!({"content": ""})),
        Vec::new(),
        async { Err(FetchError::from_status(400, "content should not be empty")) },
      )
      .await;
    let err = result.unwrap_err();
    assert_eq!(err.restored, 0);
    assert_eq!(err.mutation, "createPost");
    assert_eq!(store.get(&page).unwrap().status, EntryStatus::Stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_settlement_refetches_subscribed_keys() {
    let coordinator = coordinator();
    let queries = coordinator.queries.clone();
    let key = cache_key!["social", "post", "123"];
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let fetch = fetch_fn(move || {
      let calls = counter.clone();
      async move {
        let n = calls.fetch_add(1, Ordering::SeqCst) as i64;
        Ok(json!({"likesCount": 10 + n}))
      }
    });

    let _sub = queries.store().subscribe(&key);
    queries.execute(&key, fetch, QueryOptions::default()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    coordinator
      .run(
        like_descriptor("123"),
        vec![Patch::exact(key.clone(), add_likes(1))],
        async { Ok(Value::Null) },
      )
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let entry = queries.store().get(&key).unwrap();
    assert_eq!(entry.data, Some(json!({"likesCount": 11})));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_during_fetch_refetches_after_it() {
    let coordinator = coordinator();
    let queries = coordinator.queries.clone();
    let api = Arc::new(ScriptedExecutor::new());
    let key = cache_key!["social", "post", "p1"];
    let fetch = {
      let api = api.clone();
      fetch_fn(move || {
        let api = api.clone();
        async move { api.execute(&Operation::SocialGetPost { id: "p1".into() }).await }
      })
    };

    let _sub = queries.store().subscribe(&key);
    api.push("social.getPost", Ok(json!({"liked": false, "likesCount": 3})));
    queries.execute(&key, fetch, QueryOptions::default()).await;

    // A refetch is in flight before the mutation starts
    let respond = api.gate("social.getPost");
    let pending = {
      let queries = queries.clone();
      let key = key.clone();
      tokio::spawn(async move { queries.refetch(&key).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(queries.is_fetching(&key));

    let toggle = |post: &Value| {
      let mut post = post.clone();
      let likes = post["likesCount"].as_i64()? + 1;
      post["liked"] = json!(true);
      post["likesCount"] = json!(likes);
      Some(post)
    };
    coordinator
      .run(
        like_descriptor("p1"),
        vec![Patch::exact(key.clone(), toggle)],
        async { Ok(json!({"liked": true})) },
      )
      .await
      .unwrap();

    // The server now holds the mutated post; the old fetch answers with
    // what it read before
    api.respond("social.getPost", Ok(json!({"liked": true, "likesCount": 4})));
    respond
      .send(Ok(json!({"liked": false, "likesCount": 3})))
      .unwrap();
    let landed = pending.await.unwrap().unwrap();
    assert_eq!(landed.status, EntryStatus::Stale);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(api.calls("social.getPost"), 3);
    let entry = queries.store().get(&key).unwrap();
    assert_eq!(entry.status, EntryStatus::Fresh);
    assert_eq!(entry.data, Some(json!({"liked": true, "likesCount": 4})));
    assert!(!queries.is_fetching(&key));
  }

  #[tokio::test]
  async fn test_concurrent_mutations_last_write_wins() {
    let coordinator = coordinator();
    let store = coordinator.queries.store().clone();
    let key = cache_key!["social", "post", "p"];
    store.put(&key, json!({"likesCount": 3}), EntryStatus::Fresh);
    let no_invalidation = || like_descriptor("p").with_patterns(Vec::new());

    let first = coordinator.begin(no_invalidation(), vec![Patch::exact(key.clone(), add_likes(1))]);
    let second = coordinator.begin(no_invalidation(), vec![Patch::exact(key.clone(), add_likes(1))]);
    assert_eq!(
      second.snapshot().prior(&key).and_then(|e| e.data.clone()),
      Some(json!({"likesCount": 4}))
    );
    assert_eq!(store.get(&key).unwrap().data, Some(json!({"likesCount": 5})));

    // The first rollback must not undo the second mutation's later write
    let err = first.settle(Err(FetchError::network("timeout"))).unwrap_err();
    assert_eq!(err.restored, 0);
    assert_eq!(store.get(&key).unwrap().data, Some(json!({"likesCount": 5})));

    second.settle(Ok(Value::Null)).unwrap();
    assert_eq!(store.get(&key).unwrap().data, Some(json!({"likesCount": 5})));
  }

  #[tokio::test]
  async fn test_second_rollback_restores_first_write() {
    let coordinator = coordinator();
    let store = coordinator.queries.store().clone();
    let key = cache_key!["social", "post", "p"];
    store.put(&key, json!({"likesCount": 3}), EntryStatus::Fresh);
    let no_invalidation = || like_descriptor("p").with_patterns(Vec::new());

    let first = coordinator.begin(no_invalidation(), vec![Patch::exact(key.clone(), add_likes(1))]);
    let second = coordinator.begin(no_invalidation(), vec![Patch::exact(key.clone(), add_likes(1))]);

    second.settle(Err(FetchError::network("timeout"))).unwrap_err();
    assert_eq!(store.get(&key).unwrap().data, Some(json!({"likesCount": 4})));
    first.settle(Ok(Value::Null)).unwrap();
    assert_eq!(store.get(&key).unwrap().data, Some(json!({"likesCount": 4})));
  }

  #[tokio::test]
  async fn test_patch_skips_entries_without_data() {
    let coordinator = coordinator();
    let store = coordinator.queries.store().clone();
    let key = cache_key!["social", "post", "new"];
    let _sub = store.subscribe(&key);

    let mutation = coordinator.begin(
      like_descriptor("new"),
      vec![Patch::exact(key.clone(), add_likes(1))],
    );
    assert!(mutation.snapshot().is_empty());
    assert_eq!(store.get(&key).unwrap().status, EntryStatus::Empty);
  }
}
