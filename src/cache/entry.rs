//! Cache entries and their fetch status.

use serde_json::Value;
use tokio::time::Instant;

use super::key::CacheKey;
use super::policy::{StalenessPolicy, Tier};
use crate::api::FetchError;

/// Fetch status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  /// Created by a subscription, nothing fetched yet
  Empty,
  /// First fetch in flight, no data yet
  Loading,
  Fresh,
  /// Data is displayable but must be revalidated
  Stale,
  /// Last fetch failed; `data` may still hold the last good value
  Error,
}

impl EntryStatus {
  pub fn name(self) -> &'static str {
    match self {
      EntryStatus::Empty => "empty",
      EntryStatus::Loading => "loading",
      EntryStatus::Fresh => "fresh",
      EntryStatus::Stale => "stale",
      EntryStatus::Error => "error",
    }
  }
}

/// Last-known state of one key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: CacheKey,
  /// Tier bound when the entry was created; never changes afterwards
  pub tier: Tier,
  pub data: Option<Value>,
  pub status: EntryStatus,
  pub fetched_at: Option<Instant>,
  pub error: Option<FetchError>,
  pub subscriber_count: usize,
  /// True while a fetch for this key is in flight
  pub is_fetching: bool,
  /// Bumped on every write, used to detect interleaved writers
  pub version: u64,
}

impl CacheEntry {
  pub(crate) fn empty(key: CacheKey, tier: Tier) -> Self {
    Self {
      key,
      tier,
      data: None,
      status: EntryStatus::Empty,
      fetched_at: None,
      error: None,
      subscriber_count: 0,
      is_fetching: false,
      version: 0,
    }
  }

  /// Age of the data relative to `now`, if it was ever fetched.
  pub fn age(&self, now: Instant) -> Option<std::time::Duration> {
    self.fetched_at.map(|t| now.saturating_duration_since(t))
  }

  /// Whether the entry can be served without refetching.
  pub fn is_fresh(&self, policy: &StalenessPolicy, now: Instant) -> bool {
    self.status == EntryStatus::Fresh
      && self
        .age(now)
        .map(|age| age < policy.max_age)
        .unwrap_or(false)
  }

  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }

  pub fn is_loading(&self) -> bool {
    matches!(self.status, EntryStatus::Empty | EntryStatus::Loading) && self.is_fetching
  }

  pub fn is_error(&self) -> bool {
    self.status == EntryStatus::Error
  }
}
