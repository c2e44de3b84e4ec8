//! In-memory cache table with tiered staleness.
//!
//! This module provides the storage half of the data-access layer:
//! - Structured keys with prefix patterns for invalidation
//! - A fixed set of staleness tiers bound per resource type
//! - A shared table of entries with watch-based subscriptions and eviction
//! - An optional SQLite snapshot so a new session starts from last-known data

mod entry;
mod key;
mod persist;
mod policy;
mod store;

pub use entry::{CacheEntry, EntryStatus};
pub use key::{CacheKey, KeyPattern, KeySegment};
pub use persist::{PersistedEntry, SqliteSnapshot};
pub use policy::{policy_for, StalenessPolicy, StalenessRegistry, Tier, UnknownTier};
pub use store::{CacheStore, Subscription, DEFAULT_EVICTION_GRACE};
