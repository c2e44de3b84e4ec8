//! Resilient client-side data access.
//!
//! Reads go through a shared cache with tiered staleness and degrade to typed
//! fallback data when the backend cannot answer. Mutations patch the cache
//! optimistically, roll back on failure, and invalidate dependent keys once
//! they settle.

pub mod api;
pub mod cache;
pub mod config;
pub mod logging;
pub mod mutation;
pub mod query;
pub mod session;

pub use api::{ApiClient, FetchError, HttpExecutor, Operation, RequestExecutor};
pub use cache::{CacheEntry, CacheKey, CacheStore, EntryStatus, KeyPattern, Tier};
pub use config::Config;
pub use mutation::{MutationCoordinator, MutationDescriptor, MutationError, MutationType, Patch};
pub use query::{QueryExecutor, QueryObserver, QueryOptions, QueryResult};
pub use session::DataSession;
