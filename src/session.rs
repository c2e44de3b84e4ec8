//! One application session of the data-access layer.
//!
//! The session owns the cache store and every background task that works on
//! it. Construct it once at startup and call [`DataSession::shutdown`] at the
//! end; tests build a fresh session each.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, RequestExecutor};
use crate::cache::{policy_for, CacheStore, SqliteSnapshot, StalenessRegistry, Tier};
use crate::config::Config;
use crate::query::QueryExecutor;

pub struct DataSession {
  client: ApiClient,
  queries: QueryExecutor,
  snapshot: Option<SqliteSnapshot>,
  tasks: Vec<JoinHandle<()>>,
}

impl DataSession {
  /// Build the store, hydrate it from disk when persistence is on, and start
  /// the sweeper and tier revalidators. Must be called inside a runtime.
  pub fn start(config: &Config, executor: Arc<dyn RequestExecutor>) -> Result<Self> {
    let registry = StalenessRegistry::with_overrides(&config.tiers);
    let store = CacheStore::new(registry).with_eviction_grace(config.cache.eviction_grace());
    let queries = QueryExecutor::new(store.clone());
    let client = ApiClient::new(executor, queries.clone());

    let snapshot = if config.cache.persist {
      let path = match &config.cache.path {
        Some(path) => path.clone(),
        None => SqliteSnapshot::default_path()?,
      };
      let snapshot = SqliteSnapshot::open(&path)?;
      let hydrated = Self::hydrate(&store, &snapshot)?;
      info!(path = %path.display(), entries = hydrated, "Hydrated cache from snapshot");
      Some(snapshot)
    } else {
      None
    };

    let mut tasks = vec![Self::spawn_sweeper(store, config.cache.sweep_interval())];
    for tier in Tier::ALL {
      if let Some(interval) = policy_for(tier).revalidate_interval {
        tasks.push(Self::spawn_revalidator(queries.clone(), tier, interval));
      }
    }

    info!(background_tasks = tasks.len(), "Data session started");
    Ok(Self {
      client,
      queries,
      snapshot,
      tasks,
    })
  }

  pub fn client(&self) -> &ApiClient {
    &self.client
  }

  pub fn queries(&self) -> &QueryExecutor {
    &self.queries
  }

  pub fn store(&self) -> &CacheStore {
    self.queries.store()
  }

  fn hydrate(store: &CacheStore, snapshot: &SqliteSnapshot) -> Result<usize> {
    let entries = snapshot.load()?;
    Ok(
      entries
        .into_iter()
        .filter(|entry| store.hydrate(&entry.key, entry.data.clone()))
        .count(),
    )
  }

  /// Periodically evict unsubscribed entries past their grace period.
  pub fn spawn_sweeper(store: CacheStore, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let evicted = store.sweep();
        if evicted > 0 {
          debug!(evicted, "Eviction sweep");
        }
      }
    })
  }

  /// Periodically refetch the subscribed keys of `tier`.
  pub fn spawn_revalidator(queries: QueryExecutor, tier: Tier, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        queries.revalidate_tier(tier);
      }
    })
  }

  /// Stop background work and persist the store if configured.
  ///
  /// Returns the number of entries written to the snapshot.
  pub fn shutdown(self) -> Result<usize> {
    for task in &self.tasks {
      task.abort();
    }

    let written = match &self.snapshot {
      Some(snapshot) => match snapshot.save(&self.store().snapshot()) {
        Ok(written) => written,
        Err(e) => {
          warn!(error = %e, "Failed to persist cache snapshot");
          return Err(e);
        }
      },
      None => 0,
    };
    info!(persisted = written, "Data session stopped");
    Ok(written)
  }
}
