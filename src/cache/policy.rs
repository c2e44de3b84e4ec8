//! Staleness tiers and the registry binding resources to them.
//!
//! Tiers are a closed set ordered from shortest to longest max-age. Tier
//! selection is static per resource type, so two readers of the same key
//! always agree on freshness.

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::key::CacheKey;

/// Named staleness tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
  RealTime,
  Dynamic,
  Content,
  Standard,
  SemiStatic,
  Static,
}

impl Tier {
  pub const ALL: [Tier; 6] = [
    Tier::RealTime,
    Tier::Dynamic,
    Tier::Content,
    Tier::Standard,
    Tier::SemiStatic,
    Tier::Static,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Tier::RealTime => "real-time",
      Tier::Dynamic => "dynamic",
      Tier::Content => "content",
      Tier::Standard => "standard",
      Tier::SemiStatic => "semi-static",
      Tier::Static => "static",
    }
  }
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Error for a tier name outside the fixed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown staleness tier '{0}'")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
  type Err = UnknownTier;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Tier::ALL
      .into_iter()
      .find(|tier| tier.name() == s)
      .ok_or_else(|| UnknownTier(s.to_string()))
  }
}

impl<'de> Deserialize<'de> for Tier {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let name = String::deserialize(deserializer)?;
    name.parse().map_err(serde::de::Error::custom)
  }
}

/// Freshness rules for one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessPolicy {
  pub tier: Tier,
  /// Results older than this are stale
  pub max_age: Duration,
  /// Subscribed keys are refetched periodically at `revalidate_interval`
  pub background_revalidate: bool,
  pub revalidate_interval: Option<Duration>,
  /// A new subscriber to an errored key triggers a fetch
  pub retry_on_mount: bool,
  /// Attempts after the first for transient failures
  pub max_retries: u32,
  /// Upper bound on how long an unsubscribed entry is kept
  pub gc_time: Duration,
}

const RETRY_BASE: Duration = Duration::from_millis(1000);
const RETRY_CAP: Duration = Duration::from_secs(30);

impl StalenessPolicy {
  /// Backoff before retry number `attempt` (0-based): doubles, capped at 30s.
  pub fn retry_delay(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    RETRY_BASE.saturating_mul(factor).min(RETRY_CAP)
  }
}

/// The fixed tier table.
pub fn policy_for(tier: Tier) -> StalenessPolicy {
  let (max_age, revalidate, retry_on_mount, max_retries, gc_time) = match tier {
    Tier::RealTime => (0, Some(1_000), true, 1, 300_000),
    Tier::Dynamic => (2_000, Some(5_000), true, 2, 300_000),
    Tier::Content => (30_000, None, true, 2, 300_000),
    Tier::Standard => (60_000, None, true, 3, 600_000),
    Tier::SemiStatic => (300_000, None, false, 3, 1_800_000),
    Tier::Static => (3_600_000, None, false, 3, 86_400_000),
  };

  StalenessPolicy {
    tier,
    max_age: Duration::from_millis(max_age),
    background_revalidate: revalidate.is_some(),
    revalidate_interval: revalidate.map(Duration::from_millis),
    retry_on_mount,
    max_retries,
    gc_time: Duration::from_millis(gc_time),
  }
}

/// Resolves the tier of a key from its resource name.
#[derive(Debug, Clone)]
pub struct StalenessRegistry {
  bindings: HashMap<String, Tier>,
  default_tier: Tier,
}

impl Default for StalenessRegistry {
  fn default() -> Self {
    let bindings = [
      ("backend", Tier::SemiStatic),
      ("user", Tier::Standard),
      ("wallet", Tier::RealTime),
      ("merits", Tier::Dynamic),
      ("marketplace", Tier::Content),
      ("social", Tier::Dynamic),
      ("video", Tier::Static),
    ]
    .into_iter()
    .map(|(resource, tier)| (resource.to_string(), tier))
    .collect();

    Self {
      bindings,
      default_tier: Tier::Standard,
    }
  }
}

impl StalenessRegistry {
  /// Registry with the built-in bindings plus `overrides`.
  pub fn with_overrides(overrides: &HashMap<String, Tier>) -> Self {
    let mut registry = Self::default();
    for (resource, tier) in overrides {
      registry.bindings.insert(resource.clone(), *tier);
    }
    registry
  }

  pub fn tier_for(&self, key: &CacheKey) -> Tier {
    key
      .resource()
      .and_then(|resource| self.bindings.get(resource).copied())
      .unwrap_or(self.default_tier)
  }

  pub fn policy_for_key(&self, key: &CacheKey) -> StalenessPolicy {
    policy_for(self.tier_for(key))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache_key;

  #[test]
  fn test_tiers_ordered_by_max_age() {
    let ages: Vec<Duration> = Tier::ALL.iter().map(|t| policy_for(*t).max_age).collect();
    let mut sorted = ages.clone();
    sorted.sort();
    assert_eq!(ages, sorted);
    assert_eq!(policy_for(Tier::RealTime).max_age, Duration::ZERO);
    assert_eq!(policy_for(Tier::Static).max_age, Duration::from_secs(3600));
  }

  #[test]
  fn test_tier_names_round_trip() {
    for tier in Tier::ALL {
      assert_eq!(tier.name().parse::<Tier>(), Ok(tier));
    }
    assert_eq!(
      "eventually".parse::<Tier>(),
      Err(UnknownTier("eventually".to_string()))
    );
  }

  #[test]
  fn test_retry_delay_backs_off_and_caps() {
    let policy = policy_for(Tier::Standard);
    assert_eq!(policy.retry_delay(0), Duration::from_secs(1));
    assert_eq!(policy.retry_delay(1), Duration::from_secs(2));
    assert_eq!(policy.retry_delay(3), Duration::from_secs(8));
    assert_eq!(policy.retry_delay(10), Duration::from_secs(30));
    assert_eq!(policy.retry_delay(40), Duration::from_secs(30));
  }

  #[test]
  fn test_registry_binds_by_resource() {
    let registry = StalenessRegistry::default();
    assert_eq!(registry.tier_for(&cache_key!["wallet", "u1"]), Tier::RealTime);
    assert_eq!(registry.tier_for(&cache_key!["video", "items"]), Tier::Static);
    assert_eq!(registry.tier_for(&cache_key!["unknown"]), Tier::Standard);
  }

  #[test]
  fn test_registry_overrides() {
    let overrides = HashMap::from([("video".to_string(), Tier::Content)]);
    let registry = StalenessRegistry::with_overrides(&overrides);
    assert_eq!(registry.tier_for(&cache_key!["video", "items"]), Tier::Content);
    assert_eq!(registry.tier_for(&cache_key!["wallet", "u1"]), Tier::RealTime);
  }
}
