//! Structured cache keys and the prefix patterns used to invalidate them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// One segment of a cache key: a resource name or a discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
  Num(i64),
  Str(String),
}

impl KeySegment {
  /// Discriminator for an arbitrary filter value.
  ///
  /// The filter is serialized to JSON and hashed so that two structurally
  /// equal filters always produce the same segment.
  pub fn filter_hash<T: Serialize>(filter: &T) -> Self {
    let input = serde_json::to_vec(filter).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&input);
    let digest = hex::encode(hasher.finalize());
    KeySegment::Str(digest[..16].to_string())
  }
}

impl fmt::Display for KeySegment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeySegment::Num(n) => write!(f, "{}", n),
      KeySegment::Str(s) => f.write_str(s),
    }
  }
}

impl From<&str> for KeySegment {
  fn from(value: &str) -> Self {
    KeySegment::Str(value.to_string())
  }
}

impl From<String> for KeySegment {
  fn from(value: String) -> Self {
    KeySegment::Str(value)
  }
}

impl From<&String> for KeySegment {
  fn from(value: &String) -> Self {
    KeySegment::Str(value.clone())
  }
}

impl From<i64> for KeySegment {
  fn from(value: i64) -> Self {
    KeySegment::Num(value)
  }
}

impl From<i32> for KeySegment {
  fn from(value: i32) -> Self {
    KeySegment::Num(i64::from(value))
  }
}

impl From<u32> for KeySegment {
  fn from(value: u32) -> Self {
    KeySegment::Num(i64::from(value))
  }
}

impl From<usize> for KeySegment {
  fn from(value: usize) -> Self {
    match i64::try_from(value) {
      Ok(n) => KeySegment::Num(n),
      Err(_) => KeySegment::Str(value.to_string()),
    }
  }
}

/// Ordered tuple of segments identifying one cache entry.
///
/// The first segment names the resource; later segments discriminate
/// (entity id, page number, filter hash). Keys compare structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(Vec<KeySegment>);

impl CacheKey {
  pub fn new(segments: Vec<KeySegment>) -> Self {
    Self(segments)
  }

  pub fn segments(&self) -> &[KeySegment] {
    &self.0
  }

  /// Resource name: the first segment, used for tier binding.
  pub fn resource(&self) -> Option<&str> {
    match self.0.first() {
      Some(KeySegment::Str(s)) => Some(s),
      _ => None,
    }
  }

  pub fn starts_with(&self, prefix: &CacheKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Returns a new key with `segment` appended.
  pub fn child(&self, segment: impl Into<KeySegment>) -> Self {
    let mut segments = self.0.clone();
    segments.push(segment.into());
    Self(segments)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str(":")?;
      }
      write!(f, "{}", segment)?;
    }
    Ok(())
  }
}

/// Build a [`CacheKey`] from a list of segment-convertible values.
///
/// ```ignore
/// let key = cache_key!["social", "post", post_id];
/// ```
#[macro_export]
macro_rules! cache_key {
  ($($segment:expr),* $(,)?) => {
    $crate::cache::CacheKey::new(vec![$($crate::cache::KeySegment::from($segment)),*])
  };
}

/// A key pattern naming a family of keys for invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
  /// Every key that starts with the given segments (including the key itself)
  Prefix(CacheKey),
  /// Exactly one key
  Exact(CacheKey),
}

impl KeyPattern {
  pub fn matches(&self, key: &CacheKey) -> bool {
    match self {
      KeyPattern::Prefix(prefix) => key.starts_with(prefix),
      KeyPattern::Exact(exact) => key == exact,
    }
  }
}

impl From<CacheKey> for KeyPattern {
  fn from(key: CacheKey) -> Self {
    KeyPattern::Prefix(key)
  }
}

impl fmt::Display for KeyPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPattern::Prefix(key) => write!(f, "{}:*", key),
      KeyPattern::Exact(key) => write!(f, "{}", key),
    }
  }
}
