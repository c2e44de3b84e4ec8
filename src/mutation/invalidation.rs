//! Invalidation graph: which cache families a mutation makes stale.

use std::fmt;

use crate::api::operation::{items_family, posts_family};
use crate::cache::{CacheKey, KeyPattern};
use crate::cache_key;

/// Every mutation the data-access layer knows how to invalidate for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationType {
  ToggleLike { post_id: String },
  CreatePost,
  CreateComment { post_id: String },
  DeleteComment { post_id: String, comment_id: String },
  AwardMerit { user_id: String },
  CreateItem,
  UpdateItem { item_id: String },
  DeleteItem { item_id: String },
}

impl MutationType {
  pub fn name(&self) -> &'static str {
    match self {
      MutationType::ToggleLike { .. } => "toggleLike",
      MutationType::CreatePost => "createPost",
      MutationType::CreateComment { .. } => "createComment",
      MutationType::DeleteComment { .. } => "deleteComment",
      MutationType::AwardMerit { .. } => "awardMerit",
      MutationType::CreateItem => "createItem",
      MutationType::UpdateItem { .. } => "updateItem",
      MutationType::DeleteItem { .. } => "deleteItem",
    }
  }

  /// Key families to mark stale once the mutation settles.
  pub fn affected_patterns(&self) -> Vec<KeyPattern> {
    let keys: Vec<CacheKey> = match self {
      MutationType::ToggleLike { post_id } => vec![post_key(post_id), posts_family()],
      MutationType::CreatePost => vec![posts_family()],
      MutationType::CreateComment { post_id } | MutationType::DeleteComment { post_id, .. } => vec![
        post_key(post_id).child("comments"),
        post_key(post_id),
        posts_family(),
      ],
      MutationType::AwardMerit { user_id } => vec![
        cache_key!["merits", "user", user_id],
        cache_key!["merits", "leaderboard"],
        cache_key!["wallet", user_id],
      ],
      MutationType::CreateItem => vec![items_family()],
      MutationType::UpdateItem { item_id } | MutationType::DeleteItem { item_id } => {
        vec![items_family(), cache_key!["marketplace", "item", item_id]]
      }
    };
    keys.into_iter().map(KeyPattern::Prefix).collect()
  }
}

impl fmt::Display for MutationType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

fn post_key(post_id: &str) -> CacheKey {
  cache_key!["social", "post", post_id]
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_toggle_like_hits_post_and_pages() {
    let patterns = MutationType::ToggleLike {
      post_id: "123".into(),
    }
    .affected_patterns();
    let matches = |key: CacheKey| patterns.iter().any(|p| p.matches(&key));

    assert!(matches(cache_key!["social", "post", "123"]));
    assert!(matches(cache_key!["social", "posts", 0, 20]));
    assert!(matches(cache_key!["social", "posts", 3, 20]));
    assert!(!matches(cache_key!["social", "post", "124"]));
    assert!(!matches(cache_key!["wallet", "u1"]));
  }

  #[test]
  fn test_award_merit_hits_wallet() {
    let patterns = MutationType::AwardMerit {
      user_id: "u1".into(),
    }
    .affected_patterns();
    assert_eq!(patterns.len(), 3);
    assert!(patterns.iter().any(|p| p.matches(&cache_key!["wallet", "u1"])));
    assert!(!patterns.iter().any(|p| p.matches(&cache_key!["wallet", "u2"])));
  }

  #[test]
  fn test_item_mutations_hit_every_list() {
    let filtered = cache_key!["marketplace", "items", "9f86d081884c7d65"];
    for mutation in [
      MutationType::CreateItem,
      MutationType::UpdateItem { item_id: "i1".into() },
      MutationType::DeleteItem { item_id: "i1".into() },
    ] {
      assert!(
        mutation.affected_patterns().iter().any(|p| p.matches(&filtered)),
        "{} should invalidate item lists",
        mutation
      );
    }
  }
}
