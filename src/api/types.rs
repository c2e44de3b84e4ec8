//! Resource payloads as the presentation layer reads them.
//!
//! Only the fields the data-access layer itself touches (ids, counters,
//! flags) are modelled strictly; everything else rides along in `extra`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
  pub status: String,
  #[serde(default)]
  pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
  pub id: String,
  #[serde(default)]
  pub full_name: Option<String>,
  #[serde(default)]
  pub avatar_url: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
  pub user_id: String,
  pub balance: f64,
  pub currency: String,
  #[serde(default)]
  pub ucoins: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub amount: f64,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Merit {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub amount: i64,
  #[serde(default)]
  pub description: Option<String>,
}

/// Filters for the marketplace listing; hashed into the cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFilters {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub search: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_price: Option<u32>,
}

impl ItemFilters {
  /// `?category=..&search=..` suffix, empty when no filter is set.
  pub fn query_string(&self) -> String {
    let mut url = url::Url::parse("http://placeholder/").ok();
    let Some(url) = url.as_mut() else {
      return String::new();
    };
    {
      let mut pairs = url.query_pairs_mut();
      if let Some(category) = &self.category {
        pairs.append_pair("category", category);
      }
      if let Some(search) = &self.search {
        pairs.append_pair("search", search);
      }
      if let Some(max_price) = self.max_price {
        pairs.append_pair("maxPrice", &max_price.to_string());
      }
    }
    match url.query() {
      Some(q) if !q.is_empty() => format!("?{}", q),
      _ => String::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceItem {
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub price: f64,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
  pub title: String,
  pub price: f64,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default)]
  pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
  pub id: String,
  #[serde(default)]
  pub content: String,
  #[serde(default)]
  pub likes_count: u64,
  #[serde(default)]
  pub liked: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comments_count: Option<u64>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Post {
  /// Flip the like flag and adjust the counter to match.
  pub fn toggle_like(&mut self) {
    if self.liked {
      self.likes_count = self.likes_count.saturating_sub(1);
    } else {
      self.likes_count += 1;
    }
    self.liked = !self.liked;
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostsPage {
  pub posts: Vec<Post>,
  #[serde(default)]
  pub page: u32,
  #[serde(default)]
  pub total: u64,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
  pub id: String,
  pub post_id: String,
  #[serde(default)]
  pub content: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentsPage {
  pub comments: Vec<Comment>,
  #[serde(default)]
  pub page: u32,
  #[serde(default)]
  pub total: u64,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoItem {
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCategory {
  pub id: String,
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub video_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_post_keeps_unknown_fields() {
    let raw = json!({
      "id": "post-7",
      "content": "hola",
      "likesCount": 3,
      "liked": false,
      "author": {"name": "Ana"}
    });
    let post: Post = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(post.likes_count, 3);
    assert_eq!(post.extra.get("author"), Some(&json!({"name": "Ana"})));

    let back = serde_json::to_value(&post).unwrap();
    assert_eq!(back["author"], raw["author"]);
    assert_eq!(back["likesCount"], json!(3));
  }

  #[test]
  fn test_pages_keep_unknown_fields() {
    let raw = json!({
      "posts": [{"id": "p1", "content": "hola"}],
      "page": 0,
      "total": 1,
      "hasMore": true,
      "limit": 20
    });
    let page: PostsPage = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(page.extra.get("hasMore"), Some(&json!(true)));
    assert_eq!(page.posts[0].comments_count, None);
    let back = serde_json::to_value(&page).unwrap();
    assert_eq!(back["hasMore"], json!(true));
    assert_eq!(back["limit"], json!(20));
    assert!(back["posts"][0].get("commentsCount").is_none());
  }

  #[test]
  fn test_toggle_like() {
    let mut post: Post = serde_json::from_value(json!({"id": "p", "likesCount": 3})).unwrap();
    post.toggle_like();
    assert_eq!((post.likes_count, post.liked), (4, true));
    post.toggle_like();
    assert_eq!((post.likes_count, post.liked), (3, false));
  }

  #[test]
  fn test_filters_query_string() {
    assert_eq!(ItemFilters::default().query_string(), "");
    let filters = ItemFilters {
      category: Some("home & garden".into()),
      max_price: Some(20),
      ..Default::default()
    };
    assert_eq!(filters.query_string(), "?category=home+%26+garden&maxPrice=20");
  }
}
