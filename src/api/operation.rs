//! Logical operations consumed from the remote service.

use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;

use super::types::{ItemFilters, NewItem};
use crate::cache::{CacheKey, KeySegment};
use crate::cache_key;

/// One named resource operation, independent of wire format.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Operation {
  HealthCheck,
  UserGetProfile { id: String },

  WalletGetBalance { id: String },
  WalletGetTransactions { id: String },
  WalletGetMerits { id: String },
  WalletAwardMerit {
    id: String,
    merit_type: String,
    amount: i64,
    description: Option<String>,
  },

  MarketplaceListItems { filters: ItemFilters },
  MarketplaceCreateItem { data: NewItem },
  MarketplaceUpdateItem { id: String, data: Value },
  MarketplaceDeleteItem { id: String },

  SocialListPosts { page: u32, limit: u32 },
  SocialGetPost { id: String },
  SocialCreatePost {
    content: String,
    post_type: Option<String>,
    media: Option<String>,
  },
  SocialToggleLike { post_id: String },
  SocialListComments { post_id: String, page: u32 },
  SocialCreateComment { post_id: String, content: String },
  SocialDeleteComment { comment_id: String },

  VideoListItems,
  VideoListCategories,
  VideoListPlaylists,
}

impl Operation {
  /// Dotted operation name, e.g. `wallet.getBalance`.
  pub fn name(&self) -> &'static str {
    match self {
      Operation::HealthCheck => "health.check",
      Operation::UserGetProfile { .. } => "user.getProfile",
      Operation::WalletGetBalance { .. } => "wallet.getBalance",
      Operation::WalletGetTransactions { .. } => "wallet.getTransactions",
      Operation::WalletGetMerits { .. } => "wallet.getMerits",
      Operation::WalletAwardMerit { .. } => "wallet.awardMerit",
      Operation::MarketplaceListItems { .. } => "marketplace.listItems",
      Operation::MarketplaceCreateItem { .. } => "marketplace.createItem",
      Operation::MarketplaceUpdateItem { .. } => "marketplace.updateItem",
      Operation::MarketplaceDeleteItem { .. } => "marketplace.deleteItem",
      Operation::SocialListPosts { .. } => "social.listPosts",
      Operation::SocialGetPost { .. } => "social.getPost",
      Operation::SocialCreatePost { .. } => "social.createPost",
      Operation::SocialToggleLike { .. } => "social.toggleLike",
      Operation::SocialListComments { .. } => "social.listComments",
      Operation::SocialCreateComment { .. } => "social.createComment",
      Operation::SocialDeleteComment { .. } => "social.deleteComment",
      Operation::VideoListItems => "video.listItems",
      Operation::VideoListCategories => "video.listCategories",
      Operation::VideoListPlaylists => "video.listPlaylists",
    }
  }

  /// Whether the operation changes server state.
  pub fn is_mutation(&self) -> bool {
    self.cache_key().is_none()
  }

  /// Cache key for read operations; `None` for mutations.
  pub fn cache_key(&self) -> Option<CacheKey> {
    let key = match self {
      Operation::HealthCheck => cache_key!["backend", "health"],
      Operation::UserGetProfile { id } => cache_key!["user", "profile", id],
      Operation::WalletGetBalance { id } => cache_key!["wallet", id],
      Operation::WalletGetTransactions { id } => cache_key!["wallet", "transactions", id],
      Operation::WalletGetMerits { id } => cache_key!["merits", "user", id],
      Operation::MarketplaceListItems { filters } => {
        items_family().child(KeySegment::filter_hash(filters))
      }
      Operation::SocialListPosts { page, limit } => cache_key!["social", "posts", *page, *limit],
      Operation::SocialGetPost { id } => cache_key!["social", "post", id],
      Operation::SocialListComments { post_id, page } => {
        cache_key!["social", "post", post_id, "comments", *page]
      }
      Operation::VideoListItems => cache_key!["video", "items"],
      Operation::VideoListCategories => cache_key!["video", "categories"],
      Operation::VideoListPlaylists => cache_key!["video", "playlists"],
      Operation::WalletAwardMerit { .. }
      | Operation::MarketplaceCreateItem { .. }
      | Operation::MarketplaceUpdateItem { .. }
      | Operation::MarketplaceDeleteItem { .. }
      | Operation::SocialCreatePost { .. }
      | Operation::SocialToggleLike { .. }
      | Operation::SocialCreateComment { .. }
      | Operation::SocialDeleteComment { .. } => return None,
    };
    Some(key)
  }

  /// HTTP method, path and optional JSON body for the REST backend.
  pub fn http_request(&self) -> (HttpMethod, String, Option<Value>) {
    use HttpMethod::*;

    match self {
      Operation::HealthCheck => (Get, "/health".into(), None),
      Operation::UserGetProfile { id } => (Get, format!("/users/{}", id), None),
      Operation::WalletGetBalance { id } => (Get, format!("/wallets/user/{}", id), None),
      Operation::WalletGetTransactions { id } => {
        (Get, format!("/wallets/user/{}/transactions", id), None)
      }
      Operation::WalletGetMerits { id } => (Get, format!("/merits/user/{}", id), None),
      Operation::WalletAwardMerit {
        id,
        merit_type,
        amount,
        description,
      } => (
        Post,
        "/merits/award".into(),
        Some(json!({
          "userId": id,
          "meritType": merit_type,
          "amount": amount,
          "description": description,
        })),
      ),
      Operation::MarketplaceListItems { filters } => {
        (Get, format!("/marketplace/items{}", filters.query_string()), None)
      }
      Operation::MarketplaceCreateItem { data } => (
        Post,
        "/marketplace/items".into(),
        serde_json::to_value(data).ok(),
      ),
      Operation::MarketplaceUpdateItem { id, data } => {
        (Patch, format!("/marketplace/items/{}", id), Some(data.clone()))
      }
      Operation::MarketplaceDeleteItem { id } => {
        (Delete, format!("/marketplace/items/{}", id), None)
      }
      Operation::SocialListPosts { page, limit } => (
        Get,
        format!("/social/publications?page={}&limit={}", page, limit),
        None,
      ),
      Operation::SocialGetPost { id } => (Get, format!("/social/publications/{}", id), None),
      Operation::SocialCreatePost {
        content,
        post_type,
        media,
      } => (
        Post,
        "/social/publications".into(),
        Some(json!({ "content": content, "type": post_type, "media": media })),
      ),
      Operation::SocialToggleLike { post_id } => (
        Post,
        format!("/social/publications/{}/like", post_id),
        None,
      ),
      Operation::SocialListComments { post_id, page } => (
        Get,
        format!("/social/publications/{}/comments?page={}", post_id, page),
        None,
      ),
      Operation::SocialCreateComment { post_id, content } => (
        Post,
        format!("/social/publications/{}/comments", post_id),
        Some(json!({ "content": content })),
      ),
      Operation::SocialDeleteComment { comment_id } => {
        (Delete, format!("/social/comments/{}", comment_id), None)
      }
      Operation::VideoListItems => (Get, "/video-items".into(), None),
      Operation::VideoListCategories => (Get, "/video-items/categories".into(), None),
      Operation::VideoListPlaylists => (Get, "/playlists".into(), None),
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Cache-key family of every marketplace item list.
pub fn items_family() -> CacheKey {
  cache_key!["marketplace", "items"]
}

/// Cache-key family of every paginated post list.
pub fn posts_family() -> CacheKey {
  cache_key!["social", "posts"]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
  Get,
  Post,
  Patch,
  Delete,
}
