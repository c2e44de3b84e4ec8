//! Synthetic answers for reads whose endpoint is unavailable.
//!
//! One factory per degradable resource, each producing a value of that
//! resource's schema. A read answered from here is indistinguishable from a
//! real one to the presentation layer.

use serde_json::Map;

use super::types::{
  CommentsPage, HealthStatus, MarketplaceItem, Merit, Playlist, PostsPage, Transaction,
  UserProfile, VideoCategory, VideoItem, WalletBalance,
};

pub fn health() -> HealthStatus {
  HealthStatus {
    status: "degraded".to_string(),
    timestamp: None,
  }
}

pub fn user_profile(user_id: &str) -> UserProfile {
  UserProfile {
    id: user_id.to_string(),
    full_name: None,
    avatar_url: None,
    extra: Map::new(),
  }
}

pub fn wallet_balance(user_id: &str) -> WalletBalance {
  WalletBalance {
    user_id: user_id.to_string(),
    balance: 0.0,
    currency: "LUKAS".to_string(),
    ucoins: 0.0,
  }
}

pub fn wallet_transactions() -> Vec<Transaction> {
  Vec::new()
}

pub fn merits() -> Vec<Merit> {
  Vec::new()
}

pub fn marketplace_items() -> Vec<MarketplaceItem> {
  Vec::new()
}

pub fn posts_page(page: u32) -> PostsPage {
  PostsPage {
    posts: Vec::new(),
    page,
    total: 0,
    extra: Map::new(),
  }
}

pub fn comments_page(page: u32) -> CommentsPage {
  CommentsPage {
    comments: Vec::new(),
    page,
    total: 0,
    extra: Map::new(),
  }
}

pub fn video_items() -> Vec<VideoItem> {
  Vec::new()
}

pub fn video_categories() -> Vec<VideoCategory> {
  Vec::new()
}

pub fn playlists() -> Vec<Playlist> {
  Vec::new()
}
