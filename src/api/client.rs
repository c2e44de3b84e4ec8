//! Typed reads and mutations over the query executor and mutation coordinator.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::executor::RequestExecutor;
use super::fallback;
use super::operation::{items_family, posts_family, Operation};
use super::types::{
  CommentsPage, HealthStatus, ItemFilters, MarketplaceItem, Merit, NewItem, Playlist, Post,
  PostsPage, Transaction, UserProfile, VideoCategory, VideoItem, WalletBalance,
};
use crate::cache::{CacheKey, KeyPattern};
use crate::cache_key;
use crate::mutation::{MutationCoordinator, MutationDescriptor, MutationError, MutationType, Patch};
use crate::query::{fetch_fn, FetchFn, QueryExecutor, QueryObserver, QueryOptions, QueryResult};

/// Entry point the presentation layer talks to.
#[derive(Clone)]
pub struct ApiClient {
  executor: Arc<dyn RequestExecutor>,
  queries: QueryExecutor,
  mutations: MutationCoordinator,
}

impl ApiClient {
  pub fn new(executor: Arc<dyn RequestExecutor>, queries: QueryExecutor) -> Self {
    let mutations = MutationCoordinator::new(queries.clone());
    Self {
      executor,
      queries,
      mutations,
    }
  }

  pub fn queries(&self) -> &QueryExecutor {
    &self.queries
  }

  /// Fetch function that runs `operation` on the request executor.
  pub fn fetch_fn(&self, operation: Operation) -> FetchFn {
    let executor = self.executor.clone();
    fetch_fn(move || {
      let executor = executor.clone();
      let operation = operation.clone();
      async move { executor.execute(&operation).await }
    })
  }

  /// Long-lived observer for a read operation.
  pub fn observe<T: DeserializeOwned>(&self, operation: Operation) -> QueryObserver<T> {
    let key = read_key(&operation);
    let options = options_for(&operation);
    QueryObserver::new(self.queries.clone(), key, self.fetch_fn(operation), options)
  }

  async fn read<T: DeserializeOwned>(&self, operation: Operation) -> QueryResult<T> {
    let key = read_key(&operation);
    let options = options_for(&operation);
    let entry = self
      .queries
      .execute(&key, self.fetch_fn(operation), options)
      .await;
    QueryResult::from_entry(&entry)
  }

  pub async fn health(&self) -> QueryResult<HealthStatus> {
    self.read(Operation::HealthCheck).await
  }

  pub async fn user_profile(&self, id: &str) -> QueryResult<UserProfile> {
    self.read(Operation::UserGetProfile { id: id.into() }).await
  }

  pub async fn wallet_balance(&self, id: &str) -> QueryResult<WalletBalance> {
    self.read(Operation::WalletGetBalance { id: id.into() }).await
  }

  pub async fn wallet_transactions(&self, id: &str) -> QueryResult<Vec<Transaction>> {
    self
      .read(Operation::WalletGetTransactions { id: id.into() })
      .await
  }

  pub async fn merits(&self, id: &str) -> QueryResult<Vec<Merit>> {
    self.read(Operation::WalletGetMerits { id: id.into() }).await
  }

  pub async fn marketplace_items(&self, filters: ItemFilters) -> QueryResult<Vec<MarketplaceItem>> {
    self.read(Operation::MarketplaceListItems { filters }).await
  }

  pub async fn posts(&self, page: u32, limit: u32) -> QueryResult<PostsPage> {
    self.read(Operation::SocialListPosts { page, limit }).await
  }

  pub async fn post(&self, id: &str) -> QueryResult<Post> {
    self.read(Operation::SocialGetPost { id: id.into() }).await
  }

  pub async fn comments(&self, post_id: &str, page: u32) -> QueryResult<CommentsPage> {
    self
      .read(Operation::SocialListComments {
        post_id: post_id.into(),
        page,
      })
      .await
  }

  pub async fn video_items(&self) -> QueryResult<Vec<VideoItem>> {
    self.read(Operation::VideoListItems).await
  }

  pub async fn video_categories(&self) -> QueryResult<Vec<VideoCategory>> {
    self.read(Operation::VideoListCategories).await
  }

  pub async fn playlists(&self) -> QueryResult<Vec<Playlist>> {
    self.read(Operation::VideoListPlaylists).await
  }

  async fn mutate(
    &self,
    operation: Operation,
    mutation_type: MutationType,
    patches: Vec<Patch>,
  ) -> Result<Value, MutationError> {
    let payload = serde_json::to_value(&operation).unwrap_or(Value::Null);
    let descriptor = MutationDescriptor::new(mutation_type, payload);
    let executor = self.executor.clone();
    self
      .mutations
      .run(descriptor, patches, async move { executor.execute(&operation).await })
      .await
  }

  /// Like or unlike a post, flipping it in every cached view right away.
  pub async fn toggle_like(&self, post_id: &str) -> Result<Value, MutationError> {
    self
      .mutate(
        Operation::SocialToggleLike {
          post_id: post_id.into(),
        },
        MutationType::ToggleLike {
          post_id: post_id.into(),
        },
        toggle_like_patches(post_id),
      )
      .await
  }

  pub async fn create_post(
    &self,
    content: &str,
    post_type: Option<String>,
    media: Option<String>,
  ) -> Result<Value, MutationError> {
    self
      .mutate(
        Operation::SocialCreatePost {
          content: content.into(),
          post_type,
          media,
        },
        MutationType::CreatePost,
        Vec::new(),
      )
      .await
  }

  pub async fn create_comment(&self, post_id: &str, content: &str) -> Result<Value, MutationError> {
    self
      .mutate(
        Operation::SocialCreateComment {
          post_id: post_id.into(),
          content: content.into(),
        },
        MutationType::CreateComment {
          post_id: post_id.into(),
        },
        Vec::new(),
      )
      .await
  }

  pub async fn delete_comment(&self, post_id: &str, comment_id: &str) -> Result<Value, MutationError> {
    self
      .mutate(
        Operation::SocialDeleteComment {
          comment_id: comment_id.into(),
        },
        MutationType::DeleteComment {
          post_id: post_id.into(),
          comment_id: comment_id.into(),
        },
        delete_comment_patches(post_id, comment_id),
      )
      .await
  }

  pub async fn award_merit(
    &self,
    user_id: &str,
    merit_type: &str,
    amount: i64,
    description: Option<String>,
  ) -> Result<Value, MutationError> {
    self
      .mutate(
        Operation::WalletAwardMerit {
          id: user_id.into(),
          merit_type: merit_type.into(),
          amount,
          description,
        },
        MutationType::AwardMerit {
          user_id: user_id.into(),
        },
        Vec::new(),
      )
      .await
  }

  pub async fn create_item(&self, item: NewItem) -> Result<Value, MutationError> {
    self
      .mutate(
        Operation::MarketplaceCreateItem { data: item },
        MutationType::CreateItem,
        Vec::new(),
      )
      .await
  }

  pub async fn update_item(&self, id: &str, changes: Value) -> Result<Value, MutationError> {
    self
      .mutate(
        Operation::MarketplaceUpdateItem {
          id: id.into(),
          data: changes,
        },
        MutationType::UpdateItem { item_id: id.into() },
        Vec::new(),
      )
      .await
  }

  /// Delete an item, dropping it from every cached listing right away.
  pub async fn delete_item(&self, id: &str) -> Result<Value, MutationError> {
    self
      .mutate(
        Operation::MarketplaceDeleteItem { id: id.into() },
        MutationType::DeleteItem { item_id: id.into() },
        delete_item_patches(id),
      )
      .await
  }
}

/// Cache key of a read operation. Mutations never reach this.
fn read_key(operation: &Operation) -> CacheKey {
  operation
    .cache_key()
    .unwrap_or_else(|| cache_key![operation.name()])
}

/// Degradation options per read: resources with a fallback factory read
/// silently and never surface a failure.
fn options_for(operation: &Operation) -> QueryOptions {
  let fallback = match operation {
    Operation::HealthCheck => to_value(fallback::health()),
    Operation::UserGetProfile { id } => to_value(fallback::user_profile(id)),
    Operation::WalletGetBalance { id } => to_value(fallback::wallet_balance(id)),
    Operation::WalletGetTransactions { .. } => to_value(fallback::wallet_transactions()),
    Operation::WalletGetMerits { .. } => to_value(fallback::merits()),
    Operation::MarketplaceListItems { .. } => to_value(fallback::marketplace_items()),
    Operation::SocialListPosts { page, .. } => to_value(fallback::posts_page(*page)),
    Operation::SocialListComments { page, .. } => to_value(fallback::comments_page(*page)),
    Operation::VideoListItems => to_value(fallback::video_items()),
    Operation::VideoListCategories => to_value(fallback::video_categories()),
    Operation::VideoListPlaylists => to_value(fallback::playlists()),
    _ => None,
  };

  match fallback {
    Some(fallback) => QueryOptions::with_fallback(fallback).silent(),
    None => QueryOptions::default(),
  }
}

fn to_value<T: Serialize>(value: T) -> Option<Value> {
  serde_json::to_value(value).ok()
}

/// Flip the like flag of a cached post in place, leaving every other field
/// as the server sent it.
fn toggle_post_like(post: &mut Value) -> Option<()> {
  let mut typed: Post = serde_json::from_value(post.clone()).ok()?;
  typed.toggle_like();
  let fields = post.as_object_mut()?;
  fields.insert("likesCount".into(), Value::from(typed.likes_count));
  fields.insert("liked".into(), Value::from(typed.liked));
  Some(())
}

fn has_id(value: &Value, id: &str) -> bool {
  value.get("id").and_then(Value::as_str) == Some(id)
}

fn toggle_like_patches(post_id: &str) -> Vec<Patch> {
  let in_page = post_id.to_string();
  vec![
    Patch::exact(cache_key!["social", "post", post_id], |post| {
      let mut post = post.clone();
      toggle_post_like(&mut post)?;
      Some(post)
    }),
    Patch::new(posts_family(), move |page| {
      let mut page = page.clone();
      let post = page
        .get_mut("posts")?
        .as_array_mut()?
        .iter_mut()
        .find(|post| has_id(post, &in_page))?;
      toggle_post_like(post)?;
      Some(page)
    }),
  ]
}

fn delete_item_patches(item_id: &str) -> Vec<Patch> {
  let item_id = item_id.to_string();
  vec![Patch::new(items_family(), move |items| {
    let mut items = items.clone();
    let list = items.as_array_mut()?;
    let before = list.len();
    list.retain(|item| !has_id(item, &item_id));
    let removed = list.len() != before;
    removed.then_some(items)
  })]
}

fn delete_comment_patches(post_id: &str, comment_id: &str) -> Vec<Patch> {
  let comment_id = comment_id.to_string();
  let pages = cache_key!["social", "post", post_id, "comments"];
  vec![Patch::new(KeyPattern::Prefix(pages), move |page| {
    let mut page = page.clone();
    let comments = page.get_mut("comments")?.as_array_mut()?;
    let before = comments.len();
    comments.retain(|comment| !has_id(comment, &comment_id));
    let removed = (before - comments.len()) as u64;
    if removed == 0 {
      return None;
    }
    if let Some(total) = page.get("total").and_then(Value::as_u64) {
      page["total"] = Value::from(total.saturating_sub(removed));
    }
    Some(page)
  })]
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::executor::testing::ScriptedExecutor;
  use crate::api::FetchError;
  use crate::cache::{CacheStore, EntryStatus, KeySegment, StalenessRegistry};
  use serde_json::json;
  use std::time::Duration;

  fn client(api: &Arc<ScriptedExecutor>) -> ApiClient {
    let queries = QueryExecutor::new(CacheStore::new(StalenessRegistry::default()));
    ApiClient::new(api.clone(), queries)
  }

  fn post_json(likes: u64, liked: bool) -> Value {
    json!({"id": "post-7", "content": "hola", "likesCount": likes, "liked": liked})
  }

  #[tokio::test(start_paused = true)]
  async fn test_missing_endpoint_reads_as_fallback() {
    let api = Arc::new(ScriptedExecutor::new());
    let client = client(&api);

    for _ in 0..2 {
      let balance = client.wallet_balance("u1").await;
      assert_eq!(balance.status, EntryStatus::Fresh);
      assert!(!balance.is_error);
      assert_eq!(balance.data, Some(fallback::wallet_balance("u1")));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_post_without_fallback_surfaces_error() {
    let api = Arc::new(ScriptedExecutor::new());
    api.respond("social.getPost", Err(FetchError::from_status(400, "bad id")));
    let client = client(&api);

    let post = client.post("nope").await;
    assert!(post.is_error);
    assert!(post.data.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_toggle_like_is_optimistic_and_rolls_back() {
    let api = Arc::new(ScriptedExecutor::new());
    api.respond("social.getPost", Ok(post_json(3, false)));
    api.respond(
      "social.listPosts",
      Ok(json!({"posts": [post_json(3, false)], "page": 0, "total": 1})),
    );
    let client = client(&api);
    let post: Post = client.post("post-7").await.data.unwrap();
    assert_eq!((post.likes_count, post.liked), (3, false));
    client.posts(0, 20).await;

    let respond = api.gate("social.toggleLike");
    let pending = {
      let client = client.clone();
      tokio::spawn(async move { client.toggle_like("post-7").await })
    };
    tokio::task::yield_now().await;

    let store = client.queries().store();
    let optimistic: Post =
      serde_json::from_value(store.get(&cache_key!["social", "post", "post-7"]).unwrap().data.unwrap())
        .unwrap();
    assert_eq!((optimistic.likes_count, optimistic.liked), (4, true));
    let page: PostsPage =
      serde_json::from_value(store.get(&cache_key!["social", "posts", 0, 20]).unwrap().data.unwrap())
        .unwrap();
    assert_eq!((page.posts[0].likes_count, page.posts[0].liked), (4, true));

    respond
      .send(Err(FetchError::from_status(500, "boom")))
      .unwrap();
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.restored, 2);

    let reverted: Post =
      serde_json::from_value(store.get(&cache_key!["social", "post", "post-7"]).unwrap().data.unwrap())
        .unwrap();
    assert_eq!((reverted.likes_count, reverted.liked), (3, false));
    assert_eq!(reverted.extra, post.extra);
  }

  #[tokio::test(start_paused = true)]
  async fn test_optimistic_like_changes_only_like_fields() {
    let api = Arc::new(ScriptedExecutor::new());
    let original = json!({
      "posts": [
        {"id": "p1", "content": "hola", "likesCount": 3, "liked": false, "author": {"name": "Ana"}},
        {"id": "p2", "content": "adios", "likesCount": 1}
      ],
      "page": 0,
      "total": 2,
      "hasMore": true,
      "limit": 20
    });
    api.respond("social.listPosts", Ok(original.clone()));
    let client = client(&api);
    client.posts(0, 20).await;

    let respond = api.gate("social.toggleLike");
    let pending = {
      let client = client.clone();
      tokio::spawn(async move { client.toggle_like("p1").await })
    };
    tokio::task::yield_now().await;

    let mut expected = original.clone();
    expected["posts"][0]["likesCount"] = json!(4);
    expected["posts"][0]["liked"] = json!(true);
    let key = cache_key!["social", "posts", 0, 20];
    let optimistic = client.queries().store().get(&key).unwrap();
    assert_eq!(optimistic.data, Some(expected.clone()));

    respond.send(Ok(json!({"liked": true}))).unwrap();
    pending.await.unwrap().unwrap();
    assert_eq!(client.queries().store().get(&key).unwrap().data, Some(expected));
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_item_removes_from_every_list() {
    let api = Arc::new(ScriptedExecutor::new());
    api.respond(
      "marketplace.listItems",
      Ok(json!([
        {"id": "i1", "title": "Lamp", "price": 10.0},
        {"id": "i2", "title": "Desk", "price": 80.0}
      ])),
    );
    api.respond("marketplace.deleteItem", Ok(Value::Null));
    let client = client(&api);
    client.marketplace_items(ItemFilters::default()).await;
    client
      .marketplace_items(ItemFilters {
        search: Some("a".into()),
        ..Default::default()
      })
      .await;

    let _sub = client
      .queries()
      .store()
      .subscribe(&items_family().child(KeySegment::filter_hash(&ItemFilters::default())));
    client.delete_item("i1").await.unwrap();

    for key in client.queries().store().keys_matching(&KeyPattern::Prefix(items_family())) {
      let entry = client.queries().store().get(&key).unwrap();
      assert_eq!(entry.status, EntryStatus::Stale);
      let items: Vec<MarketplaceItem> = serde_json::from_value(entry.data.unwrap()).unwrap();
      assert!(items.iter().all(|item| item.id != "i1"), "{} still lists i1", key);
    }

    // The subscribed list refetches in the background
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(api.calls("marketplace.listItems"), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_comment_adjusts_pages() {
    let api = Arc::new(ScriptedExecutor::new());
    api.respond(
      "social.listComments",
      Ok(json!({
        "comments": [
          {"id": "c1", "postId": "p1", "content": "first"},
          {"id": "c2", "postId": "p1", "content": "second"}
        ],
        "page": 0,
        "total": 2
      })),
    );
    api.respond("social.deleteComment", Ok(Value::Null));
    let client = client(&api);
    client.comments("p1", 0).await;

    client.delete_comment("p1", "c1").await.unwrap();
    let entry = client
      .queries()
      .store()
      .get(&cache_key!["social", "post", "p1", "comments", 0])
      .unwrap();
    let page: CommentsPage = serde_json::from_value(entry.data.unwrap()).unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.comments.len(), 1);
    assert_eq!(page.comments[0].id, "c2");
  }

  #[tokio::test(start_paused = true)]
  async fn test_award_merit_surfaces_validation_reason() {
    let api = Arc::new(ScriptedExecutor::new());
    api.respond(
      "wallet.awardMerit",
      Err(FetchError::from_status(400, "amount must be positive")),
    );
    let client = client(&api);

    let err = client.award_merit("u1", "HELP", -5, None).await.unwrap_err();
    assert_eq!(err.reason(), "amount must be positive");
    assert_eq!(err.mutation, "awardMerit");
  }

  #[tokio::test(start_paused = true)]
  async fn test_observe_uses_fallback_options() {
    let api = Arc::new(ScriptedExecutor::new());
    let client = client(&api);

    let mut videos: QueryObserver<Vec<VideoItem>> = client.observe(Operation::VideoListItems);
    videos.mount();
    tokio::time::sleep(Duration::from_millis(1)).await;
    videos.poll();
    assert_eq!(videos.status(), EntryStatus::Fresh);
    assert_eq!(videos.data(), Some(&Vec::new()));
  }
}
