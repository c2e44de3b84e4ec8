//! Request Executor: the boundary that performs one network call.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::error::FetchError;
use super::operation::{HttpMethod, Operation};

/// Performs a single call for a named resource operation.
///
/// Implementations own transport concerns (auth headers, TLS, timeouts) and
/// map every failure onto a [`FetchError`] class.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
  async fn execute(&self, operation: &Operation) -> Result<Value, FetchError>;
}

/// REST executor backed by `reqwest`.
#[derive(Clone)]
pub struct HttpExecutor {
  client: reqwest::Client,
  base_url: url::Url,
  token: Option<String>,
}

impl HttpExecutor {
  pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self> {
    let base_url =
      url::Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL '{}': {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn url_for(&self, path: &str) -> String {
    format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
  }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
  async fn execute(&self, operation: &Operation) -> Result<Value, FetchError> {
    let (method, path, body) = operation.http_request();
    let url = self.url_for(&path);
    debug!(operation = operation.name(), url = %url, "API request");

    let mut request = match method {
      HttpMethod::Get => self.client.get(&url),
      HttpMethod::Post => self.client.post(&url),
      HttpMethod::Patch => self.client.patch(&url),
      HttpMethod::Delete => self.client.delete(&url),
    };
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = &body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| FetchError::network(e.to_string()))?;

    let status = response.status();
    let text = response
      .text()
      .await
      .map_err(|e| FetchError::network(e.to_string()))?;

    if !status.is_success() {
      let message = error_message(&text)
        .or_else(|| status.canonical_reason().map(String::from))
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
      return Err(FetchError::from_status(status.as_u16(), message));
    }

    if text.trim().is_empty() {
      return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
  }
}

/// Pull the server-provided reason out of an error body.
///
/// Understands `{"message": "..."}`, `{"message": ["a", "b"]}`, `{"error": ..}`
/// and `{"details": ..}`; any other non-empty body is used verbatim.
fn error_message(body: &str) -> Option<String> {
  let body = body.trim();
  if body.is_empty() {
    return None;
  }

  let Ok(json) = serde_json::from_str::<Value>(body) else {
    return Some(body.to_string());
  };

  match json.get("message") {
    Some(Value::String(s)) => return Some(s.clone()),
    Some(Value::Array(parts)) => {
      let parts: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
      return Some(parts.join(", "));
    }
    _ => {}
  }

  ["error", "details"]
    .iter()
    .find_map(|field| json.get(*field).and_then(Value::as_str).map(String::from))
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_message_formats() {
    assert_eq!(
      error_message(r#"{"message": "content should not be empty"}"#),
      Some("content should not be empty".to_string())
    );
    assert_eq!(
      error_message(r#"{"message": ["a is required", "b is too long"]}"#),
      Some("a is required, b is too long".to_string())
    );
    assert_eq!(
      error_message(r#"{"error": "Bad Request"}"#),
      Some("Bad Request".to_string())
    );
    assert_eq!(
      error_message("Cannot GET /wallets/user/u1"),
      Some("Cannot GET /wallets/user/u1".to_string())
    );
    assert_eq!(error_message("  "), None);
  }

  #[test]
  fn test_url_joining() {
    let executor = HttpExecutor::new("http://localhost:3002/", Duration::from_secs(1), None).unwrap();
    assert_eq!(executor.url_for("/health"), "http://localhost:3002/health");
    assert!(HttpExecutor::new("not a url", Duration::from_secs(1), None).is_err());
  }

  #[tokio::test]
  async fn test_scripted_executor_prefers_queued_responses() {
    let executor = testing::ScriptedExecutor::new();
    executor.respond("video.listItems", Ok(serde_json::json!([])));
    executor.push("video.listItems", Err(FetchError::network("down")));

    assert!(executor.execute(&Operation::VideoListItems).await.is_err());
    assert!(executor.execute(&Operation::VideoListItems).await.is_ok());
    assert!(executor
      .execute(&Operation::VideoListPlaylists)
      .await
      .unwrap_err()
      .is_not_implemented());
    assert_eq!(executor.calls("video.listItems"), 2);
    assert_eq!(executor.total_calls(), 3);
  }
}
