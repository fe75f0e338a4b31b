//! 控制面 API 客户端模块
//! Control-plane API client module
//!
//! 负责向 Screwdriver API 发布构建事件和更新构建状态；每个调用按固定间隔
//! 重试，语义上的“无任务可启动”（404）按成功处理
//! Posts build events to the Screwdriver API and updates build status; every
//! call retries on a fixed delay, and the semantic "no job to start" (404)
//! counts as success

use crate::base::constants::{RETRY_DELAY, RETRY_LIMIT};
use crate::base::BuildStatus;
use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

/// 事件创建者名称
/// Event creator name
pub const CREATOR_NAME: &str = "Screwdriver scheduler";

/// 事件创建者用户名
/// Event creator username
pub const CREATOR_USERNAME: &str = "sd:scheduler";

/// 事件创建者
/// Event creator
#[derive(Debug, Clone, Serialize)]
pub struct Creator {
  pub name: &'static str,
  pub username: &'static str,
}

impl Default for Creator {
  fn default() -> Self {
    Self {
      name: CREATOR_NAME,
      username: CREATOR_USERNAME,
    }
  }
}

/// 构建事件请求体
/// Build event request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
  pub pipeline_id: u64,
  pub start_from: String,
  pub creator: Creator,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cause_message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parent_event_id: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub build_id: Option<u64>,
}

/// 控制面 API 客户端
/// Control-plane API client
pub struct ApiClient {
  client: reqwest::Client,
  retry_limit: u32,
  retry_delay: Duration,
}

impl Default for ApiClient {
  fn default() -> Self {
    Self::new()
  }
}

impl ApiClient {
  /// 创建使用默认重试策略的客户端
  /// Create a client with the default retry policy
  pub fn new() -> Self {
    Self::with_policy(RETRY_LIMIT, RETRY_DELAY)
  }

  /// 创建使用指定重试策略的客户端
  /// Create a client with the given retry policy
  pub fn with_policy(retry_limit: u32, retry_delay: Duration) -> Self {
    Self {
      client: reqwest::Client::new(),
      retry_limit: retry_limit.max(1),
      retry_delay,
    }
  }

  /// 发布构建事件
  /// Post a build event
  ///
  /// `POST {apiUri}/v4/events`；201 成功，404 表示没有可启动的任务，同样
  /// 按成功处理，其余情况重试
  /// `POST {apiUri}/v4/events`; 201 succeeds, 404 means there is no job to
  /// start and also counts as success, anything else retries
  pub async fn post_event(&self, api_uri: &str, token: &str, event: &EventRequest) -> Result<()> {
    let url = format!("{}/v4/events", api_uri.trim_end_matches('/'));
    let mut attempt = 0;
    loop {
      attempt += 1;
      match self
        .client
        .post(&url)
        .bearer_auth(token)
        .json(event)
        .send()
        .await
      {
        Ok(response) => match response.status().as_u16() {
          201 => return Ok(()),
          404 => {
            tracing::info!(
              pipeline_id = event.pipeline_id,
              start_from = %event.start_from,
              "No job to start for event"
            );
            return Ok(());
          }
          status => {
            tracing::warn!(attempt, status, url = %url, "Event post returned unexpected status");
            if attempt >= self.retry_limit {
              return Err(Error::api(format!("Failed to post event: status {status}")));
            }
          }
        },
        Err(err) => {
          tracing::warn!(attempt, error = %err, url = %url, "Event post failed");
          if attempt >= self.retry_limit {
            return Err(err.into());
          }
        }
      }
      if !self.retry_delay.is_zero() {
        tokio::time::sleep(self.retry_delay).await;
      }
    }
  }

  /// 更新构建状态
  /// Update build status
  ///
  /// `PUT {apiUri}/v4/builds/{buildId}`；只有 200 算成功
  /// `PUT {apiUri}/v4/builds/{buildId}`; only 200 counts as success
  pub async fn update_build_status(
    &self,
    api_uri: &str,
    build_id: u64,
    token: &str,
    status: BuildStatus,
    message: &str,
  ) -> Result<()> {
    let body = json!({
      "status": status.as_str(),
      "statusMessage": message,
    });
    self.put_build(api_uri, build_id, token, &body).await
  }

  /// 更新构建统计
  /// Update build stats
  pub async fn update_build_stats(
    &self,
    api_uri: &str,
    build_id: u64,
    token: &str,
    stats: &serde_json::Value,
  ) -> Result<()> {
    let body = json!({ "stats": stats });
    self.put_build(api_uri, build_id, token, &body).await
  }

  async fn put_build(
    &self,
    api_uri: &str,
    build_id: u64,
    token: &str,
    body: &serde_json::Value,
  ) -> Result<()> {
    let url = format!("{}/v4/builds/{}", api_uri.trim_end_matches('/'), build_id);
    let mut attempt = 0;
    loop {
      attempt += 1;
      match self
        .client
        .put(&url)
        .bearer_auth(token)
        .json(body)
        .send()
        .await
      {
        Ok(response) => {
          let status = response.status().as_u16();
          if status == 200 {
            return Ok(());
          }
          tracing::warn!(attempt, status, url = %url, "Build update returned unexpected status");
          if attempt >= self.retry_limit {
            return Err(Error::api(format!(
              "Failed to update build {build_id}: status {status}"
            )));
          }
        }
        Err(err) => {
          tracing::warn!(attempt, error = %err, url = %url, "Build update failed");
          if attempt >= self.retry_limit {
            return Err(err.into());
          }
        }
      }
      if !self.retry_delay.is_zero() {
        tokio::time::sleep(self.retry_delay).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_event_request_serialization() {
    let event = EventRequest {
      pipeline_id: 42,
      start_from: "main".to_string(),
      creator: Creator::default(),
      cause_message: Some("Started by periodic build scheduler".to_string()),
      parent_event_id: None,
      build_id: None,
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["pipelineId"], 42);
    assert_eq!(value["startFrom"], "main");
    assert_eq!(value["creator"]["name"], "Screwdriver scheduler");
    assert_eq!(value["creator"]["username"], "sd:scheduler");
    assert_eq!(value["causeMessage"], "Started by periodic build scheduler");
    assert!(value.get("parentEventId").is_none());
    assert!(value.get("buildId").is_none());
  }

  #[test]
  fn test_event_request_optional_fields() {
    let event = EventRequest {
      pipeline_id: 42,
      start_from: "main".to_string(),
      creator: Creator::default(),
      cause_message: None,
      parent_event_id: Some(7),
      build_id: Some(8609),
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["parentEventId"], 7);
    assert_eq!(value["buildId"], 8609);
    assert!(value.get("causeMessage").is_none());
  }

  #[tokio::test]
  async fn test_unreachable_api_surfaces_api_error() {
    // 端口 9（discard）上没有服务，连接立即失败
    // Nothing listens on port 9 (discard), the connection fails immediately
    let client = ApiClient::with_policy(1, Duration::ZERO);
    let event = EventRequest {
      pipeline_id: 1,
      start_from: "main".to_string(),
      creator: Creator::default(),
      cause_message: None,
      parent_event_id: None,
      build_id: None,
    };
    let result = client.post_event("http://127.0.0.1:9", "token", &event).await;
    assert!(result.is_err());
  }
}
