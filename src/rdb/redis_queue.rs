//! Redis 延迟队列实现
//! Redis delayed queue implementation
//!
//! 布局：每个队列一个就绪列表，每个时间戳一个延迟列表，一个待到期时间戳
//! 有序集合，以及每个条目一个记录其调度时间戳的集合。该集合让重复检查和
//! 定向删除成为可能
//! Layout: one ready list per queue, one delayed list per timestamp, one
//! sorted set of pending timestamps, and one set per item recording the
//! timestamps it is scheduled at. That set is what makes the duplicate
//! check and targeted deletion possible

use crate::base::{keys, DelayedQueue, QueueItem};
use crate::error::{Error, Result};
use crate::rdb::redis_scripts::ScriptManager;
use crate::redis::RedisConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::OnceCell;

/// Redis 队列客户端
/// Redis queue client
pub struct RedisQueue {
  client: redis::Client,
  conn: OnceCell<MultiplexedConnection>,
  prefix: String,
  script_manager: ScriptManager,
}

impl RedisQueue {
  /// 创建新的队列客户端；此时并不连接
  /// Create a new queue client; this does not connect yet
  pub fn new(config: &RedisConfig, prefix: &str) -> Result<Self> {
    let client = redis::Client::open(config.connection_info())?;
    Ok(Self {
      client,
      conn: OnceCell::new(),
      prefix: prefix.to_string(),
      script_manager: ScriptManager::default(),
    })
  }

  async fn connection(&self) -> Result<MultiplexedConnection> {
    let conn = self
      .conn
      .get_or_try_init(|| async { self.client.get_multiplexed_tokio_connection().await })
      .await?;
    Ok(conn.clone())
  }
}

#[async_trait]
impl DelayedQueue for RedisQueue {
  async fn connect(&self) -> Result<()> {
    self.connection().await?;
    Ok(())
  }

  fn connected(&self) -> bool {
    self.conn.initialized()
  }

  async fn close(&self) -> Result<()> {
    Ok(())
  }

  async fn push(&self, item: &QueueItem) -> Result<()> {
    let mut conn = self.connection().await?;
    let key = keys::queue_key(&self.prefix, &item.queue);
    let _: () = conn.rpush(key, item.encode()?).await?;
    Ok(())
  }

  async fn push_at(&self, at: DateTime<Utc>, item: &QueueItem) -> Result<()> {
    let mut conn = self.connection().await?;
    let encoded = item.encode()?;
    let timestamp_ms = at.timestamp_millis();
    let script_keys = vec![
      keys::timestamps_key(&self.prefix, &encoded),
      keys::delayed_key(&self.prefix, timestamp_ms),
      keys::delayed_schedule_key(&self.prefix),
    ];
    let args = vec![encoded, timestamp_ms.to_string()];
    let inserted: i64 = self
      .script_manager
      .eval_script(&mut conn, "push_at", &script_keys, &args)
      .await?;
    if inserted == 0 {
      return Err(Error::DuplicateScheduled);
    }
    Ok(())
  }

  async fn remove(&self, item: &QueueItem) -> Result<u64> {
    let mut conn = self.connection().await?;
    let key = keys::queue_key(&self.prefix, &item.queue);
    let removed: i64 = conn.lrem(key, 0, item.encode()?).await?;
    Ok(removed.max(0) as u64)
  }

  async fn remove_delayed(&self, item: &QueueItem) -> Result<u64> {
    let mut conn = self.connection().await?;
    let encoded = item.encode()?;
    let script_keys = vec![
      keys::timestamps_key(&self.prefix, &encoded),
      keys::delayed_schedule_key(&self.prefix),
    ];
    let args = vec![encoded, keys::delayed_key_prefix(&self.prefix)];
    let removed: i64 = self
      .script_manager
      .eval_script(&mut conn, "remove_delayed", &script_keys, &args)
      .await?;
    Ok(removed.max(0) as u64)
  }

  async fn pop(&self, queue: &str) -> Result<Option<QueueItem>> {
    let mut conn = self.connection().await?;
    let key = keys::queue_key(&self.prefix, queue);
    let raw: Option<String> = conn.lpop(key, None).await?;
    match raw {
      Some(raw) => Ok(Some(QueueItem::decode(&raw)?)),
      None => Ok(None),
    }
  }

  async fn move_matured(&self, now: DateTime<Utc>) -> Result<u64> {
    let mut conn = self.connection().await?;
    let script_keys = vec![keys::delayed_schedule_key(&self.prefix)];
    let args = vec![
      now.timestamp_millis().to_string(),
      keys::delayed_key_prefix(&self.prefix),
      keys::queue_key_prefix(&self.prefix),
      keys::timestamps_key_prefix(&self.prefix),
    ];
    let moved: i64 = self
      .script_manager
      .eval_script(&mut conn, "move_matured", &script_keys, &args)
      .await?;
    Ok(moved.max(0) as u64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::base::JobName;
  use serde_json::json;

  #[test]
  fn test_new_does_not_connect() {
    let config = RedisConfig::new("127.0.0.1", 6379);
    let queue = RedisQueue::new(&config, "sd:").unwrap();
    assert!(!queue.connected());
  }

  #[tokio::test]
  #[ignore] // Requires Redis to be running
  async fn test_push_at_detects_duplicates() {
    let config = RedisConfig::new("127.0.0.1", 6379);
    let queue = RedisQueue::new(&config, "sdqueue-test:").unwrap();
    let item = QueueItem::new("periodicBuilds", JobName::StartDelayed, json!({"jobId": 1}));
    let at = Utc::now() + chrono::Duration::minutes(5);

    queue.push_at(at, &item).await.unwrap();
    let second = queue.push_at(at, &item).await;
    assert!(matches!(second, Err(Error::DuplicateScheduled)));

    assert_eq!(queue.remove_delayed(&item).await.unwrap(), 1);
  }
}
