//! Redis 键值存储实现
//! Redis key/value store implementation
//!
//! 连接是惰性建立的：第一次操作时才真正连到 Redis，`connected()` 让调用方
//! 跳过多余的连接
//! The connection is lazy: the first operation actually connects to Redis,
//! and `connected()` lets callers skip redundant connects

use crate::base::Store;
use crate::error::Result;
use crate::redis::RedisConfig;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Redis 存储客户端
/// Redis store client
pub struct RedisStore {
  client: redis::Client,
  conn: OnceCell<MultiplexedConnection>,
}

impl RedisStore {
  /// 创建新的存储客户端；此时并不连接
  /// Create a new store client; this does not connect yet
  pub fn new(config: &RedisConfig) -> Result<Self> {
    let client = redis::Client::open(config.connection_info())?;
    Ok(Self {
      client,
      conn: OnceCell::new(),
    })
  }

  /// 获取（必要时建立）共享连接
  /// Get the shared connection, establishing it when necessary
  async fn connection(&self) -> Result<MultiplexedConnection> {
    let conn = self
      .conn
      .get_or_try_init(|| async { self.client.get_multiplexed_tokio_connection().await })
      .await?;
    Ok(conn.clone())
  }
}

#[async_trait]
impl Store for RedisStore {
  async fn connect(&self) -> Result<()> {
    self.connection().await?;
    Ok(())
  }

  fn connected(&self) -> bool {
    self.conn.initialized()
  }

  async fn ping(&self) -> Result<()> {
    let mut conn = self.connection().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    // 多路复用连接在最后一个克隆被丢弃时关闭
    // The multiplexed connection closes when its last clone is dropped
    Ok(())
  }

  async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
    let mut conn = self.connection().await?;
    let _: () = conn.hset(key, field, value).await?;
    Ok(())
  }

  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
    let mut conn = self.connection().await?;
    let value: Option<String> = conn.hget(key, field).await?;
    Ok(value)
  }

  async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
    let mut conn = self.connection().await?;
    let removed: i64 = conn.hdel(key, field).await?;
    Ok(removed > 0)
  }

  async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
    let mut conn = self.connection().await?;
    let entries: std::collections::HashMap<String, String> = conn.hgetall(key).await?;
    Ok(entries.into_iter().collect())
  }

  async fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut conn = self.connection().await?;
    let _: () = conn.set(key, value).await?;
    Ok(())
  }

  async fn get(&self, key: &str) -> Result<Option<String>> {
    let mut conn = self.connection().await?;
    let value: Option<String> = conn.get(key).await?;
    Ok(value)
  }

  async fn del(&self, key: &str) -> Result<bool> {
    let mut conn = self.connection().await?;
    let removed: i64 = conn.del(key).await?;
    Ok(removed > 0)
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
    let mut conn = self.connection().await?;
    let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
    Ok(())
  }

  async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
    let mut conn = self.connection().await?;
    let reply: Option<String> = redis::cmd("SET")
      .arg(key)
      .arg(value)
      .arg("NX")
      .arg("EX")
      .arg(ttl.as_secs())
      .query_async(&mut conn)
      .await?;
    Ok(reply.is_some())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_new_does_not_connect() {
    let config = RedisConfig::new("127.0.0.1", 6379);
    let store = RedisStore::new(&config).unwrap();
    assert!(!store.connected());
  }

  #[tokio::test]
  #[ignore] // Requires Redis to be running
  async fn test_hash_roundtrip() {
    let config = RedisConfig::new("127.0.0.1", 6379);
    let store = RedisStore::new(&config).unwrap();
    store.connect().await.unwrap();
    assert!(store.connected());

    store.hset("sdqueue:test", "field", "value").await.unwrap();
    assert_eq!(
      store.hget("sdqueue:test", "field").await.unwrap().as_deref(),
      Some("value")
    );
    assert!(store.hdel("sdqueue:test", "field").await.unwrap());
    assert_eq!(store.hget("sdqueue:test", "field").await.unwrap(), None);
  }
}
