//! 内存后端
//! In-memory backend
//!
//! 用内存数据结构同时实现键值存储和延迟队列，不依赖任何外部服务；
//! 供本地运行和测试使用
//! Implements both the key/value store and the delayed queue with in-memory
//! data structures, without any external service dependencies; used for
//! local runs and tests

use crate::base::{DelayedQueue, QueueItem, Store};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// 字符串键条目
/// String key entry
#[derive(Clone)]
struct StringEntry {
  value: String,
  expires_at: Option<DateTime<Utc>>,
}

/// 内存存储
/// Memory storage
#[derive(Default)]
struct MemoryStorage {
  /// 哈希表
  /// Hash maps
  hashes: HashMap<String, HashMap<String, String>>,
  /// 字符串键，含可选过期时间
  /// String keys with optional expiry
  strings: HashMap<String, StringEntry>,
  /// 就绪队列 - 队列名到编码条目
  /// Ready queues - queue name to encoded items
  ready: HashMap<String, VecDeque<String>>,
  /// 延迟索引 - 毫秒时间戳到编码条目
  /// Delayed index - millisecond timestamp to encoded items
  delayed: BTreeMap<i64, Vec<String>>,
  /// 每个条目被调度到的时间戳
  /// Timestamps each item is scheduled at
  timestamps: HashMap<String, BTreeSet<i64>>,
}

impl MemoryStorage {
  /// 惰性清除已过期的字符串键
  /// Lazily drop expired string keys
  fn drop_expired(&mut self, now: DateTime<Utc>) {
    self
      .strings
      .retain(|_, entry| entry.expires_at.map(|at| at > now).unwrap_or(true));
  }
}

/// 内存后端，同时充当存储和队列
/// Memory backend, acting as both the store and the queue
pub struct MemoryBackend {
  storage: Arc<RwLock<MemoryStorage>>,
  connected: AtomicBool,
}

impl Default for MemoryBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryBackend {
  /// 创建新的内存后端
  /// Create a new memory backend
  pub fn new() -> Self {
    Self {
      storage: Arc::new(RwLock::new(MemoryStorage::default())),
      connected: AtomicBool::new(false),
    }
  }

  /// 剩余生存时间（秒），无过期设置时为 None
  /// Remaining time-to-live in seconds, None when no expiry is set
  pub async fn ttl(&self, key: &str) -> Option<i64> {
    let storage = self.storage.read().await;
    let entry = storage.strings.get(key)?;
    let expires_at = entry.expires_at?;
    Some((expires_at - Utc::now()).num_seconds())
  }

  /// 当前延迟索引中的所有条目
  /// Every entry currently in the delayed index
  pub async fn delayed_entries(&self) -> Vec<(i64, QueueItem)> {
    let storage = self.storage.read().await;
    let mut out = Vec::new();
    for (ts, items) in &storage.delayed {
      for raw in items {
        if let Ok(item) = QueueItem::decode(raw) {
          out.push((*ts, item));
        }
      }
    }
    out
  }

  /// 某个就绪队列里的所有条目
  /// Every item in one ready queue
  pub async fn ready_items(&self, queue: &str) -> Vec<QueueItem> {
    let storage = self.storage.read().await;
    storage
      .ready
      .get(queue)
      .map(|items| items.iter().filter_map(|raw| QueueItem::decode(raw).ok()).collect())
      .unwrap_or_default()
  }

  /// 哈希表的字段数
  /// Field count of a hash
  pub async fn hash_len(&self, key: &str) -> usize {
    let storage = self.storage.read().await;
    storage.hashes.get(key).map(HashMap::len).unwrap_or(0)
  }
}

#[async_trait]
impl Store for MemoryBackend {
  async fn connect(&self) -> Result<()> {
    self.connected.store(true, Ordering::Relaxed);
    Ok(())
  }

  fn connected(&self) -> bool {
    self.connected.load(Ordering::Relaxed)
  }

  async fn ping(&self) -> Result<()> {
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    self.connected.store(false, Ordering::Relaxed);
    Ok(())
  }

  async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
    let mut storage = self.storage.write().await;
    storage
      .hashes
      .entry(key.to_string())
      .or_default()
      .insert(field.to_string(), value.to_string());
    Ok(())
  }

  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
    let storage = self.storage.read().await;
    Ok(
      storage
        .hashes
        .get(key)
        .and_then(|hash| hash.get(field))
        .cloned(),
    )
  }

  async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
    let mut storage = self.storage.write().await;
    Ok(
      storage
        .hashes
        .get_mut(key)
        .map(|hash| hash.remove(field).is_some())
        .unwrap_or(false),
    )
  }

  async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
    let storage = self.storage.read().await;
    Ok(
      storage
        .hashes
        .get(key)
        .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default(),
    )
  }

  async fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut storage = self.storage.write().await;
    storage.strings.insert(
      key.to_string(),
      StringEntry {
        value: value.to_string(),
        expires_at: None,
      },
    );
    Ok(())
  }

  async fn get(&self, key: &str) -> Result<Option<String>> {
    let mut storage = self.storage.write().await;
    storage.drop_expired(Utc::now());
    Ok(storage.strings.get(key).map(|entry| entry.value.clone()))
  }

  async fn del(&self, key: &str) -> Result<bool> {
    let mut storage = self.storage.write().await;
    Ok(storage.strings.remove(key).is_some())
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
    let mut storage = self.storage.write().await;
    let deadline = Utc::now()
      + chrono::Duration::from_std(ttl)
        .map_err(|_| Error::store(format!("TTL out of range: {ttl:?}")))?;
    if let Some(entry) = storage.strings.get_mut(key) {
      entry.expires_at = Some(deadline);
    }
    Ok(())
  }

  async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
    let mut storage = self.storage.write().await;
    let now = Utc::now();
    storage.drop_expired(now);
    if storage.strings.contains_key(key) {
      return Ok(false);
    }
    let deadline = now
      + chrono::Duration::from_std(ttl)
        .map_err(|_| Error::store(format!("TTL out of range: {ttl:?}")))?;
    storage.strings.insert(
      key.to_string(),
      StringEntry {
        value: value.to_string(),
        expires_at: Some(deadline),
      },
    );
    Ok(true)
  }
}

#[async_trait]
impl DelayedQueue for MemoryBackend {
  async fn connect(&self) -> Result<()> {
    self.connected.store(true, Ordering::Relaxed);
    Ok(())
  }

  fn connected(&self) -> bool {
    self.connected.load(Ordering::Relaxed)
  }

  async fn close(&self) -> Result<()> {
    self.connected.store(false, Ordering::Relaxed);
    Ok(())
  }

  async fn push(&self, item: &QueueItem) -> Result<()> {
    let encoded = item.encode()?;
    let mut storage = self.storage.write().await;
    storage
      .ready
      .entry(item.queue.clone())
      .or_default()
      .push_back(encoded);
    Ok(())
  }

  async fn push_at(&self, at: DateTime<Utc>, item: &QueueItem) -> Result<()> {
    let encoded = item.encode()?;
    let timestamp_ms = at.timestamp_millis();
    let mut storage = self.storage.write().await;
    let stamps = storage.timestamps.entry(encoded.clone()).or_default();
    if stamps.contains(&timestamp_ms) {
      return Err(Error::DuplicateScheduled);
    }
    stamps.insert(timestamp_ms);
    storage.delayed.entry(timestamp_ms).or_default().push(encoded);
    Ok(())
  }

  async fn remove(&self, item: &QueueItem) -> Result<u64> {
    let encoded = item.encode()?;
    let mut storage = self.storage.write().await;
    let Some(items) = storage.ready.get_mut(&item.queue) else {
      return Ok(0);
    };
    let before = items.len();
    items.retain(|raw| raw != &encoded);
    Ok((before - items.len()) as u64)
  }

  async fn remove_delayed(&self, item: &QueueItem) -> Result<u64> {
    let encoded = item.encode()?;
    let mut storage = self.storage.write().await;
    let Some(stamps) = storage.timestamps.remove(&encoded) else {
      return Ok(0);
    };
    let mut removed = 0;
    for ts in stamps {
      if let Some(items) = storage.delayed.get_mut(&ts) {
        let before = items.len();
        items.retain(|raw| raw != &encoded);
        removed += (before - items.len()) as u64;
        if items.is_empty() {
          storage.delayed.remove(&ts);
        }
      }
    }
    Ok(removed)
  }

  async fn pop(&self, queue: &str) -> Result<Option<QueueItem>> {
    let mut storage = self.storage.write().await;
    let raw = storage.ready.get_mut(queue).and_then(VecDeque::pop_front);
    match raw {
      Some(raw) => Ok(Some(QueueItem::decode(&raw)?)),
      None => Ok(None),
    }
  }

  async fn move_matured(&self, now: DateTime<Utc>) -> Result<u64> {
    let now_ms = now.timestamp_millis();
    let mut storage = self.storage.write().await;
    let due: Vec<i64> = storage
      .delayed
      .range(..=now_ms)
      .map(|(ts, _)| *ts)
      .collect();
    let mut moved = 0;
    for ts in due {
      let Some(items) = storage.delayed.remove(&ts) else {
        continue;
      };
      for raw in items {
        let item = QueueItem::decode(&raw)?;
        let emptied = match storage.timestamps.get_mut(&raw) {
          Some(stamps) => {
            stamps.remove(&ts);
            stamps.is_empty()
          }
          None => false,
        };
        if emptied {
          storage.timestamps.remove(&raw);
        }
        storage
          .ready
          .entry(item.queue.clone())
          .or_default()
          .push_back(raw);
        moved += 1;
      }
    }
    Ok(moved)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::base::JobName;
  use serde_json::json;

  fn item(job_id: u64) -> QueueItem {
    QueueItem::new("periodicBuilds", JobName::StartDelayed, json!({ "jobId": job_id }))
  }

  #[tokio::test]
  async fn test_hash_roundtrip() {
    let backend = MemoryBackend::new();
    backend.hset("configs", "1234", "{}").await.unwrap();
    assert_eq!(backend.hget("configs", "1234").await.unwrap().as_deref(), Some("{}"));
    assert!(backend.hdel("configs", "1234").await.unwrap());
    assert!(!backend.hdel("configs", "1234").await.unwrap());
  }

  #[tokio::test]
  async fn test_push_at_duplicate() {
    let backend = MemoryBackend::new();
    let at = Utc::now() + chrono::Duration::minutes(1);
    backend.push_at(at, &item(1)).await.unwrap();
    assert!(matches!(
      backend.push_at(at, &item(1)).await,
      Err(Error::DuplicateScheduled)
    ));
    // 不同时间戳不算重复
    // A different timestamp is not a duplicate
    backend
      .push_at(at + chrono::Duration::minutes(1), &item(1))
      .await
      .unwrap();
    assert_eq!(backend.remove_delayed(&item(1)).await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_move_matured() {
    let backend = MemoryBackend::new();
    let past = Utc::now() - chrono::Duration::minutes(1);
    let future = Utc::now() + chrono::Duration::minutes(10);
    backend.push_at(past, &item(1)).await.unwrap();
    backend.push_at(future, &item(2)).await.unwrap();

    let moved = backend.move_matured(Utc::now()).await.unwrap();
    assert_eq!(moved, 1);

    let popped = backend.pop("periodicBuilds").await.unwrap().unwrap();
    assert_eq!(popped.args["jobId"], 1);
    assert!(backend.pop("periodicBuilds").await.unwrap().is_none());
    assert_eq!(backend.delayed_entries().await.len(), 1);
  }

  #[tokio::test]
  async fn test_set_nx_ex() {
    let backend = MemoryBackend::new();
    assert!(
      backend
        .set_nx_ex("lock", "a", Duration::from_secs(60))
        .await
        .unwrap()
    );
    assert!(
      !backend
        .set_nx_ex("lock", "b", Duration::from_secs(60))
        .await
        .unwrap()
    );
    assert_eq!(backend.get("lock").await.unwrap().as_deref(), Some("a"));
  }

  #[tokio::test]
  async fn test_ttl_tracking() {
    let backend = MemoryBackend::new();
    backend.set("marker", "").await.unwrap();
    assert_eq!(backend.ttl("marker").await, None);
    backend.expire("marker", Duration::from_secs(1800)).await.unwrap();
    let ttl = backend.ttl("marker").await.unwrap();
    assert!(ttl > 1700 && ttl <= 1800);
  }
}
