//! 存储抽象模块
//! Storage abstraction module
//!
//! 定义了与键值存储和延迟队列交互的抽象层，Redis 与内存两种后端都实现它
//! Defines the abstraction layer for interacting with the key/value store and
//! the delayed queue; both the Redis and the in-memory backend implement it

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub mod constants;
pub mod keys;

/// 队列条目的任务名
/// Job name of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobName {
  /// 立即启动一个构建
  /// Start a build immediately
  Start,
  /// 停止一个构建
  /// Stop a build
  Stop,
  /// 周期构建到期触发
  /// Periodic build fired on maturity
  StartDelayed,
  /// 冻结构建到期触发
  /// Frozen build fired on maturity
  StartFrozen,
}

impl JobName {
  /// 转换为字符串
  /// Convert to string
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Start => "start",
      Self::Stop => "stop",
      Self::StartDelayed => "startDelayed",
      Self::StartFrozen => "startFrozen",
    }
  }
}

impl FromStr for JobName {
  type Err = ();

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s {
      "start" => Ok(Self::Start),
      "stop" => Ok(Self::Stop),
      "startDelayed" => Ok(Self::StartDelayed),
      "startFrozen" => Ok(Self::StartFrozen),
      _ => Err(()),
    }
  }
}

impl std::fmt::Display for JobName {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// 构建状态
/// Build status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildStatus {
  Queued,
  Running,
  Success,
  Failure,
  Aborted,
  Frozen,
  Blocked,
  Collapsed,
}

impl BuildStatus {
  /// 转换为字符串
  /// Convert to string
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Queued => "QUEUED",
      Self::Running => "RUNNING",
      Self::Success => "SUCCESS",
      Self::Failure => "FAILURE",
      Self::Aborted => "ABORTED",
      Self::Frozen => "FROZEN",
      Self::Blocked => "BLOCKED",
      Self::Collapsed => "COLLAPSED",
    }
  }
}

impl std::fmt::Display for BuildStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// 任务状态（流水线定义层面）
/// Job state (at the pipeline definition level)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
  #[default]
  Enabled,
  Disabled,
}

/// 交给执行工作者的工作单元
/// Unit of work handed to executor workers
///
/// 参数相等性以规范化序列化结果判定（serde_json 默认按键排序）
/// Argument equality is decided by canonical serialization (serde_json sorts
/// map keys by default)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
  /// 目标队列
  /// Destination queue
  pub queue: String,
  /// 任务名
  /// Job name
  pub class: JobName,
  /// 单个位置参数
  /// Single positional argument object
  pub args: serde_json::Value,
}

impl QueueItem {
  /// 创建新的队列条目
  /// Create a new queue item
  pub fn new<S: Into<String>>(queue: S, class: JobName, args: serde_json::Value) -> Self {
    Self {
      queue: queue.into(),
      class,
      args,
    }
  }

  /// 编码为规范化 JSON（稳定键序）
  /// Encode to canonical JSON (stable key order)
  pub fn encode(&self) -> Result<String> {
    Ok(serde_json::to_string(self)?)
  }

  /// 从规范化 JSON 解码
  /// Decode from canonical JSON
  pub fn decode(data: &str) -> Result<Self> {
    Ok(serde_json::from_str(data)?)
  }
}

/// 键值存储特性，定义哈希表、带 TTL 的字符串键和连接判定
/// Key/value store trait: hash maps, string keys with TTL, and the
/// connection predicate
#[async_trait]
pub trait Store: Send + Sync {
  /// 建立连接；已连接时应当是幂等的
  /// Establish the connection; must be idempotent once connected
  async fn connect(&self) -> Result<()>;

  /// 是否已经连接，调用方用它来跳过多余的连接
  /// Whether a connection is established; callers use this to skip
  /// redundant connects
  fn connected(&self) -> bool;

  /// 检查存活
  /// Liveness check
  async fn ping(&self) -> Result<()>;

  /// 关闭连接
  /// Close the connection
  async fn close(&self) -> Result<()>;

  /// 写入哈希字段
  /// Write a hash field
  async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

  /// 读取哈希字段
  /// Read a hash field
  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

  /// 删除哈希字段，返回是否存在过
  /// Delete a hash field, returns whether it existed
  async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

  /// 读取整个哈希表
  /// Read the whole hash
  async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;

  /// 写入字符串键
  /// Write a string key
  async fn set(&self, key: &str, value: &str) -> Result<()>;

  /// 读取字符串键
  /// Read a string key
  async fn get(&self, key: &str) -> Result<Option<String>>;

  /// 删除字符串键，返回是否存在过
  /// Delete a string key, returns whether it existed
  async fn del(&self, key: &str) -> Result<bool>;

  /// 设置键的生存时间
  /// Set a key's time-to-live
  async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

  /// 仅当键不存在时写入并设置 TTL，返回是否写入成功
  /// Write only when the key does not exist, with TTL; returns whether the
  /// write happened
  async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
}

/// 延迟工作队列特性
/// Delayed work queue trait
///
/// `push_at` 在同一条目、同一时间戳已存在时返回 [`Error::DuplicateScheduled`]，
/// 这是去重信号而不是故障
/// `push_at` returns [`Error::DuplicateScheduled`] when the same item already
/// exists at the same timestamp; that is the de-duplication signal, not a
/// fault
#[async_trait]
pub trait DelayedQueue: Send + Sync {
  /// 建立连接；已连接时应当是幂等的
  /// Establish the connection; must be idempotent once connected
  async fn connect(&self) -> Result<()>;

  /// 是否已经连接
  /// Whether a connection is established
  fn connected(&self) -> bool;

  /// 关闭连接
  /// Close the connection
  async fn close(&self) -> Result<()>;

  /// 追加到就绪队列尾部
  /// Append to the tail of the ready queue
  async fn push(&self, item: &QueueItem) -> Result<()>;

  /// 插入延迟索引，时间戳为毫秒
  /// Insert into the delayed index, millisecond timestamp
  async fn push_at(&self, at: DateTime<Utc>, item: &QueueItem) -> Result<()>;

  /// 从就绪队列移除匹配条目，返回移除数量
  /// Remove matching items from the ready queue, returns the removed count
  async fn remove(&self, item: &QueueItem) -> Result<u64>;

  /// 从延迟索引移除匹配条目，返回移除数量
  /// Remove matching items from the delayed index, returns the removed count
  async fn remove_delayed(&self, item: &QueueItem) -> Result<u64>;

  /// 弹出就绪队列头部条目
  /// Pop the head item of a ready queue
  async fn pop(&self, queue: &str) -> Result<Option<QueueItem>>;

  /// 将到期的延迟条目移入各自的就绪队列，返回移动数量
  /// Move matured delayed items into their ready queues, returns the moved
  /// count
  async fn move_matured(&self, now: DateTime<Utc>) -> Result<u64>;
}
