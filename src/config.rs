//! 配置模块
//! Configuration module
//!
//! 定义了经纪人、调度器和超时监视器的配置选项
//! Defines configuration options for the broker, the scheduler and the
//! timeout monitor

use crate::breaker::BreakerConfig;
use crate::error::{Error, Result};
use crate::redis::RedisConfig;
use std::sync::Arc;
use std::time::Duration;

/// 令牌生成函数类型：(用户名, scmContext) -> JWT
/// Token generator function type: (username, scmContext) -> JWT
pub type TokenGenFn = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// 经纪人配置
/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
  /// Redis 连接，必填
  /// Redis connection, required
  pub redis: RedisConfig,
  /// 所有存储键和队列键的前缀
  /// Prefix applied to every store and queue key
  pub prefix: String,
  /// 包住存储与队列客户端的断路器配置
  /// Circuit breaker configuration wrapping the store and queue clients
  pub breaker: BreakerConfig,
}

impl BrokerConfig {
  /// 创建新的经纪人配置
  /// Create a new broker configuration
  pub fn new(redis: RedisConfig) -> Self {
    Self {
      redis,
      prefix: String::new(),
      breaker: BreakerConfig::default(),
    }
  }

  /// 设置键前缀
  /// Set the key prefix
  pub fn prefix<S: Into<String>>(mut self, prefix: S) -> Self {
    self.prefix = prefix.into();
    self
  }

  /// 设置断路器配置
  /// Set the circuit breaker configuration
  pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
    self.breaker = breaker;
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.breaker.failure_threshold == 0 {
      return Err(Error::config("Breaker failure threshold must be positive"));
    }
    if self.breaker.timeout.is_zero() {
      return Err(Error::config("Breaker timeout must be positive"));
    }
    Ok(())
  }
}

/// 调度器配置
/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// 每个队列常驻的最少工作者数
  /// Minimum resident workers per queue
  pub min_task_processors: usize,
  /// 每个队列允许的最多工作者数
  /// Maximum workers allowed per queue
  pub max_task_processors: usize,
  /// 轮询间隔
  /// Poll interval
  pub check_timeout: Duration,
  /// 事件循环延迟上限（毫秒），保留的调优项
  /// Event loop delay ceiling in milliseconds, kept as a tuning knob
  pub max_event_loop_delay_ms: u64,
  /// 主节点锁的租期
  /// Master lock lease duration
  pub master_lock_ttl: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      min_task_processors: 1,
      max_task_processors: 10,
      check_timeout: Duration::from_millis(1000),
      max_event_loop_delay_ms: 10,
      master_lock_ttl: Duration::from_secs(60),
    }
  }
}

impl SchedulerConfig {
  /// 创建新的调度器配置
  /// Create a new scheduler configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置最少工作者数
  /// Set the minimum worker count
  pub fn min_task_processors(mut self, min: usize) -> Self {
    self.min_task_processors = min.max(1);
    self
  }

  /// 设置最多工作者数
  /// Set the maximum worker count
  pub fn max_task_processors(mut self, max: usize) -> Self {
    self.max_task_processors = max.max(1);
    self
  }

  /// 设置轮询间隔
  /// Set the poll interval
  pub fn check_timeout(mut self, check_timeout: Duration) -> Self {
    self.check_timeout = check_timeout;
    self
  }

  /// 设置主节点锁租期
  /// Set the master lock lease duration
  pub fn master_lock_ttl(mut self, ttl: Duration) -> Self {
    self.master_lock_ttl = ttl;
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.min_task_processors == 0 {
      return Err(Error::config("min_task_processors must be positive"));
    }
    if self.max_task_processors < self.min_task_processors {
      return Err(Error::config(
        "max_task_processors cannot be less than min_task_processors",
      ));
    }
    if self.master_lock_ttl.is_zero() {
      return Err(Error::config("master_lock_ttl must be positive"));
    }
    Ok(())
  }
}

/// 超时监视器配置
/// Timeout monitor configuration
#[derive(Clone)]
pub struct TimeoutMonitorConfig {
  /// 控制面 API 基址
  /// Control-plane API base URI
  pub api_uri: String,
  /// 扫描间隔
  /// Sweep interval
  pub check_interval: Duration,
  /// 超时判定的宽限
  /// Grace buffer added to the timeout check
  pub grace: Duration,
  /// 用于签发状态更新令牌的生成函数
  /// Generator for the tokens that sign status updates
  pub token_gen: TokenGenFn,
}

impl TimeoutMonitorConfig {
  /// 创建新的超时监视器配置
  /// Create a new timeout monitor configuration
  pub fn new<S: Into<String>>(api_uri: S, token_gen: TokenGenFn) -> Self {
    Self {
      api_uri: api_uri.into(),
      check_interval: Duration::from_secs(60),
      grace: Duration::from_secs(60),
      token_gen,
    }
  }

  /// 设置扫描间隔
  /// Set the sweep interval
  pub fn check_interval(mut self, interval: Duration) -> Self {
    self.check_interval = interval;
    self
  }

  /// 设置宽限
  /// Set the grace buffer
  pub fn grace(mut self, grace: Duration) -> Self {
    self.grace = grace;
    self
  }
}

// Manual Debug implementation because the token generator is an opaque Fn.
impl std::fmt::Debug for TimeoutMonitorConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TimeoutMonitorConfig")
      .field("api_uri", &self.api_uri)
      .field("check_interval", &self.check_interval)
      .field("grace", &self.grace)
      .field("token_gen", &"<fn>")
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_broker_config_defaults() {
    let config = BrokerConfig::new(RedisConfig::new("127.0.0.1", 6379));
    assert_eq!(config.prefix, "");
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_broker_config_builder() {
    let config = BrokerConfig::new(RedisConfig::new("127.0.0.1", 6379))
      .prefix("sd:")
      .breaker(BreakerConfig::new().retries(5));
    assert_eq!(config.prefix, "sd:");
    assert_eq!(config.breaker.retries, 5);
  }

  #[test]
  fn test_scheduler_config_defaults() {
    let config = SchedulerConfig::default();
    assert_eq!(config.min_task_processors, 1);
    assert_eq!(config.max_task_processors, 10);
    assert_eq!(config.check_timeout, Duration::from_millis(1000));
    assert_eq!(config.max_event_loop_delay_ms, 10);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_scheduler_config_validation() {
    let config = SchedulerConfig::new()
      .min_task_processors(5)
      .max_task_processors(2);
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_timeout_monitor_config() {
    let token_gen: TokenGenFn = Arc::new(|username, _| format!("jwt-{username}"));
    let config = TimeoutMonitorConfig::new("http://api", token_gen)
      .check_interval(Duration::from_secs(30))
      .grace(Duration::from_secs(120));
    assert_eq!(config.check_interval, Duration::from_secs(30));
    assert_eq!(config.grace, Duration::from_secs(120));
    let printed = format!("{config:?}");
    assert!(printed.contains("<fn>"));
  }
}
