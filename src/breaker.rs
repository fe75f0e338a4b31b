//! 断路器模块
//! Circuit breaker module
//!
//! 将任意易错的异步调用包装成带重试、超时和熔断的调用；一个实例包键值存储，
//! 一个实例包队列客户端，控制面 API 走自己的固定重试
//! Wraps any fallible async call with retries, a timeout and a fuse; one
//! instance wraps the key/value store, one wraps the queue client, while the
//! control-plane API carries its own fixed retry policy

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// 断路器配置
/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
  /// 失败后的重试次数
  /// Number of retries after a failure
  pub retries: u32,
  /// 重试间隔
  /// Delay between retries
  pub retry_delay: Duration,
  /// 单次调用超时
  /// Per-attempt timeout
  pub timeout: Duration,
  /// 连续可重试失败多少次后熔断
  /// How many consecutive retriable failures trip the fuse
  pub failure_threshold: u32,
  /// 熔断后的冷却时间，过后放行一次探测
  /// Cooldown after tripping, after which one probe is let through
  pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      retries: 3,
      retry_delay: Duration::from_secs(5),
      timeout: Duration::from_secs(10),
      failure_threshold: 5,
      reset_timeout: Duration::from_secs(10),
    }
  }
}

impl BreakerConfig {
  /// 创建新的断路器配置
  /// Create a new circuit breaker configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置重试次数
  /// Set the retry count
  pub fn retries(mut self, retries: u32) -> Self {
    self.retries = retries;
    self
  }

  /// 设置重试间隔
  /// Set the retry delay
  pub fn retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }

  /// 设置单次调用超时
  /// Set the per-attempt timeout
  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// 设置熔断阈值
  /// Set the trip threshold
  pub fn failure_threshold(mut self, threshold: u32) -> Self {
    self.failure_threshold = threshold.max(1);
    self
  }

  /// 设置冷却时间
  /// Set the cooldown
  pub fn reset_timeout(mut self, reset_timeout: Duration) -> Self {
    self.reset_timeout = reset_timeout;
    self
  }
}

/// 断路器统计快照
/// Circuit breaker statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStats {
  pub total: u64,
  pub timeouts: u64,
  pub success: u64,
  pub failure: u64,
  pub concurrent: u64,
  pub average_time_ms: u64,
  pub is_closed: bool,
}

/// 断路器
/// Circuit breaker
pub struct CircuitBreaker {
  config: BreakerConfig,
  total: AtomicU64,
  timeouts: AtomicU64,
  successes: AtomicU64,
  failures: AtomicU64,
  concurrent: AtomicU64,
  elapsed_ms: AtomicU64,
  consecutive_failures: AtomicU32,
  open_until: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
  /// 创建新的断路器
  /// Create a new circuit breaker
  pub fn new(config: BreakerConfig) -> Self {
    Self {
      config,
      total: AtomicU64::new(0),
      timeouts: AtomicU64::new(0),
      successes: AtomicU64::new(0),
      failures: AtomicU64::new(0),
      concurrent: AtomicU64::new(0),
      elapsed_ms: AtomicU64::new(0),
      consecutive_failures: AtomicU32::new(0),
      open_until: Mutex::new(None),
    }
  }

  /// 执行被包装的调用
  /// Run the wrapped call
  ///
  /// 熔断打开时快速失败返回 [`Error::BreakerOpen`]；关闭时按配置重试，
  /// 只有可重试的错误才会触发重试
  /// Fails fast with [`Error::BreakerOpen`] while the fuse is open; retries
  /// per configuration while closed, and only retriable errors trigger a
  /// retry
  pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if !self.allow_request() {
      self.total.fetch_add(1, Ordering::Relaxed);
      self.failures.fetch_add(1, Ordering::Relaxed);
      return Err(Error::BreakerOpen);
    }

    self.total.fetch_add(1, Ordering::Relaxed);
    self.concurrent.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let mut attempt: u32 = 0;
    let outcome = loop {
      match tokio::time::timeout(self.config.timeout, op()).await {
        Ok(Ok(value)) => break Ok(value),
        Ok(Err(err)) => {
          if attempt >= self.config.retries || !err.is_retriable() {
            break Err(err);
          }
          tracing::debug!(attempt, error = %err, "Breaker retrying after failure");
        }
        Err(_) => {
          self.timeouts.fetch_add(1, Ordering::Relaxed);
          if attempt >= self.config.retries {
            break Err(Error::Timeout);
          }
          tracing::debug!(attempt, "Breaker retrying after timeout");
        }
      }
      attempt += 1;
      if !self.config.retry_delay.is_zero() {
        tokio::time::sleep(self.config.retry_delay).await;
      }
    };

    self.concurrent.fetch_sub(1, Ordering::Relaxed);
    self
      .elapsed_ms
      .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

    match &outcome {
      Ok(_) => {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if let Ok(mut open_until) = self.open_until.lock() {
          *open_until = None;
        }
      }
      Err(err) => {
        self.failures.fetch_add(1, Ordering::Relaxed);
        // 语义错误（例如重复调度）不推动熔断
        // Semantic errors (e.g. duplicate scheduling) do not advance the fuse
        if err.is_retriable() || matches!(err, Error::Timeout) {
          let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
          if consecutive >= self.config.failure_threshold {
            if let Ok(mut open_until) = self.open_until.lock() {
              *open_until = Some(Instant::now() + self.config.reset_timeout);
            }
            tracing::warn!(consecutive, "Circuit breaker tripped");
          }
        }
      }
    }

    outcome
  }

  /// 熔断打开且未到冷却期时拒绝请求
  /// Reject the request while the fuse is open and the cooldown has not
  /// elapsed
  fn allow_request(&self) -> bool {
    let Ok(mut open_until) = self.open_until.lock() else {
      return true;
    };
    match *open_until {
      Some(until) if Instant::now() < until => false,
      Some(_) => {
        // 冷却期已过，放行一次探测
        // Cooldown elapsed, let one probe through
        *open_until = None;
        true
      }
      None => true,
    }
  }

  /// 读取统计快照
  /// Read a statistics snapshot
  pub fn stats(&self) -> BreakerStats {
    let total = self.total.load(Ordering::Relaxed);
    let elapsed = self.elapsed_ms.load(Ordering::Relaxed);
    let is_closed = self
      .open_until
      .lock()
      .map(|open_until| match *open_until {
        Some(until) => Instant::now() >= until,
        None => true,
      })
      .unwrap_or(true);
    BreakerStats {
      total,
      timeouts: self.timeouts.load(Ordering::Relaxed),
      success: self.successes.load(Ordering::Relaxed),
      failure: self.failures.load(Ordering::Relaxed),
      concurrent: self.concurrent.load(Ordering::Relaxed),
      average_time_ms: if total == 0 { 0 } else { elapsed / total },
      is_closed,
    }
  }
}

impl Default for CircuitBreaker {
  fn default() -> Self {
    Self::new(BreakerConfig::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Arc;

  fn fast_config() -> BreakerConfig {
    BreakerConfig::new()
      .retries(2)
      .retry_delay(Duration::ZERO)
      .timeout(Duration::from_millis(100))
  }

  #[tokio::test]
  async fn test_success_passthrough() {
    let breaker = CircuitBreaker::new(fast_config());
    let result: Result<u32> = breaker.run(|| async { Ok(42) }).await;
    assert_eq!(result.unwrap(), 42);

    let stats = breaker.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.success, 1);
    assert_eq!(stats.failure, 0);
    assert!(stats.is_closed);
  }

  #[tokio::test]
  async fn test_retries_until_success() {
    let breaker = CircuitBreaker::new(fast_config());
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let result: Result<&str> = breaker
      .run(move || {
        let counter = counter.clone();
        async move {
          if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(Error::connect("refused"))
          } else {
            Ok("done")
          }
        }
      })
      .await;
    assert_eq!(result.unwrap(), "done");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_semantic_error_not_retried() {
    let breaker = CircuitBreaker::new(fast_config());
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let result: Result<()> = breaker
      .run(move || {
        let counter = counter.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
          Err(Error::DuplicateScheduled)
        }
      })
      .await;
    assert!(matches!(result, Err(Error::DuplicateScheduled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    // 语义错误不熔断
    // Semantic errors do not trip the fuse
    assert!(breaker.stats().is_closed);
  }

  #[tokio::test]
  async fn test_trips_after_threshold() {
    let config = fast_config()
      .retries(0)
      .failure_threshold(2)
      .reset_timeout(Duration::from_secs(60));
    let breaker = CircuitBreaker::new(config);

    for _ in 0..2 {
      let result: Result<()> = breaker.run(|| async { Err(Error::connect("down")) }).await;
      assert!(result.is_err());
    }
    let result: Result<()> = breaker.run(|| async { Ok(()) }).await;
    assert!(matches!(result, Err(Error::BreakerOpen)));
    assert!(!breaker.stats().is_closed);
  }

  #[tokio::test]
  async fn test_timeout_counted() {
    let config = fast_config().retries(0).timeout(Duration::from_millis(10));
    let breaker = CircuitBreaker::new(config);
    let result: Result<()> = breaker
      .run(|| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
      })
      .await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(breaker.stats().timeouts, 1);
  }
}
