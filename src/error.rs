//! 错误处理模块
//! Error handling module
//!
//! 定义了 sdqueue 库中使用的各种错误类型
//! Defines various error types used in the sdqueue library

use thiserror::Error;

/// sdqueue 库的结果类型
/// Result type for the sdqueue library
pub type Result<T> = std::result::Result<T, Error>;

/// sdqueue 错误类型
/// sdqueue error type
#[derive(Error, Debug)]
pub enum Error {
  /// Redis connection error
  #[error("Redis error: {0}")]
  Redis(#[from] redis::RedisError),

  /// 序列化错误
  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// HTTP 传输错误
  /// HTTP transport error
  #[error("HTTP error: {0}")]
  Http(#[from] reqwest::Error),

  /// 连接错误
  /// Connection error
  #[error("Connection error: {message}")]
  Connect { message: String },

  /// 存储错误
  /// Store error
  #[error("Store error: {message}")]
  Store { message: String },

  /// 队列错误
  /// Queue error
  #[error("Queue error: {message}")]
  Queue { message: String },

  /// 控制面 API 错误
  /// Control-plane API error
  #[error("API error: {message}")]
  Api { message: String },

  /// 断路器处于打开状态，调用被快速拒绝
  /// Circuit breaker is open, the call was rejected fast
  #[error("Circuit breaker is open")]
  BreakerOpen,

  /// 调用超时
  /// Operation timeout
  #[error("Operation timeout")]
  Timeout,

  /// 同一任务在同一时间戳上已存在延迟条目
  /// A delayed entry already exists for the same item at the same timestamp
  #[error("Item already scheduled at this time with the same arguments")]
  DuplicateScheduled,

  /// Cron 表达式字段数不对或无法解析
  /// Cron expression has the wrong field count or cannot be parsed
  #[error("Malformed cron expression: {expression}")]
  MalformedCron { expression: String },

  /// Cron 哈希范围越界
  /// Cron hash range out of bounds
  #[error("Invalid range H({lo}-{hi}) for the {field} field")]
  InvalidRange {
    field: &'static str,
    lo: u32,
    hi: u32,
  },

  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },
}

impl Error {
  /// 创建连接错误
  /// Create a connection error
  pub fn connect<S: Into<String>>(message: S) -> Self {
    Self::Connect {
      message: message.into(),
    }
  }

  /// 创建存储错误
  /// Create a store error
  pub fn store<S: Into<String>>(message: S) -> Self {
    Self::Store {
      message: message.into(),
    }
  }

  /// 创建队列错误
  /// Create a queue error
  pub fn queue<S: Into<String>>(message: S) -> Self {
    Self::Queue {
      message: message.into(),
    }
  }

  /// 创建 API 错误
  /// Create an API error
  pub fn api<S: Into<String>>(message: S) -> Self {
    Self::Api {
      message: message.into(),
    }
  }

  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 检查是否为可重试错误
  /// Check if the error is retriable
  ///
  /// 传输层的失败可以重试；语义错误（重复调度、表达式非法）不可以
  /// Transport-level failures are retriable; semantic errors (duplicate
  /// scheduling, malformed expressions) are not
  pub fn is_retriable(&self) -> bool {
    matches!(
      self,
      Error::Redis(_)
        | Error::Http(_)
        | Error::Connect { .. }
        | Error::Store { .. }
        | Error::Queue { .. }
        | Error::Api { .. }
        | Error::Timeout
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_creation() {
    let err = Error::queue("test queue error");
    assert!(matches!(err, Error::Queue { .. }));

    let err = Error::config("test config error");
    assert!(matches!(err, Error::Config { .. }));

    let err = Error::api("test api error");
    assert!(matches!(err, Error::Api { .. }));
  }

  #[test]
  fn test_error_retriable() {
    assert!(Error::Timeout.is_retriable());
    assert!(Error::connect("refused").is_retriable());
    assert!(!Error::DuplicateScheduled.is_retriable());
    assert!(!Error::BreakerOpen.is_retriable());
    assert!(!Error::MalformedCron {
      expression: "* *".into()
    }
    .is_retriable());
  }

  #[test]
  fn test_error_display() {
    let err = Error::InvalidRange {
      field: "minute",
      lo: 10,
      hi: 99,
    };
    assert_eq!(err.to_string(), "Invalid range H(10-99) for the minute field");
  }
}
