//! Redis 配置和连接管理模块
//! Redis configuration and connection management module

use crate::error::Result;
use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};

/// Redis 连接配置
/// Redis connection configuration
#[derive(Clone)]
pub struct RedisConfig {
  host: String,
  port: u16,
  password: Option<String>,
  database: i64,
}

impl RedisConfig {
  /// 创建指向单机 Redis 的连接配置
  /// Create a connection configuration pointing at a standalone Redis
  pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
      password: None,
      database: 0,
    }
  }

  /// 从 redis:// URL 创建连接配置
  /// Create a connection configuration from a redis:// URL
  pub fn from_url(url: &str) -> Result<Self> {
    let info = url.into_connection_info()?;
    let (host, port) = match info.addr {
      ConnectionAddr::Tcp(host, port) => (host, port),
      ConnectionAddr::TcpTls { host, port, .. } => (host, port),
      ConnectionAddr::Unix(path) => (path.to_string_lossy().to_string(), 0),
    };
    Ok(Self {
      host,
      port,
      password: info.redis.password,
      database: info.redis.db,
    })
  }

  /// 设置密码
  /// Set the password
  pub fn password<S: Into<String>>(mut self, password: S) -> Self {
    self.password = Some(password.into());
    self
  }

  /// 设置数据库编号
  /// Set the database number
  pub fn database(mut self, database: i64) -> Self {
    self.database = database;
    self
  }

  /// 转换为 redis crate 的连接信息
  /// Convert into the redis crate's connection info
  pub(crate) fn connection_info(&self) -> ConnectionInfo {
    ConnectionInfo {
      addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
      redis: RedisConnectionInfo {
        db: self.database,
        username: None,
        password: self.password.clone(),
        ..Default::default()
      },
    }
  }
}

// Manual Debug implementation so the password never reaches log output.
impl std::fmt::Debug for RedisConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RedisConfig")
      .field("host", &self.host)
      .field("port", &self.port)
      .field("password", &self.password.as_ref().map(|_| "<redacted>"))
      .field("database", &self.database)
      .finish()
  }
}
