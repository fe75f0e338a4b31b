//! 超时监视器模块
//! Timeout monitor module
//!
//! 周期扫描超时登记表，把超过声明时限的运行中构建标记为失败并清掉登记；
//! 与 startTimer/stopTimer 一样是尽力而为的簿记
//! Periodically sweeps the timeout registry, marks running builds past
//! their declared limit as failed and clears the entry; best-effort
//! bookkeeping just like startTimer/stopTimer

use crate::api::{ApiClient, CREATOR_USERNAME};
use crate::base::{keys, BuildStatus, Store};
use crate::broker::TimeoutEntry;
use crate::components::ComponentLifecycle;
use crate::config::TimeoutMonitorConfig;
use crate::error::{Error, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// 超时失败时写回的状态消息
/// Status message written back on a timeout failure
const TIMEOUT_MESSAGE: &str = "Build failed due to timeout";

/// 超时监视器
/// Timeout monitor
pub struct TimeoutMonitor {
  store: Arc<dyn Store>,
  api: ApiClient,
  config: TimeoutMonitorConfig,
  prefix: String,
  done: Arc<AtomicBool>,
}

impl TimeoutMonitor {
  /// 创建新的超时监视器
  /// Create a new timeout monitor
  pub fn new(
    store: Arc<dyn Store>,
    api: ApiClient,
    config: TimeoutMonitorConfig,
    prefix: &str,
  ) -> Self {
    Self {
      store,
      api,
      config,
      prefix: prefix.to_string(),
      done: Arc::new(AtomicBool::new(false)),
    }
  }

  /// 启动扫描循环
  /// Start the sweep loop
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.config.check_interval);
      loop {
        ticker.tick().await;
        if self.done.load(Ordering::Relaxed) {
          tracing::debug!("TimeoutMonitor: shutting down");
          break;
        }
        match self.sweep().await {
          Ok(expired) if expired > 0 => {
            tracing::info!(expired, "Timed out builds failed and cleared");
          }
          Ok(_) => {}
          Err(err) => {
            tracing::error!(error = %err, "Timeout sweep failed");
          }
        }
      }
    })
  }

  /// 扫一遍登记表，返回这次清掉的条目数
  /// Sweep the registry once, returns the number of entries cleared
  pub async fn sweep(&self) -> Result<u64> {
    if !self.store.connected() {
      self.store.connect().await?;
    }
    let key = keys::timeout_configs_key(&self.prefix);
    let entries = self.store.hgetall(&key).await?;
    let now = Utc::now();
    let grace = chrono::Duration::from_std(self.config.grace)
      .map_err(|_| Error::config(format!("Grace out of range: {:?}", self.config.grace)))?;

    let mut expired = 0;
    for (build_id_raw, raw) in entries {
      let Ok(build_id) = build_id_raw.parse::<u64>() else {
        tracing::warn!(field = %build_id_raw, "Timeout entry keyed by a non-numeric build id");
        continue;
      };
      let entry: TimeoutEntry = match serde_json::from_str(&raw) {
        Ok(entry) => entry,
        Err(err) => {
          tracing::warn!(build_id, error = %err, "Unreadable timeout entry, removing");
          let _ = self.store.hdel(&key, &build_id_raw).await;
          continue;
        }
      };
      let deadline = entry.start_time + chrono::Duration::minutes(entry.timeout) + grace;
      if now <= deadline {
        continue;
      }
      let token = (self.config.token_gen)(CREATOR_USERNAME, "");
      match self
        .api
        .update_build_status(
          &self.config.api_uri,
          build_id,
          &token,
          BuildStatus::Failure,
          TIMEOUT_MESSAGE,
        )
        .await
      {
        Ok(()) => {
          self.store.hdel(&key, &build_id_raw).await?;
          tracing::info!(
            build_id,
            job_id = entry.job_id,
            timeout = entry.timeout,
            "Build failed due to timeout"
          );
          expired += 1;
        }
        Err(err) => {
          // 状态没写成就保留条目，下一轮再试
          // The entry stays when the status write failed, the next sweep
          // retries
          tracing::error!(build_id, error = %err, "Could not fail timed out build");
        }
      }
    }
    Ok(expired)
  }

  /// 请求停止
  /// Request shutdown
  pub fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
  }

  /// 检查是否已停止
  /// Check if stopped
  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::Relaxed)
  }
}

impl ComponentLifecycle for TimeoutMonitor {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    TimeoutMonitor::start(self)
  }

  fn shutdown(&self) {
    TimeoutMonitor::shutdown(self)
  }

  fn is_done(&self) -> bool {
    TimeoutMonitor::is_done(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::TokenGenFn;
  use crate::memdb::MemoryBackend;
  use std::time::Duration;

  fn monitor(backend: Arc<MemoryBackend>) -> TimeoutMonitor {
    let token_gen: TokenGenFn = Arc::new(|_, _| "jwt".to_string());
    // 端口 9 上没有服务，状态写入立即失败
    // Nothing listens on port 9, the status write fails immediately
    let config = TimeoutMonitorConfig::new("http://127.0.0.1:9", token_gen);
    TimeoutMonitor::new(backend, ApiClient::with_policy(1, Duration::ZERO), config, "")
  }

  #[tokio::test]
  async fn test_fresh_entries_survive_sweep() {
    let backend = Arc::new(MemoryBackend::new());
    let entry = TimeoutEntry {
      job_id: 777,
      start_time: Utc::now(),
      timeout: 90,
    };
    backend
      .hset("timeoutConfigs", "8609", &serde_json::to_string(&entry).unwrap())
      .await
      .unwrap();

    let monitor = monitor(backend.clone());
    assert_eq!(monitor.sweep().await.unwrap(), 0);
    assert_eq!(backend.hash_len("timeoutConfigs").await, 1);
  }

  #[tokio::test]
  async fn test_expired_entry_survives_failed_status_write() {
    let backend = Arc::new(MemoryBackend::new());
    let entry = TimeoutEntry {
      job_id: 777,
      start_time: Utc::now() - chrono::Duration::minutes(200),
      timeout: 90,
    };
    backend
      .hset("timeoutConfigs", "8609", &serde_json::to_string(&entry).unwrap())
      .await
      .unwrap();

    let monitor = monitor(backend.clone());
    // API 不可达，条目必须留到下一轮
    // The API is unreachable, the entry must stay for the next sweep
    assert_eq!(monitor.sweep().await.unwrap(), 0);
    assert_eq!(backend.hash_len("timeoutConfigs").await, 1);
  }

  #[tokio::test]
  async fn test_unreadable_entry_is_dropped() {
    let backend = Arc::new(MemoryBackend::new());
    backend
      .hset("timeoutConfigs", "8609", "not json")
      .await
      .unwrap();

    let monitor = monitor(backend.clone());
    assert_eq!(monitor.sweep().await.unwrap(), 0);
    assert_eq!(backend.hash_len("timeoutConfigs").await, 0);
  }

  #[tokio::test]
  async fn test_shutdown_flag() {
    let backend = Arc::new(MemoryBackend::new());
    let monitor = monitor(backend);
    assert!(!monitor.is_done());
    monitor.shutdown();
    assert!(monitor.is_done());
  }
}
