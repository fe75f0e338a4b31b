//! 组件模块
//! Components module
//!
//! 提供通用的组件生命周期管理 trait，用于管理各种后台组件
//! （调度器、超时监视器）
//! Provides a common trait for component lifecycle management, used to
//! manage the background components (the scheduler and the timeout monitor)

use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod scheduler;
pub mod timeout_monitor;

/// 组件生命周期管理接口
/// Component lifecycle management interface
///
/// # 实现者 / Implementors
///
/// - [`Scheduler`](scheduler::Scheduler) - 搬运到期的延迟任务并分发给处理器
/// - [`TimeoutMonitor`](timeout_monitor::TimeoutMonitor) - 清理超时的运行中构建
pub trait ComponentLifecycle {
  /// 启动组件
  /// Start the component
  ///
  /// 此方法启动组件的后台任务，返回一个 JoinHandle 用于等待任务完成
  /// This method starts the component's background task, returning a
  /// JoinHandle to wait for completion
  fn start(self: Arc<Self>) -> JoinHandle<()>;

  /// 关闭组件
  /// Shutdown the component
  ///
  /// 发送关闭信号，组件会在完成当前操作后停止
  /// Sends the shutdown signal; the component stops after completing its
  /// current operation
  fn shutdown(&self);

  /// 检查组件是否已完成
  /// Check if the component is done
  fn is_done(&self) -> bool;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiClient;
  use crate::components::timeout_monitor::TimeoutMonitor;
  use crate::config::{TimeoutMonitorConfig, TokenGenFn};
  use crate::memdb::MemoryBackend;
  use std::time::Duration;

  // 嵌入方以 trait 对象持有组件；用真实组件验证这个表面
  // Embedders hold components as trait objects; validate that surface with
  // a real component
  #[tokio::test]
  async fn test_timeout_monitor_through_trait_object() {
    let backend = Arc::new(MemoryBackend::new());
    let token_gen: TokenGenFn = Arc::new(|_, _| "jwt".to_string());
    let config = TimeoutMonitorConfig::new("http://127.0.0.1:9", token_gen)
      .check_interval(Duration::from_millis(10));
    let monitor: Arc<dyn ComponentLifecycle> = Arc::new(TimeoutMonitor::new(
      backend,
      ApiClient::with_policy(1, Duration::ZERO),
      config,
      "",
    ));

    assert!(!monitor.is_done());

    let handle = monitor.clone().start();

    tokio::time::sleep(Duration::from_millis(30)).await;
    monitor.shutdown();

    assert!(monitor.is_done());
    handle.await.unwrap();
  }
}
