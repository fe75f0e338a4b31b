//! 调度器模块
//! Scheduler module
//!
//! 一对长驻工作者轮询 periodicBuilds 和 frozenBuilds 两个延迟队列，触发
//! 到期的任务；单个调度器通过存储锁自选为主节点，只有主节点把到期的延迟
//! 任务搬进就绪队列
//! A pair of long-lived workers polls the periodicBuilds and frozenBuilds
//! delay queues and fires matured jobs; a single scheduler elects itself
//! master via a store lock, and only the master moves matured delayed jobs
//! into the ready queues

use crate::base::constants::{FROZEN_QUEUE, PERIODIC_QUEUE};
use crate::base::{keys, DelayedQueue, JobName, QueueItem, Store};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::components::ComponentLifecycle;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// 周期任务处理能力，由经纪人实现；通过小接口断开调度器对经纪人的依赖
/// Periodic job handling capability, implemented by the broker; the small
/// interface breaks the scheduler's dependency on the broker
#[async_trait]
pub trait PeriodicRunner: Send + Sync {
  /// 触发一个到期的周期构建
  /// Fire a matured periodic build
  async fn run_periodic(&self, job_id: u64) -> Result<()>;
}

/// 冻结任务处理能力，由经纪人实现
/// Frozen job handling capability, implemented by the broker
#[async_trait]
pub trait FrozenRunner: Send + Sync {
  /// 触发一个到期的冻结构建
  /// Fire a matured frozen build
  async fn run_frozen(&self, job_id: u64) -> Result<()>;
}

/// 调度器
/// Scheduler
pub struct Scheduler {
  store: Arc<dyn Store>,
  queue: Arc<dyn DelayedQueue>,
  periodic: Arc<dyn PeriodicRunner>,
  frozen: Arc<dyn FrozenRunner>,
  breaker: Arc<CircuitBreaker>,
  config: SchedulerConfig,
  prefix: String,
  scheduler_id: String,
  is_master: AtomicBool,
  done: Arc<AtomicBool>,
  periodic_workers: Arc<AtomicUsize>,
  frozen_workers: Arc<AtomicUsize>,
}

impl Scheduler {
  /// 创建新的调度器
  /// Create a new scheduler
  pub fn new(
    store: Arc<dyn Store>,
    queue: Arc<dyn DelayedQueue>,
    periodic: Arc<dyn PeriodicRunner>,
    frozen: Arc<dyn FrozenRunner>,
    config: SchedulerConfig,
    prefix: &str,
  ) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      store,
      queue,
      periodic,
      frozen,
      // 处理器里含带重试的 API 外呼，超时上限要容得下整个重试链
      // Handlers contain retried API calls, the timeout must fit the whole
      // retry chain
      breaker: Arc::new(CircuitBreaker::new(
        BreakerConfig::default().timeout(std::time::Duration::from_secs(60)),
      )),
      config,
      prefix: prefix.to_string(),
      scheduler_id: Uuid::new_v4().to_string(),
      is_master: AtomicBool::new(false),
      done: Arc::new(AtomicBool::new(false)),
      periodic_workers: Arc::new(AtomicUsize::new(0)),
      frozen_workers: Arc::new(AtomicUsize::new(0)),
    })
  }

  fn workers(&self, queue_name: &str) -> Arc<AtomicUsize> {
    if queue_name == PERIODIC_QUEUE {
      self.periodic_workers.clone()
    } else {
      self.frozen_workers.clone()
    }
  }

  /// 启动主节点循环和两组工作者
  /// Start the master loop and both worker pools
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    for _ in 0..self.config.min_task_processors {
      self.spawn_worker(PERIODIC_QUEUE);
      self.spawn_worker(FROZEN_QUEUE);
    }

    let this = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(this.config.check_timeout);
      loop {
        ticker.tick().await;
        if this.done.load(Ordering::Relaxed) {
          tracing::debug!(scheduler_id = %this.scheduler_id, "Scheduler: shutting down");
          break;
        }
        if let Err(err) = this.master_tick().await {
          tracing::error!(scheduler_id = %this.scheduler_id, error = %err, "Master tick failed");
        }
      }
    })
  }

  /// 争抢或续租主节点锁；持锁者搬运到期的延迟任务
  /// Acquire or renew the master lock; the holder moves matured delayed jobs
  async fn master_tick(&self) -> Result<()> {
    let lock_key = keys::master_lock_key(&self.prefix);
    let ttl = self.config.master_lock_ttl;
    let acquired = self
      .store
      .set_nx_ex(&lock_key, &self.scheduler_id, ttl)
      .await?;
    let master = if acquired {
      tracing::info!(scheduler_id = %self.scheduler_id, "Elected scheduler master");
      true
    } else {
      match self.store.get(&lock_key).await? {
        Some(holder) if holder == self.scheduler_id => {
          self.store.expire(&lock_key, ttl).await?;
          true
        }
        _ => false,
      }
    };
    self.is_master.store(master, Ordering::Relaxed);

    if master {
      let moved = self.queue.move_matured(Utc::now()).await?;
      if moved > 0 {
        tracing::info!(moved, "Moved matured delayed jobs to ready queues");
      }
    }
    Ok(())
  }

  /// 在容量允许时为队列再起一个工作者
  /// Spawn one more worker for the queue when capacity allows
  fn spawn_worker(self: &Arc<Self>, queue_name: &'static str) {
    let counter = self.workers(queue_name);
    let reserved = counter
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        (current < self.config.max_task_processors).then_some(current + 1)
      })
      .is_ok();
    if !reserved {
      return;
    }
    let this = self.clone();
    tokio::spawn(async move {
      this.worker_loop(queue_name, counter).await;
    });
  }

  async fn worker_loop(self: Arc<Self>, queue_name: &'static str, counter: Arc<AtomicUsize>) {
    tracing::info!(queue = queue_name, event = "start", "Worker started");
    loop {
      if self.done.load(Ordering::Relaxed) {
        break;
      }
      match self.queue.pop(queue_name).await {
        Ok(Some(item)) => {
          // 有活干就先补一个同伴，吞吐跟着队列深度走
          // Found work, add a sibling first so throughput follows queue depth
          self.spawn_worker(queue_name);
          tracing::info!(
            queue = queue_name,
            event = "job",
            job = %item.class,
            args = %item.args,
            "Working job"
          );
          match self.handle(&item).await {
            Ok(()) => {
              tracing::info!(queue = queue_name, event = "success", job = %item.class, "Job finished");
              if item.class == JobName::StartDelayed {
                tracing::info!(queue = queue_name, event = "reEnqueue", args = %item.args, "Next firing scheduled");
              }
            }
            Err(err) => {
              tracing::error!(
                queue = queue_name,
                event = "failure",
                job = %item.class,
                error = %err,
                "Job failed"
              );
            }
          }
        }
        Ok(None) => {
          let retired = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
              (current > self.config.min_task_processors).then_some(current - 1)
            })
            .is_ok();
          if retired {
            tracing::debug!(queue = queue_name, event = "cleaning_worker", "Retiring idle worker");
            tracing::info!(queue = queue_name, event = "end", "Worker stopped");
            return;
          }
          tokio::time::sleep(self.config.check_timeout).await;
        }
        Err(err) => {
          tracing::error!(queue = queue_name, event = "error", error = %err, "Queue poll failed");
          tokio::time::sleep(self.config.check_timeout).await;
        }
      }
    }
    counter.fetch_sub(1, Ordering::SeqCst);
    tracing::info!(queue = queue_name, event = "end", "Worker stopped");
  }

  /// 把队列条目分发给对应的处理器，经断路器执行
  /// Dispatch the queue item to its handler, through the circuit breaker
  async fn handle(&self, item: &QueueItem) -> Result<()> {
    let Some(job_id) = item.args.get("jobId").and_then(Value::as_u64) else {
      tracing::error!(
        event = "internalError",
        args = %item.args,
        "Queue item carries no jobId"
      );
      return Err(Error::queue(format!("Queue item carries no jobId: {}", item.args)));
    };
    match item.class {
      JobName::StartDelayed => {
        let runner = self.periodic.clone();
        self
          .breaker
          .run(move || {
            let runner = runner.clone();
            async move { runner.run_periodic(job_id).await }
          })
          .await
      }
      JobName::StartFrozen => {
        let runner = self.frozen.clone();
        self
          .breaker
          .run(move || {
            let runner = runner.clone();
            async move { runner.run_frozen(job_id).await }
          })
          .await
      }
      other => {
        tracing::error!(
          event = "internalError",
          job = %other,
          "Unexpected job name on a scheduler queue"
        );
        Ok(())
      }
    }
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

  /// 按顺序收尾：工作者、主节点锁、队列客户端
  /// Tear down in order: workers, master lock, queue client
  pub async fn clean_up(&self) {
    self.shutdown();
    if self.is_master.load(Ordering::Relaxed) {
      let lock_key = keys::master_lock_key(&self.prefix);
      if let Err(err) = self.store.del(&lock_key).await {
        tracing::warn!(error = %err, "Could not release the master lock");
      }
    }
    if let Err(err) = self.queue.close().await {
      tracing::warn!(error = %err, "Could not close the queue client");
    }
  }
}

impl ComponentLifecycle for Scheduler {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Scheduler::start(self)
  }

  fn shutdown(&self) {
    Scheduler::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Scheduler::is_done(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memdb::MemoryBackend;
  use tokio::sync::Mutex;

  #[derive(Default)]
  struct RecordingRunner {
    periodic: Mutex<Vec<u64>>,
    frozen: Mutex<Vec<u64>>,
  }

  #[async_trait]
  impl PeriodicRunner for RecordingRunner {
    async fn run_periodic(&self, job_id: u64) -> Result<()> {
      self.periodic.lock().await.push(job_id);
      Ok(())
    }
  }

  #[async_trait]
  impl FrozenRunner for RecordingRunner {
    async fn run_frozen(&self, job_id: u64) -> Result<()> {
      self.frozen.lock().await.push(job_id);
      Ok(())
    }
  }

  fn scheduler_with_backend(
    backend: Arc<MemoryBackend>,
    runner: Arc<RecordingRunner>,
  ) -> Arc<Scheduler> {
    let config = SchedulerConfig::new().check_timeout(std::time::Duration::from_millis(20));
    Arc::new(
      Scheduler::new(
        backend.clone(),
        backend,
        runner.clone(),
        runner,
        config,
        "",
      )
      .unwrap(),
    )
  }

  #[tokio::test]
  async fn test_shutdown_flag() {
    let backend = Arc::new(MemoryBackend::new());
    let runner = Arc::new(RecordingRunner::default());
    let scheduler = scheduler_with_backend(backend, runner);
    assert!(!scheduler.is_done());
    scheduler.shutdown();
    assert!(scheduler.is_done());
  }

  #[tokio::test]
  async fn test_handle_rejects_items_without_job_id() {
    let backend = Arc::new(MemoryBackend::new());
    let runner = Arc::new(RecordingRunner::default());
    let scheduler = scheduler_with_backend(backend, runner);
    let item = QueueItem::new(PERIODIC_QUEUE, JobName::StartDelayed, serde_json::json!({}));
    assert!(scheduler.handle(&item).await.is_err());
  }
}
