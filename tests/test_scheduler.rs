//! 调度器的端到端场景，跑在内存后端上
//! End-to-end scheduler scenarios on the memory backend

use async_trait::async_trait;
use chrono::Utc;
use sdqueue::api::ApiClient;
use sdqueue::base::{DelayedQueue, JobName, QueueItem, Store};
use sdqueue::breaker::BreakerConfig;
use sdqueue::broker::{Admin, BrokerCore, PipelineFactory, PipelineInfo};
use sdqueue::components::scheduler::{FrozenRunner, PeriodicRunner, Scheduler};
use sdqueue::config::{BrokerConfig, SchedulerConfig};
use sdqueue::error::Result;
use sdqueue::memdb::MemoryBackend;
use sdqueue::redis::RedisConfig;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
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

struct StaticPipelineFactory;

#[async_trait]
impl PipelineFactory for StaticPipelineFactory {
  async fn get(&self, pipeline_id: u64) -> Result<Option<PipelineInfo>> {
    Ok(Some(PipelineInfo {
      id: pipeline_id,
      scm_context: "github:github.com".to_string(),
    }))
  }

  async fn first_admin(&self, _pipeline_id: u64) -> Result<Admin> {
    Ok(Admin {
      username: "sd-admin".to_string(),
    })
  }
}

fn fast_config() -> SchedulerConfig {
  SchedulerConfig::new().check_timeout(Duration::from_millis(20))
}

fn delayed_item(queue: &str, class: JobName, job_id: u64) -> QueueItem {
  QueueItem::new(queue, class, json!({ "jobId": job_id }))
}

#[tokio::test]
async fn test_scheduler_fires_matured_periodic_job() {
  let backend = Arc::new(MemoryBackend::new());
  let past = Utc::now() - chrono::Duration::minutes(1);
  backend
    .push_at(past, &delayed_item("periodicBuilds", JobName::StartDelayed, 1234))
    .await
    .unwrap();

  let runner = Arc::new(RecordingRunner::default());
  let scheduler = Arc::new(
    Scheduler::new(
      backend.clone(),
      backend.clone(),
      runner.clone(),
      runner.clone(),
      fast_config(),
      "",
    )
    .unwrap(),
  );
  let handle = scheduler.clone().start();

  tokio::time::sleep(Duration::from_millis(300)).await;
  scheduler.clean_up().await;
  handle.await.unwrap();

  assert_eq!(runner.periodic.lock().await.clone(), vec![1234]);
  assert!(runner.frozen.lock().await.is_empty());
  assert!(backend.delayed_entries().await.is_empty());
}

#[tokio::test]
async fn test_scheduler_fires_matured_frozen_job() {
  let backend = Arc::new(MemoryBackend::new());
  let past = Utc::now() - chrono::Duration::minutes(1);
  backend
    .push_at(past, &delayed_item("frozenBuilds", JobName::StartFrozen, 777))
    .await
    .unwrap();

  let runner = Arc::new(RecordingRunner::default());
  let scheduler = Arc::new(
    Scheduler::new(
      backend.clone(),
      backend.clone(),
      runner.clone(),
      runner.clone(),
      fast_config(),
      "",
    )
    .unwrap(),
  );
  let handle = scheduler.clone().start();

  tokio::time::sleep(Duration::from_millis(300)).await;
  scheduler.clean_up().await;
  handle.await.unwrap();

  assert_eq!(runner.frozen.lock().await.clone(), vec![777]);
  assert!(runner.periodic.lock().await.is_empty());
}

#[tokio::test]
async fn test_future_jobs_stay_delayed() {
  let backend = Arc::new(MemoryBackend::new());
  let future = Utc::now() + chrono::Duration::minutes(30);
  backend
    .push_at(future, &delayed_item("periodicBuilds", JobName::StartDelayed, 1234))
    .await
    .unwrap();

  let runner = Arc::new(RecordingRunner::default());
  let scheduler = Arc::new(
    Scheduler::new(
      backend.clone(),
      backend.clone(),
      runner.clone(),
      runner.clone(),
      fast_config(),
      "",
    )
    .unwrap(),
  );
  let handle = scheduler.clone().start();

  tokio::time::sleep(Duration::from_millis(200)).await;
  scheduler.clean_up().await;
  handle.await.unwrap();

  assert!(runner.periodic.lock().await.is_empty());
  assert_eq!(backend.delayed_entries().await.len(), 1);
}

#[tokio::test]
async fn test_two_schedulers_fire_job_exactly_once() {
  let backend = Arc::new(MemoryBackend::new());
  let past = Utc::now() - chrono::Duration::minutes(1);
  backend
    .push_at(past, &delayed_item("periodicBuilds", JobName::StartDelayed, 1234))
    .await
    .unwrap();

  let runner = Arc::new(RecordingRunner::default());
  let first = Arc::new(
    Scheduler::new(
      backend.clone(),
      backend.clone(),
      runner.clone(),
      runner.clone(),
      fast_config(),
      "",
    )
    .unwrap(),
  );
  let second = Arc::new(
    Scheduler::new(
      backend.clone(),
      backend.clone(),
      runner.clone(),
      runner.clone(),
      fast_config(),
      "",
    )
    .unwrap(),
  );
  let first_handle = first.clone().start();
  let second_handle = second.clone().start();

  tokio::time::sleep(Duration::from_millis(300)).await;
  first.clean_up().await;
  second.clean_up().await;
  first_handle.await.unwrap();
  second_handle.await.unwrap();

  // 主节点锁保证搬运只发生一次，弹出也只命中一次
  // The master lock makes the move happen once, and the pop hits once
  assert_eq!(runner.periodic.lock().await.clone(), vec![1234]);
}

#[tokio::test]
async fn test_matured_periodic_job_schedules_next_firing_via_broker() {
  let backend = Arc::new(MemoryBackend::new());

  let config = BrokerConfig::new(RedisConfig::new("127.0.0.1", 6379))
    .breaker(BreakerConfig::new().retries(0).retry_delay(Duration::ZERO));
  let broker = Arc::new(
    BrokerCore::with_backends(
      config,
      backend.clone(),
      backend.clone(),
      ApiClient::with_policy(1, Duration::ZERO),
      Arc::new(StaticPipelineFactory),
    )
    .unwrap(),
  );

  // 预置周期配置和一条已到期的延迟条目
  // Pre-seed the periodic config and one matured delayed entry
  let periodic_config = json!({
    "pipeline": {"id": 42, "scmContext": "github:github.com"},
    "job": {
      "id": 1234,
      "name": "main",
      "state": "ENABLED",
      "archived": false,
      "permutations": [{"annotations": {"screwdriver.cd/buildPeriodically": "H * * * *"}}]
    },
    "apiUri": "http://127.0.0.1:9",
    "isUpdate": false,
    "triggerBuild": false
  });
  backend
    .hset("periodicBuildConfigs", "1234", &periodic_config.to_string())
    .await
    .unwrap();
  let past = Utc::now() - chrono::Duration::minutes(1);
  backend
    .push_at(past, &delayed_item("periodicBuilds", JobName::StartDelayed, 1234))
    .await
    .unwrap();

  let scheduler = Arc::new(
    Scheduler::new(
      backend.clone(),
      backend.clone(),
      broker.clone(),
      broker.clone(),
      fast_config(),
      "",
    )
    .unwrap(),
  );
  let handle = scheduler.clone().start();

  tokio::time::sleep(Duration::from_millis(400)).await;
  scheduler.clean_up().await;
  handle.await.unwrap();

  // 事件发布失败被吞掉，但下一次触发已经排上
  // The failed event post is swallowed, yet the next firing is scheduled
  let delayed = backend.delayed_entries().await;
  assert_eq!(delayed.len(), 1);
  assert!(delayed[0].0 > Utc::now().timestamp_millis());
  assert_eq!(
    delayed[0].1,
    delayed_item("periodicBuilds", JobName::StartDelayed, 1234)
  );
}
