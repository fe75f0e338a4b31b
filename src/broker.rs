//! 经纪人核心模块
//! Broker core module
//!
//! 实现对外的命令契约：start、stop、startPeriodic、stopPeriodic、
//! startFrozen、stopFrozen、startTimer、stopTimer 与 stats。命令把生命周期
//! 请求变成共享队列上持久、有序的工作条目，并维护周期与冻结两类延迟调度
//! Implements the externally visible command contract: start, stop,
//! startPeriodic, stopPeriodic, startFrozen, stopFrozen, startTimer,
//! stopTimer and stats. Commands turn lifecycle requests into durable,
//! ordered work items on the shared queue and maintain the periodic and
//! frozen delayed schedules

use crate::api::{ApiClient, Creator, EventRequest};
use crate::base::constants::{
  ABORT_MARKER_TTL, BUILD_PERIODICALLY_ANNOTATION, BUILD_QUEUE, DEFAULT_BUILD_TIMEOUT_MINUTES,
  FORCE_START_MARKER, FROZEN_QUEUE, PERIODIC_QUEUE, TIMEOUT_ANNOTATION,
};
use crate::base::{keys, BuildStatus, DelayedQueue, JobName, JobState, QueueItem, Store};
use crate::breaker::{BreakerStats, CircuitBreaker};
use crate::components::scheduler::{FrozenRunner, PeriodicRunner};
use crate::config::{BrokerConfig, TokenGenFn};
use crate::error::{Error, Result};
use crate::rdb::{RedisQueue, RedisStore};
use crate::{cron, freeze};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// 流水线概要
/// Pipeline summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
  pub id: u64,
  #[serde(default)]
  pub scm_context: String,
  #[serde(flatten)]
  pub rest: serde_json::Map<String, Value>,
}

/// 任务概要
/// Job summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
  pub id: u64,
  pub name: String,
  #[serde(default)]
  pub state: JobState,
  #[serde(default)]
  pub archived: bool,
  #[serde(default)]
  pub permutations: Vec<Permutation>,
  #[serde(flatten)]
  pub rest: serde_json::Map<String, Value>,
}

/// 任务的一个排列，注解都挂在这里
/// One permutation of a job, annotations live here
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Permutation {
  #[serde(default)]
  pub annotations: serde_json::Map<String, Value>,
  #[serde(flatten)]
  pub rest: serde_json::Map<String, Value>,
}

/// 构建附带信息，经纪人只认识 stats，其余字段原样透传
/// Build payload; the broker only interprets stats, the rest passes through
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BuildInfo {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stats: Option<Value>,
  #[serde(flatten)]
  pub rest: serde_json::Map<String, Value>,
}

/// start 命令配置，同时也是存进哈希表的 BuildConfig
/// start command configuration, also the BuildConfig stored in the hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConfig {
  pub build_id: u64,
  pub job_id: u64,
  #[serde(default)]
  pub blocked_by: Vec<u64>,
  #[serde(default)]
  pub freeze_windows: Vec<String>,
  #[serde(default)]
  pub job_state: JobState,
  #[serde(default)]
  pub job_archived: bool,
  #[serde(default)]
  pub cause_message: String,
  pub token: String,
  pub api_uri: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub job_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pipeline: Option<PipelineSummary>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub container: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub enqueue_time: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub build: Option<BuildInfo>,
  #[serde(flatten)]
  pub rest: serde_json::Map<String, Value>,
}

/// stop 命令配置
/// stop command configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopConfig {
  pub build_id: u64,
  pub job_id: u64,
  #[serde(default)]
  pub blocked_by: Vec<u64>,
}

/// startPeriodic 命令配置，同时也是存进哈希表的 PeriodicConfig
/// startPeriodic command configuration, also the PeriodicConfig stored in
/// the hash
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicConfig {
  pub pipeline: PipelineSummary,
  pub job: JobSummary,
  pub api_uri: String,
  #[serde(default)]
  pub is_update: bool,
  #[serde(default)]
  pub trigger_build: bool,
  /// 首次调用时被经纪人捕获缓存，不参与序列化
  /// Captured and cached by the broker on first call, never serialized
  #[serde(skip)]
  pub token_gen: Option<TokenGenFn>,
  #[serde(flatten)]
  pub rest: serde_json::Map<String, Value>,
}

impl PeriodicConfig {
  /// 任务第一个排列上的周期构建注解
  /// The periodic-build annotation on the job's first permutation
  pub fn build_cron(&self) -> Option<&str> {
    self
      .job
      .permutations
      .first()?
      .annotations
      .get(BUILD_PERIODICALLY_ANNOTATION)?
      .as_str()
  }
}

// Manual Debug implementation because the token generator is an opaque Fn.
impl std::fmt::Debug for PeriodicConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PeriodicConfig")
      .field("pipeline", &self.pipeline)
      .field("job", &self.job)
      .field("api_uri", &self.api_uri)
      .field("is_update", &self.is_update)
      .field("trigger_build", &self.trigger_build)
      .field("token_gen", &self.token_gen.as_ref().map(|_| "<fn>"))
      .finish()
  }
}

/// startTimer 命令配置
/// startTimer command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerConfig {
  pub build_id: u64,
  pub job_id: u64,
  pub build_status: BuildStatus,
  pub start_time: DateTime<Utc>,
  #[serde(default)]
  pub annotations: serde_json::Map<String, Value>,
}

/// 超时登记条目
/// Timeout registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutEntry {
  pub job_id: u64,
  pub start_time: DateTime<Utc>,
  pub timeout: i64,
}

/// 流水线信息
/// Pipeline information
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineInfo {
  pub id: u64,
  pub scm_context: String,
}

/// 流水线管理员
/// Pipeline admin
#[derive(Debug, Clone, PartialEq)]
pub struct Admin {
  pub username: String,
}

/// 流水线工厂：把流水线标识解析成 scmContext 和首位管理员
/// Pipeline factory: resolves a pipeline id into its scmContext and first
/// admin
#[async_trait]
pub trait PipelineFactory: Send + Sync {
  /// 查询流水线，不存在时返回 None
  /// Look up a pipeline, None when it does not exist
  async fn get(&self, pipeline_id: u64) -> Result<Option<PipelineInfo>>;

  /// 查询流水线的首位管理员
  /// Look up the pipeline's first admin
  async fn first_admin(&self, pipeline_id: u64) -> Result<Admin>;
}

fn periodic_item(job_id: u64) -> QueueItem {
  QueueItem::new(PERIODIC_QUEUE, JobName::StartDelayed, json!({ "jobId": job_id }))
}

fn frozen_item(job_id: u64) -> QueueItem {
  QueueItem::new(FROZEN_QUEUE, JobName::StartFrozen, json!({ "jobId": job_id }))
}

fn csv(ids: &[u64]) -> String {
  ids
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join(",")
}

/// 经纪人核心
/// Broker core
pub struct BrokerCore {
  prefix: String,
  store: Arc<dyn Store>,
  queue: Arc<dyn DelayedQueue>,
  store_breaker: CircuitBreaker,
  queue_breaker: CircuitBreaker,
  api: ApiClient,
  pipeline_factory: Arc<dyn PipelineFactory>,
  token_gen: OnceLock<TokenGenFn>,
}

impl BrokerCore {
  /// 以 Redis 后端创建经纪人
  /// Create the broker with Redis backends
  pub fn new(config: BrokerConfig, pipeline_factory: Arc<dyn PipelineFactory>) -> Result<Self> {
    let store: Arc<dyn Store> = Arc::new(RedisStore::new(&config.redis)?);
    let queue: Arc<dyn DelayedQueue> = Arc::new(RedisQueue::new(&config.redis, &config.prefix)?);
    Self::with_backends(config, store, queue, ApiClient::new(), pipeline_factory)
  }

  /// 以任意后端创建经纪人，内存后端也经由这里接入
  /// Create the broker with arbitrary backends; the memory backend plugs in
  /// through here as well
  pub fn with_backends(
    config: BrokerConfig,
    store: Arc<dyn Store>,
    queue: Arc<dyn DelayedQueue>,
    api: ApiClient,
    pipeline_factory: Arc<dyn PipelineFactory>,
  ) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      prefix: config.prefix.clone(),
      store,
      queue,
      store_breaker: CircuitBreaker::new(config.breaker.clone()),
      queue_breaker: CircuitBreaker::new(config.breaker),
      api,
      pipeline_factory,
      token_gen: OnceLock::new(),
    })
  }

  /// 存储客户端
  /// The store client
  pub fn store(&self) -> Arc<dyn Store> {
    self.store.clone()
  }

  /// 队列客户端
  /// The queue client
  pub fn queue(&self) -> Arc<dyn DelayedQueue> {
    self.queue.clone()
  }

  /// 队列断路器的统计快照
  /// Statistics snapshot of the queue breaker
  pub fn stats(&self) -> BreakerStats {
    self.queue_breaker.stats()
  }

  /// 仅在尚未连接时建立连接
  /// Connect only when not yet connected
  async fn ensure_connected(&self) -> Result<()> {
    if !self.store.connected() {
      self.store.connect().await?;
    }
    if !self.queue.connected() {
      self.queue.connect().await?;
    }
    Ok(())
  }

  /// 入队一个立即构建
  /// Enqueue an immediate build
  ///
  /// 落在冻结窗口内且没有强制启动标记时，构建改道到窗口之外的时间点
  /// A build inside a freeze window without the force-start marker is
  /// rerouted to an instant outside the window
  pub async fn start(&self, cfg: StartConfig) -> Result<()> {
    self.ensure_connected().await?;

    // 同一任务遗留的冻结条目先清掉
    // Stale frozen entries of the same job are dropped first
    self.stop_frozen(cfg.job_id).await?;

    if cfg.job_state == JobState::Disabled || cfg.job_archived {
      tracing::info!(
        job_id = cfg.job_id,
        build_id = cfg.build_id,
        "Skipping start, job is disabled or archived"
      );
      return Ok(());
    }

    let now = Utc::now();
    let out_of_windows = freeze::time_out_of_windows(&cfg.freeze_windows, now)?;
    let force_start = cfg.cause_message.contains(FORCE_START_MARKER);

    if out_of_windows > now && !force_start {
      self.enqueue_frozen(cfg, out_of_windows).await
    } else {
      self.enqueue_ready(cfg, now).await
    }
  }

  async fn enqueue_frozen(&self, cfg: StartConfig, wake_at: DateTime<Utc>) -> Result<()> {
    let message = format!(
      "Blocked by freeze window, re-enqueued to {}",
      wake_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    if let Err(err) = self
      .api
      .update_build_status(&cfg.api_uri, cfg.build_id, &cfg.token, BuildStatus::Frozen, &message)
      .await
    {
      tracing::error!(
        build_id = cfg.build_id,
        error = %err,
        "Failed to update build status to FROZEN"
      );
    }

    // 同一任务只保留一份冻结条目
    // At most one frozen entry per job
    self.queue_remove_delayed(frozen_item(cfg.job_id)).await?;
    self
      .store_hset(
        keys::frozen_build_configs_key(&self.prefix),
        cfg.job_id.to_string(),
        serde_json::to_string(&cfg)?,
      )
      .await?;
    match self.queue_push_at(wake_at, frozen_item(cfg.job_id)).await {
      Ok(()) | Err(Error::DuplicateScheduled) => {
        tracing::info!(
          job_id = cfg.job_id,
          build_id = cfg.build_id,
          wake_at = %wake_at,
          "Build frozen and re-enqueued"
        );
        Ok(())
      }
      Err(err) => Err(err),
    }
  }

  async fn enqueue_ready(&self, mut cfg: StartConfig, now: DateTime<Utc>) -> Result<()> {
    cfg.enqueue_time = Some(now);
    self
      .store_hset(
        keys::build_configs_key(&self.prefix),
        cfg.build_id.to_string(),
        serde_json::to_string(&cfg)?,
      )
      .await?;
    let args = json!({
      "buildId": cfg.build_id,
      "jobId": cfg.job_id,
      "blockedBy": csv(&cfg.blocked_by),
    });
    self
      .queue_push(QueueItem::new(BUILD_QUEUE, JobName::Start, args))
      .await?;

    // 向后兼容：已有 stats 的构建补记入队时间
    // Backward compatibility: builds carrying stats get the queue enter time
    if let Some(stats) = cfg.build.as_mut().and_then(|build| build.stats.as_mut()) {
      if let Some(map) = stats.as_object_mut() {
        map.insert(
          "queueEnterTime".to_string(),
          json!(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
      }
      if let Err(err) = self
        .api
        .update_build_stats(&cfg.api_uri, cfg.build_id, &cfg.token, stats)
        .await
      {
        tracing::error!(
          build_id = cfg.build_id,
          error = %err,
          "Failed to persist build stats"
        );
      }
    }
    Ok(())
  }

  /// 取消或请求停止一个构建
  /// Cancel a build or request its stop
  ///
  /// 不论构建是否还在队列里都会入队一个 stop 条目；工作者用 started 判断
  /// 是否需要调用真正的执行器
  /// A stop item is enqueued regardless of whether the build is still
  /// queued; workers use started to decide whether the real executor must be
  /// called
  pub async fn stop(&self, cfg: StopConfig) -> Result<()> {
    self.ensure_connected().await?;

    let blocked_by = csv(&cfg.blocked_by);
    let start_args = json!({
      "buildId": cfg.build_id,
      "jobId": cfg.job_id,
      "blockedBy": blocked_by,
    });
    let num_deleted = self
      .queue_remove(QueueItem::new(BUILD_QUEUE, JobName::Start, start_args))
      .await?;

    let marker = keys::abort_marker_key(&self.prefix, cfg.job_id, cfg.build_id);
    self.store_set(marker.clone(), String::new()).await?;
    self.store_expire(marker, ABORT_MARKER_TTL).await?;

    let started = num_deleted == 0;
    let stop_args = json!({
      "buildId": cfg.build_id,
      "jobId": cfg.job_id,
      "blockedBy": blocked_by,
      "started": started,
    });
    self
      .queue_push(QueueItem::new(BUILD_QUEUE, JobName::Stop, stop_args))
      .await?;
    Ok(())
  }

  /// 登记或触发一个周期构建
  /// Register or fire a periodic build
  pub async fn start_periodic(&self, cfg: PeriodicConfig) -> Result<()> {
    self.ensure_connected().await?;

    if let Some(token_gen) = cfg.token_gen.clone() {
      // 只捕获第一份，之后的调用不允许静默替换
      // Only the first one is captured; later calls may not silently
      // replace it
      let _ = self.token_gen.set(token_gen);
    }

    if cfg.is_update {
      self.stop_periodic(cfg.job.id).await?;
    }

    if cfg.trigger_build {
      if let Err(err) = self
        .post_build_event(
          cfg.pipeline.id,
          &cfg.job.name,
          &cfg.api_uri,
          "Started by periodic build scheduler",
          None,
          None,
        )
        .await
      {
        tracing::error!(
          job_id = cfg.job.id,
          pipeline_id = cfg.pipeline.id,
          error = %err,
          "Failed to post periodic build event"
        );
      }
    }

    let Some(build_cron) = cfg.build_cron().map(str::to_string) else {
      return Ok(());
    };
    if cfg.job.state != JobState::Enabled || cfg.job.archived {
      return Ok(());
    }

    let transformed = cron::transform(&build_cron, &cfg.job.id.to_string())?;
    let next = cron::next(&transformed, Utc::now())?;

    let mut stored = cfg.clone();
    stored.is_update = false;
    stored.trigger_build = false;
    stored.token_gen = None;
    self
      .store_hset(
        keys::periodic_build_configs_key(&self.prefix),
        cfg.job.id.to_string(),
        serde_json::to_string(&stored)?,
      )
      .await?;

    // 重复调度就是去重成功；其他失败再经断路器试一次，仍失败则只记日志
    // A duplicate schedule is successful de-duplication; any other failure
    // gets one more breaker-wrapped try, then is logged and dropped
    match self.queue_push_at(next, periodic_item(cfg.job.id)).await {
      Ok(()) | Err(Error::DuplicateScheduled) => Ok(()),
      Err(err) => {
        tracing::warn!(
          job_id = cfg.job.id,
          error = %err,
          "Delayed enqueue failed, retrying once"
        );
        match self.queue_push_at(next, periodic_item(cfg.job.id)).await {
          Ok(()) | Err(Error::DuplicateScheduled) => Ok(()),
          Err(err) => {
            tracing::error!(
              job_id = cfg.job.id,
              error = %err,
              "Could not re-enqueue periodic build"
            );
            Ok(())
          }
        }
      }
    }
  }

  /// 注销一个周期构建
  /// Deregister a periodic build
  pub async fn stop_periodic(&self, job_id: u64) -> Result<()> {
    self.ensure_connected().await?;
    self.queue_remove_delayed(periodic_item(job_id)).await?;
    self
      .store_hdel(
        keys::periodic_build_configs_key(&self.prefix),
        job_id.to_string(),
      )
      .await?;
    Ok(())
  }

  /// 触发一个冻结到期的构建，由调度器调用
  /// Fire a matured frozen build, invoked by the scheduler
  pub async fn start_frozen(&self, cfg: StartConfig) -> Result<()> {
    if cfg.job_state == JobState::Disabled || cfg.job_archived {
      tracing::info!(
        job_id = cfg.job_id,
        "Skipping frozen start, job is disabled or archived"
      );
      return Ok(());
    }
    let Some(pipeline) = cfg.pipeline.as_ref() else {
      tracing::warn!(job_id = cfg.job_id, "Frozen config carries no pipeline, dropping");
      return Ok(());
    };
    let Some(job_name) = cfg.job_name.as_deref() else {
      tracing::warn!(job_id = cfg.job_id, "Frozen config carries no job name, dropping");
      return Ok(());
    };
    if let Err(err) = self
      .post_build_event(
        pipeline.id,
        job_name,
        &cfg.api_uri,
        "Started by freeze window scheduler",
        None,
        Some(cfg.build_id),
      )
      .await
    {
      tracing::error!(
        job_id = cfg.job_id,
        pipeline_id = pipeline.id,
        error = %err,
        "Failed to post frozen build event"
      );
    }
    Ok(())
  }

  /// 丢弃一个冻结构建
  /// Drop a frozen build
  pub async fn stop_frozen(&self, job_id: u64) -> Result<()> {
    self.ensure_connected().await?;
    self.queue_remove_delayed(frozen_item(job_id)).await?;
    self
      .store_hdel(
        keys::frozen_build_configs_key(&self.prefix),
        job_id.to_string(),
      )
      .await?;
    Ok(())
  }

  /// 登记一个运行中构建的最长时限
  /// Register the maximum runtime of a running build
  ///
  /// 尽力而为的簿记：所有错误只记日志
  /// Best-effort bookkeeping: every error is only logged
  pub async fn start_timer(&self, cfg: TimerConfig) -> Result<()> {
    if cfg.build_status != BuildStatus::Running {
      return Ok(());
    }
    if let Err(err) = self.try_start_timer(&cfg).await {
      tracing::error!(
        build_id = cfg.build_id,
        error = %err,
        "Failed to register build timeout"
      );
    }
    Ok(())
  }

  async fn try_start_timer(&self, cfg: &TimerConfig) -> Result<()> {
    self.ensure_connected().await?;
    let key = keys::timeout_configs_key(&self.prefix);
    let existing = self.store_hget(key.clone(), cfg.build_id.to_string()).await?;
    if existing.is_some() {
      // 已登记过就不再覆盖
      // An existing entry is never overwritten
      return Ok(());
    }
    let timeout = cfg
      .annotations
      .get(TIMEOUT_ANNOTATION)
      .and_then(Value::as_i64)
      .unwrap_or(DEFAULT_BUILD_TIMEOUT_MINUTES);
    let entry = TimeoutEntry {
      job_id: cfg.job_id,
      start_time: cfg.start_time,
      timeout,
    };
    self
      .store_hset(key, cfg.build_id.to_string(), serde_json::to_string(&entry)?)
      .await
  }

  /// 注销一个构建的时限登记
  /// Deregister a build's timeout entry
  pub async fn stop_timer(&self, build_id: u64) -> Result<()> {
    if let Err(err) = self.try_stop_timer(build_id).await {
      tracing::error!(build_id, error = %err, "Failed to deregister build timeout");
    }
    Ok(())
  }

  async fn try_stop_timer(&self, build_id: u64) -> Result<()> {
    self.ensure_connected().await?;
    let key = keys::timeout_configs_key(&self.prefix);
    if self.store_hget(key.clone(), build_id.to_string()).await?.is_none() {
      return Ok(());
    }
    self.store_hdel(key, build_id.to_string()).await?;
    Ok(())
  }

  /// 以流水线管理员身份发布构建事件
  /// Post a build event as the pipeline admin
  async fn post_build_event(
    &self,
    pipeline_id: u64,
    start_from: &str,
    api_uri: &str,
    cause_message: &str,
    parent_event_id: Option<u64>,
    build_id: Option<u64>,
  ) -> Result<()> {
    let token_gen = self
      .token_gen
      .get()
      .ok_or_else(|| Error::config("Token generator has not been initialized"))?;
    let pipeline = self
      .pipeline_factory
      .get(pipeline_id)
      .await?
      .ok_or_else(|| Error::api(format!("Pipeline {pipeline_id} not found")))?;
    let admin = self.pipeline_factory.first_admin(pipeline_id).await?;
    let token = token_gen(&admin.username, &pipeline.scm_context);
    let event = EventRequest {
      pipeline_id,
      start_from: start_from.to_string(),
      creator: Creator::default(),
      cause_message: Some(cause_message.to_string()),
      parent_event_id,
      build_id,
    };
    self.api.post_event(api_uri, &token, &event).await
  }

  // 断路器包装的小助手；闭包每次调用都克隆自己的输入
  // Breaker-wrapped helpers; the closure clones its inputs on every call

  async fn store_hset(&self, key: String, field: String, value: String) -> Result<()> {
    let store = self.store.clone();
    self
      .store_breaker
      .run(move || {
        let store = store.clone();
        let key = key.clone();
        let field = field.clone();
        let value = value.clone();
        async move { store.hset(&key, &field, &value).await }
      })
      .await
  }

  async fn store_hget(&self, key: String, field: String) -> Result<Option<String>> {
    let store = self.store.clone();
    self
      .store_breaker
      .run(move || {
        let store = store.clone();
        let key = key.clone();
        let field = field.clone();
        async move { store.hget(&key, &field).await }
      })
      .await
  }

  async fn store_hdel(&self, key: String, field: String) -> Result<bool> {
    let store = self.store.clone();
    self
      .store_breaker
      .run(move || {
        let store = store.clone();
        let key = key.clone();
        let field = field.clone();
        async move { store.hdel(&key, &field).await }
      })
      .await
  }

  async fn store_set(&self, key: String, value: String) -> Result<()> {
    let store = self.store.clone();
    self
      .store_breaker
      .run(move || {
        let store = store.clone();
        let key = key.clone();
        let value = value.clone();
        async move { store.set(&key, &value).await }
      })
      .await
  }

  async fn store_expire(&self, key: String, ttl: Duration) -> Result<()> {
    let store = self.store.clone();
    self
      .store_breaker
      .run(move || {
        let store = store.clone();
        let key = key.clone();
        async move { store.expire(&key, ttl).await }
      })
      .await
  }

  async fn queue_push(&self, item: QueueItem) -> Result<()> {
    let queue = self.queue.clone();
    self
      .queue_breaker
      .run(move || {
        let queue = queue.clone();
        let item = item.clone();
        async move { queue.push(&item).await }
      })
      .await
  }

  async fn queue_push_at(&self, at: DateTime<Utc>, item: QueueItem) -> Result<()> {
    let queue = self.queue.clone();
    self
      .queue_breaker
      .run(move || {
        let queue = queue.clone();
        let item = item.clone();
        async move { queue.push_at(at, &item).await }
      })
      .await
  }

  async fn queue_remove(&self, item: QueueItem) -> Result<u64> {
    let queue = self.queue.clone();
    self
      .queue_breaker
      .run(move || {
        let queue = queue.clone();
        let item = item.clone();
        async move { queue.remove(&item).await }
      })
      .await
  }

  async fn queue_remove_delayed(&self, item: QueueItem) -> Result<u64> {
    let queue = self.queue.clone();
    self
      .queue_breaker
      .run(move || {
        let queue = queue.clone();
        let item = item.clone();
        async move { queue.remove_delayed(&item).await }
      })
      .await
  }
}

#[async_trait]
impl PeriodicRunner for BrokerCore {
  /// 周期构建到期：读回配置，带 triggerBuild 重新走 startPeriodic，
  /// 既发布事件也排下一次触发
  /// A periodic build matured: read the config back and rerun startPeriodic
  /// with triggerBuild, which both posts the event and schedules the next
  /// firing
  async fn run_periodic(&self, job_id: u64) -> Result<()> {
    self.ensure_connected().await?;
    let raw = self
      .store_hget(
        keys::periodic_build_configs_key(&self.prefix),
        job_id.to_string(),
      )
      .await?;
    let Some(raw) = raw else {
      tracing::warn!(job_id, "No periodic build config found, dropping job");
      return Ok(());
    };
    let mut cfg: PeriodicConfig = serde_json::from_str(&raw)?;
    cfg.trigger_build = true;
    cfg.is_update = false;
    self.start_periodic(cfg).await
  }
}

#[async_trait]
impl FrozenRunner for BrokerCore {
  /// 冻结构建到期：读回配置并发布事件
  /// A frozen build matured: read the config back and post the event
  async fn run_frozen(&self, job_id: u64) -> Result<()> {
    self.ensure_connected().await?;
    let raw = self
      .store_hget(
        keys::frozen_build_configs_key(&self.prefix),
        job_id.to_string(),
      )
      .await?;
    let Some(raw) = raw else {
      tracing::warn!(job_id, "No frozen build config found, dropping job");
      return Ok(());
    };
    let cfg: StartConfig = serde_json::from_str(&raw)?;
    self.start_frozen(cfg).await
  }
}
