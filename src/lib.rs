//! # sdqueue
//!
//! Screwdriver 构建队列经纪人
//! Build-queue broker for Screwdriver
//!
//! sdqueue 位于控制面 API 和下游构建执行工作者之间：它接收构建的生命周期
//! 命令，把它们变成共享 Redis 队列上持久、有序的工作条目，并运行把延迟
//! 与周期工作按时重新注入队列的调度器。
//! sdqueue sits between the control-plane API and the pool of downstream
//! build-executor workers: it accepts build lifecycle commands, turns them
//! into durable, ordered work items on a shared Redis-backed queue, and
//! runs the schedulers that reinject delayed and periodic work back into
//! the queue when it is due.
//!
//! ## 特性
//! ## Features
//!
//! - 至少一次投递，队列键上显式去重
//!   - At-least-once delivery with explicit de-duplication on queue keys
//! - 三个调度子队列：即时构建、周期构建、冻结构建
//!   - Three scheduled sub-queues: immediate, periodic and frozen builds
//! - 带 `H` 占位符的哈希 cron，把周期负载确定性地摊开
//!   - Hashed cron with the `H` placeholder, spreading periodic load
//!     deterministically
//! - 冻结窗口闸门，把窗口内的构建改道到未来的时间点
//!   - Freeze-window gate rerouting in-window builds to a future instant
//! - 构建超时登记与清理
//!   - Build timeout registry and enforcement
//! - 断路器包住对存储、队列和控制面 API 的所有外呼
//!   - Circuit breakers around every outbound call to the store, the queue
//!     and the control-plane API
//! - 内存后端，无外部服务即可本地运行和测试
//!   - Memory backend for local runs and tests without external services
//!
//! ## 快速开始
//! ## Quick Start
//!
//! ```rust,no_run
//! use sdqueue::broker::{Admin, BrokerCore, PipelineFactory, PipelineInfo, StopConfig};
//! use sdqueue::config::BrokerConfig;
//! use sdqueue::error::Result;
//! use sdqueue::redis::RedisConfig;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct ApiPipelineFactory;
//!
//! #[async_trait]
//! impl PipelineFactory for ApiPipelineFactory {
//!   async fn get(&self, pipeline_id: u64) -> Result<Option<PipelineInfo>> {
//!     Ok(Some(PipelineInfo {
//!       id: pipeline_id,
//!       scm_context: "github:github.com".to_string(),
//!     }))
//!   }
//!
//!   async fn first_admin(&self, _pipeline_id: u64) -> Result<Admin> {
//!     Ok(Admin {
//!       username: "sd-admin".to_string(),
//!     })
//!   }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let redis = RedisConfig::from_url("redis://127.0.0.1:6379")?;
//!   let config = BrokerConfig::new(redis).prefix("sd:");
//!   let broker = BrokerCore::new(config, Arc::new(ApiPipelineFactory))?;
//!
//!   broker
//!     .stop(StopConfig {
//!       build_id: 8609,
//!       job_id: 777,
//!       blocked_by: vec![777],
//!     })
//!     .await?;
//!   Ok(())
//! }
//! ```

pub mod api;
pub mod base;
pub mod breaker;
pub mod broker;
pub mod components;
pub mod config;
pub mod cron;
pub mod error;
pub mod freeze;
pub mod memdb;
pub mod rdb;
pub mod redis;
