//! 存储键名生成
//! Store key name generation
//!
//! 所有键都带可配置前缀，便于多套部署共用一个 Redis
//! Every key carries the configurable prefix so multiple deployments can
//! share one Redis

use crate::base::constants;

/// 构建配置哈希键
/// Build config hash key
pub fn build_configs_key(prefix: &str) -> String {
  format!("{}{}", prefix, constants::BUILD_CONFIGS)
}

/// 周期构建配置哈希键
/// Periodic build config hash key
pub fn periodic_build_configs_key(prefix: &str) -> String {
  format!("{}{}", prefix, constants::PERIODIC_BUILD_CONFIGS)
}

/// 冻结构建配置哈希键
/// Frozen build config hash key
pub fn frozen_build_configs_key(prefix: &str) -> String {
  format!("{}{}", prefix, constants::FROZEN_BUILD_CONFIGS)
}

/// 构建超时登记哈希键
/// Build timeout registry hash key
pub fn timeout_configs_key(prefix: &str) -> String {
  format!("{}{}", prefix, constants::TIMEOUT_CONFIGS)
}

/// 中止标记键，记录构建尚在队列中时收到的停止请求
/// Abort marker key, records a stop requested while the build was still queued
pub fn abort_marker_key(prefix: &str, job_id: u64, build_id: u64) -> String {
  format!("{prefix}deleted_{job_id}_{build_id}")
}

/// 就绪队列键
/// Ready queue key
pub fn queue_key(prefix: &str, queue: &str) -> String {
  format!("{prefix}queue:{queue}")
}

/// 就绪队列键前缀（供 Lua 脚本拼接）
/// Ready queue key prefix (for Lua script concatenation)
pub fn queue_key_prefix(prefix: &str) -> String {
  format!("{prefix}queue:")
}

/// 某个时间戳的延迟列表键
/// Delayed list key for one timestamp
pub fn delayed_key(prefix: &str, timestamp_ms: i64) -> String {
  format!("{prefix}delayed:{timestamp_ms}")
}

/// 延迟列表键前缀（供 Lua 脚本拼接）
/// Delayed list key prefix (for Lua script concatenation)
pub fn delayed_key_prefix(prefix: &str) -> String {
  format!("{prefix}delayed:")
}

/// 待到期时间戳的有序集合键
/// Sorted set key of pending timestamps
pub fn delayed_schedule_key(prefix: &str) -> String {
  format!("{prefix}delayed_queue_schedule")
}

/// 记录某个条目被调度到哪些时间戳的集合键
/// Set key recording which timestamps one item is scheduled at
pub fn timestamps_key(prefix: &str, encoded_item: &str) -> String {
  format!("{prefix}timestamps:{encoded_item}")
}

/// 时间戳集合键前缀（供 Lua 脚本拼接）
/// Timestamps set key prefix (for Lua script concatenation)
pub fn timestamps_key_prefix(prefix: &str) -> String {
  format!("{prefix}timestamps:")
}

/// 调度器主节点锁键
/// Scheduler master lock key
pub fn master_lock_key(prefix: &str) -> String {
  format!("{prefix}scheduler_master_lock")
}
