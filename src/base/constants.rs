use std::time::Duration;

/// 即时构建队列名称
/// Immediate build queue name
pub const BUILD_QUEUE: &str = "builds";

/// 周期构建延迟队列名称
/// Periodic build delay queue name
pub const PERIODIC_QUEUE: &str = "periodicBuilds";

/// 冻结构建延迟队列名称
/// Frozen build delay queue name
pub const FROZEN_QUEUE: &str = "frozenBuilds";

/// 构建配置哈希表名称
pub const BUILD_CONFIGS: &str = "buildConfigs";
pub const PERIODIC_BUILD_CONFIGS: &str = "periodicBuildConfigs";
pub const FROZEN_BUILD_CONFIGS: &str = "frozenBuildConfigs";
pub const TIMEOUT_CONFIGS: &str = "timeoutConfigs";

/// 中止标记的生存时间
/// Time-to-live of the abort marker
pub const ABORT_MARKER_TTL: Duration = Duration::from_secs(1800);

/// 默认构建超时（分钟）
/// Default build timeout in minutes
pub const DEFAULT_BUILD_TIMEOUT_MINUTES: i64 = 90;

/// 外呼重试次数与固定间隔
/// Outbound retry count and fixed delay
pub const RETRY_LIMIT: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// 强制启动标记，出现在 causeMessage 中时跳过冻结窗口
/// Force-start marker, skips the freeze window when present in causeMessage
pub const FORCE_START_MARKER: &str = "[force start]";

/// 周期构建 cron 所在的注解键
/// Annotation key carrying the periodic-build cron
pub const BUILD_PERIODICALLY_ANNOTATION: &str = "screwdriver.cd/buildPeriodically";

/// 构建超时所在的注解键
/// Annotation key carrying the build timeout
pub const TIMEOUT_ANNOTATION: &str = "screwdriver.cd/timeout";

/// 版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_constants() {
    assert_eq!(BUILD_QUEUE, "builds");
    assert_eq!(PERIODIC_QUEUE, "periodicBuilds");
    assert_eq!(FROZEN_QUEUE, "frozenBuilds");
    assert_eq!(ABORT_MARKER_TTL, Duration::from_secs(1800));
    assert_eq!(DEFAULT_BUILD_TIMEOUT_MINUTES, 90);
  }
}
