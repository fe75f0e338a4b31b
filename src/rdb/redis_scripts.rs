//! Redis Lua 脚本模块
//!
//! 延迟队列的三个组合操作必须原子执行，这里以 Lua 脚本实现，
//! 并通过 ScriptManager 缓存脚本 SHA
//! The three compound operations of the delayed queue must execute
//! atomically; they are implemented as Lua scripts here, with the
//! ScriptManager caching the script SHAs

use crate::error::{Error, Result};
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::sync::Mutex;

/// Redis Lua 脚本集合
/// Redis Lua script collection
pub mod scripts {
  /// 延迟入队脚本：同一条目同一时间戳只允许一份
  /// Delayed enqueue script: one copy per item per timestamp
  /// `KEYS[1]` -> 条目时间戳集合 / timestamps set of the item
  /// `KEYS[2]` -> 该时间戳的延迟列表 / delayed list for the timestamp
  /// `KEYS[3]` -> 待到期时间戳有序集合 / sorted set of pending timestamps
  /// `ARGV[1]` -> 编码后的条目 / encoded item
  /// `ARGV[2]` -> 毫秒时间戳 / millisecond timestamp
  /// 返回值：1=成功，0=重复 / Returns: 1 on success, 0 on duplicate
  pub const PUSH_AT: &str = r#"
        if redis.call("SISMEMBER", KEYS[1], ARGV[2]) == 1 then
            return 0
        end
        redis.call("RPUSH", KEYS[2], ARGV[1])
        redis.call("SADD", KEYS[1], ARGV[2])
        redis.call("ZADD", KEYS[3], ARGV[2], ARGV[2])
        return 1
    "#;

  /// 删除延迟条目脚本：沿条目的时间戳集合逐个清除
  /// Delayed delete script: walks the item's timestamps set
  /// `KEYS[1]` -> 条目时间戳集合 / timestamps set of the item
  /// `KEYS[2]` -> 待到期时间戳有序集合 / sorted set of pending timestamps
  /// `ARGV[1]` -> 编码后的条目 / encoded item
  /// `ARGV[2]` -> 延迟列表键前缀 / delayed list key prefix
  /// 返回删除数量 / Returns the removed count
  pub const REMOVE_DELAYED: &str = r#"
        local removed = 0
        local stamps = redis.call("SMEMBERS", KEYS[1])
        for _, ts in ipairs(stamps) do
            local dkey = ARGV[2] .. ts
            removed = removed + redis.call("LREM", dkey, 0, ARGV[1])
            if redis.call("LLEN", dkey) == 0 then
                redis.call("DEL", dkey)
                redis.call("ZREM", KEYS[2], ts)
            end
        end
        redis.call("DEL", KEYS[1])
        return removed
    "#;

  /// 搬运到期条目脚本：把所有已到期时间戳的条目移入各自的就绪队列
  /// Matured-move script: moves every item of every due timestamp into its
  /// ready queue
  /// `KEYS[1]` -> 待到期时间戳有序集合 / sorted set of pending timestamps
  /// `ARGV[1]` -> 当前毫秒时间戳 / current millisecond timestamp
  /// `ARGV[2]` -> 延迟列表键前缀 / delayed list key prefix
  /// `ARGV[3]` -> 就绪队列键前缀 / ready queue key prefix
  /// `ARGV[4]` -> 时间戳集合键前缀 / timestamps set key prefix
  /// 返回移动数量 / Returns the moved count
  pub const MOVE_MATURED: &str = r#"
        local moved = 0
        local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
        for _, ts in ipairs(due) do
            local dkey = ARGV[2] .. ts
            local item = redis.call("LPOP", dkey)
            while item do
                local decoded = cjson.decode(item)
                redis.call("RPUSH", ARGV[3] .. decoded["queue"], item)
                redis.call("SREM", ARGV[4] .. item, ts)
                moved = moved + 1
                item = redis.call("LPOP", dkey)
            end
            redis.call("DEL", dkey)
            redis.call("ZREM", KEYS[1], ts)
        end
        return moved
    "#;
}

/// 按名称取脚本源码
/// Resolve a script source by name
fn script_source(name: &str) -> Option<&'static str> {
  match name {
    "push_at" => Some(scripts::PUSH_AT),
    "remove_delayed" => Some(scripts::REMOVE_DELAYED),
    "move_matured" => Some(scripts::MOVE_MATURED),
    _ => None,
  }
}

/// Redis 脚本管理器
/// Redis script manager
#[derive(Debug, Default)]
pub struct ScriptManager {
  /// 脚本 SHA 缓存
  /// Script SHA cache
  script_sha1: Mutex<HashMap<&'static str, String>>,
}

impl ScriptManager {
  /// 执行脚本：优先 EVALSHA，脚本被清理时回退到加载后重试
  /// Run a script: EVALSHA first, reload and retry when the script was
  /// flushed
  pub async fn eval_script<T>(
    &self,
    conn: &mut MultiplexedConnection,
    script_name: &str,
    keys: &[String],
    args: &[String],
  ) -> Result<T>
  where
    T: redis::FromRedisValue,
  {
    let script = script_source(script_name)
      .ok_or_else(|| Error::queue(format!("Unknown script: {script_name}")))?;

    let cached_sha = {
      let cache = self
        .script_sha1
        .lock()
        .map_err(|_| Error::queue("Script SHA cache poisoned"))?;
      cache.get(script_name).cloned()
    };

    if let Some(sha) = cached_sha {
      match redis::cmd("EVALSHA")
        .arg(&sha)
        .arg(keys.len())
        .arg(keys)
        .arg(args)
        .query_async::<T>(conn)
        .await
      {
        Ok(result) => return Ok(result),
        Err(e) if e.to_string().contains("NOSCRIPT") => {
          // 脚本被清理了，走下面的加载路径
          // Script was flushed, fall through to the load path
        }
        Err(e) => return Err(e.into()),
      }
    }

    let sha: String = redis::cmd("SCRIPT")
      .arg("LOAD")
      .arg(script)
      .query_async(conn)
      .await?;
    if let Ok(mut cache) = self.script_sha1.lock() {
      if let Some((name, _)) = ALL_SCRIPTS.iter().find(|(name, _)| *name == script_name) {
        cache.insert(*name, sha);
      }
    }

    let result: T = redis::cmd("EVAL")
      .arg(script)
      .arg(keys.len())
      .arg(keys)
      .arg(args)
      .query_async(conn)
      .await?;
    Ok(result)
  }
}

static ALL_SCRIPTS: [(&str, &str); 3] = [
  ("push_at", scripts::PUSH_AT),
  ("remove_delayed", scripts::REMOVE_DELAYED),
  ("move_matured", scripts::MOVE_MATURED),
];

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_script_sources_resolve() {
    assert!(script_source("push_at").is_some());
    assert!(script_source("remove_delayed").is_some());
    assert!(script_source("move_matured").is_some());
    assert!(script_source("unknown").is_none());
  }

  #[test]
  fn test_scripts_reference_expected_commands() {
    assert!(scripts::PUSH_AT.contains("SISMEMBER"));
    assert!(scripts::REMOVE_DELAYED.contains("LREM"));
    assert!(scripts::MOVE_MATURED.contains("ZRANGEBYSCORE"));
  }
}
