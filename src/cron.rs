//! 哈希 cron 模块
//! Hashed cron module
//!
//! 把带 `H` 占位符的用户 cron 表达式变换成由任务标识决定的确定整数，
//! 再计算下一次触发时间，用来把周期构建的负载摊开
//! Transforms user cron expressions carrying the `H` placeholder into
//! deterministic integers derived from the job identifier, then computes the
//! next firing instant; this spreads periodic-build load out

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// 五个字段的名称，按位置排列
/// The five field names, by position
const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];

/// 每个位置的默认哈希范围
/// Default hash range per position
///
/// day-of-month 封顶 28，避免哈希值落到短月不存在的日期上
/// day-of-month caps at 28 so hashed values never land on a day a short
/// month does not have
const FIELD_RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 28), (1, 12), (0, 6)];

/// 星期数字到名称的映射，0 与 7 都是周日
/// Numeric weekday to name mapping, both 0 and 7 are Sunday
const DOW_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// 任务标识的稳定哈希
/// Stable hash of the job identifier
pub fn job_hash(job_id: &str) -> u64 {
  let digest = md5::compute(job_id.as_bytes());
  let d = digest.0;
  u64::from_be_bytes([d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]])
}

fn malformed(expression: &str) -> Error {
  Error::MalformedCron {
    expression: expression.to_string(),
  }
}

/// 变换带 `H` 占位符的表达式
/// Transform an expression carrying `H` placeholders
///
/// 支持 `H`、`H/step`、`H(lo-hi)`、`H(lo-hi)/step`；显式范围必须落在该字段的
/// 默认范围内。不含 `H` 的字段原样保留
/// Supports `H`, `H/step`, `H(lo-hi)` and `H(lo-hi)/step`; an explicit range
/// must lie within the field's default range. Fields without `H` are kept
/// as they are
pub fn transform(expression: &str, job_id: &str) -> Result<String> {
  let fields: Vec<&str> = expression.split_whitespace().collect();
  if fields.len() != 5 {
    return Err(malformed(expression));
  }
  let hash = job_hash(job_id);
  let mut out = Vec::with_capacity(5);
  for (pos, field) in fields.iter().enumerate() {
    out.push(transform_field(field, pos, hash, expression)?);
  }
  Ok(out.join(" "))
}

fn transform_field(field: &str, pos: usize, hash: u64, expression: &str) -> Result<String> {
  if !field.contains('H') {
    return Ok(field.to_string());
  }
  let (lo_default, hi_default) = FIELD_RANGES[pos];
  let rest = field.strip_prefix('H').ok_or_else(|| malformed(expression))?;
  let (range_part, step_part) = match rest.split_once('/') {
    Some((range, step)) => (range, Some(step)),
    None => (rest, None),
  };

  let (lo, hi) = if range_part.is_empty() {
    (lo_default, hi_default)
  } else {
    let inner = range_part
      .strip_prefix('(')
      .and_then(|r| r.strip_suffix(')'))
      .ok_or_else(|| malformed(expression))?;
    let (lo_raw, hi_raw) = inner.split_once('-').ok_or_else(|| malformed(expression))?;
    let lo: u32 = lo_raw.trim().parse().map_err(|_| malformed(expression))?;
    let hi: u32 = hi_raw.trim().parse().map_err(|_| malformed(expression))?;
    if lo > hi || lo < lo_default || hi > hi_default {
      return Err(Error::InvalidRange {
        field: FIELD_NAMES[pos],
        lo,
        hi,
      });
    }
    (lo, hi)
  };

  if let Some(step) = step_part {
    let parsed: Option<u32> = step.parse().ok();
    if !parsed.map(|s| s > 0).unwrap_or(false) {
      return Err(malformed(expression));
    }
  }

  let value = (hash % u64::from(hi - lo + 1)) as u32 + lo;
  Ok(match step_part {
    Some(step) => format!("{value}/{step}"),
    None => value.to_string(),
  })
}

/// 把五字段表达式适配成 cron crate 的六字段语法
/// Adapt a 5-field expression into the cron crate's 6-field syntax
///
/// 星期位的数字统一映射为名称，保证 0 始终表示周日
/// Numeric day-of-week tokens are mapped to names so `0` always means Sunday
pub(crate) fn to_schedule(expression: &str) -> Result<Schedule> {
  let fields: Vec<&str> = expression.split_whitespace().collect();
  if fields.len() != 5 {
    return Err(malformed(expression));
  }
  let six = format!(
    "0 {} {} {} {} {}",
    fields[0],
    fields[1],
    fields[2],
    fields[3],
    map_dow_field(fields[4])
  );
  Schedule::from_str(&six).map_err(|_| malformed(expression))
}

fn map_dow_field(field: &str) -> String {
  field
    .split(',')
    .map(map_dow_part)
    .collect::<Vec<_>>()
    .join(",")
}

fn map_dow_part(part: &str) -> String {
  let (range, step) = match part.split_once('/') {
    Some((range, step)) => (range, Some(step)),
    None => (part, None),
  };
  let mapped = match range.split_once('-') {
    Some((a, b)) => format!("{}-{}", map_dow_atom(a), map_dow_atom(b)),
    None => map_dow_atom(range),
  };
  match step {
    Some(step) => format!("{mapped}/{step}"),
    None => mapped,
  }
}

fn map_dow_atom(atom: &str) -> String {
  match atom.parse::<usize>() {
    Ok(n) if n <= 7 => DOW_NAMES[n % 7].to_string(),
    _ => atom.to_string(),
  }
}

/// 已变换表达式在 `after` 之后的最早触发时间（UTC）
/// Earliest firing instant (UTC) of a transformed expression strictly after
/// `after`
pub fn next(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
  let schedule = to_schedule(expression)?;
  schedule
    .after(&after)
    .next()
    .ok_or_else(|| malformed(expression))
}
