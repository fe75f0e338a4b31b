//! 冻结窗口评估模块
//! Freeze window evaluation module
//!
//! 冻结窗口是按分钟集合解释的 cron 表达式；给定一组窗口和一个参考时刻，
//! 求出参考时刻之后第一个落在所有窗口之外的时刻。计算完全由传入的时钟
//! 决定，不读系统时间
//! A freeze window is a cron expression interpreted as a set of minutes;
//! given a window set and a reference instant, find the first instant at or
//! after the reference that lies outside every window. The computation is
//! driven entirely by the clock passed in, never by the system time

use crate::cron::to_schedule;
use crate::error::{Error, Result};
use chrono::{DateTime, Timelike, Utc};
use cron::Schedule;

/// 逐分钟扫描的上限（一年），防止永不结束的窗口让调用方挂死
/// Upper bound of the minute scan (one year) so a never-ending window cannot
/// hang the caller
const MAX_SCAN_MINUTES: i64 = 366 * 24 * 60;

/// 返回第一个 ≥ `t` 且不在任何窗口内的时刻
/// Return the first instant ≥ `t` that is inside no window
///
/// `t` 本来就在所有窗口之外时原样返回
/// `t` is returned unchanged when it is already outside every window
pub fn time_out_of_windows(windows: &[String], t: DateTime<Utc>) -> Result<DateTime<Utc>> {
  if windows.is_empty() {
    return Ok(t);
  }
  let schedules = windows
    .iter()
    .map(|window| to_schedule(window))
    .collect::<Result<Vec<_>>>()?;

  let mut minute = truncate_to_minute(t)?;
  if !in_any_window(&schedules, minute) {
    return Ok(t);
  }

  for _ in 0..MAX_SCAN_MINUTES {
    minute = minute + chrono::Duration::minutes(1);
    if !in_any_window(&schedules, minute) {
      return Ok(minute);
    }
  }

  tracing::warn!(
    windows = ?windows,
    "Freeze windows never open within a year, giving up the scan"
  );
  Ok(minute)
}

fn in_any_window(schedules: &[Schedule], minute: DateTime<Utc>) -> bool {
  schedules.iter().any(|schedule| schedule.includes(minute))
}

fn truncate_to_minute(t: DateTime<Utc>) -> Result<DateTime<Utc>> {
  t.with_second(0)
    .and_then(|t| t.with_nanosecond(0))
    .ok_or_else(|| Error::queue(format!("Cannot truncate instant to minute: {t}")))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_outside_windows_returns_input_unchanged() {
    // 只有午夜整点是窗口；中午的时刻原样返回，秒数也不动
    // Only midnight is a window; a noon instant comes back unchanged,
    // seconds included
    let windows = vec!["0 0 * * *".to_string()];
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
    assert_eq!(time_out_of_windows(&windows, t).unwrap(), t);
  }

  #[test]
  fn test_empty_windows_returns_input() {
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(time_out_of_windows(&[], t).unwrap(), t);
  }

  #[test]
  fn test_inside_hour_window_advances_to_next_hour() {
    let windows = vec!["* 10 * * *".to_string()];
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 59, 30).unwrap();
    assert_eq!(
      time_out_of_windows(&windows, t).unwrap(),
      Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()
    );
  }

  #[test]
  fn test_inside_minute_range_window() {
    let windows = vec!["0-30 * * * *".to_string()];
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap();
    assert_eq!(
      time_out_of_windows(&windows, t).unwrap(),
      Utc.with_ymd_and_hms(2024, 1, 1, 0, 31, 0).unwrap()
    );
  }

  #[test]
  fn test_weekday_window_advances_to_next_day() {
    // 2024-01-01 是周一，整天冻结；应当推进到周二零点
    // 2024-01-01 is a Monday, frozen all day; must advance to Tuesday
    // midnight
    let windows = vec!["* * * * 1".to_string()];
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    assert_eq!(
      time_out_of_windows(&windows, t).unwrap(),
      Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
    );
  }

  #[test]
  fn test_overlapping_windows() {
    let windows = vec!["0-20 * * * *".to_string(), "15-40 * * * *".to_string()];
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
    assert_eq!(
      time_out_of_windows(&windows, t).unwrap(),
      Utc.with_ymd_and_hms(2024, 1, 1, 0, 41, 0).unwrap()
    );
  }

  #[test]
  fn test_malformed_window_is_rejected() {
    let windows = vec!["not a cron".to_string()];
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    assert!(matches!(
      time_out_of_windows(&windows, t),
      Err(Error::MalformedCron { .. })
    ));
  }
}
