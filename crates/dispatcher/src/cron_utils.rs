//! CRON表达式解析和调度工具
//!
//! `cron` crate只接受带秒字段的6/7段表达式，这里把运维侧常用的
//! 标准5段表达式规范化为秒位为0的6段形式。时区支持固定偏移
//! （"+08:00"、"-0530"），缺省UTC。

use chrono::{DateTime, Duration, FixedOffset, Utc};
use cron::Schedule;
use std::str::FromStr;

use jobcenter_core::{JobCenterError, JobCenterResult};

pub struct CronSchedule {
    schedule: Schedule,
    offset: FixedOffset,
}

impl CronSchedule {
    pub fn new(cron_expr: &str, timezone: Option<&str>) -> JobCenterResult<Self> {
        let normalized = Self::normalize(cron_expr);
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| JobCenterError::InvalidCron {
                expr: cron_expr.to_string(),
                message: e.to_string(),
            })?;
        let offset = Self::parse_offset(timezone)?;
        Ok(Self { schedule, offset })
    }

    /// 5段表达式补秒位
    fn normalize(expr: &str) -> String {
        let fields = expr.split_whitespace().count();
        if fields == 5 {
            format!("0 {}", expr.trim())
        } else {
            expr.trim().to_string()
        }
    }

    fn parse_offset(timezone: Option<&str>) -> JobCenterResult<FixedOffset> {
        let utc = FixedOffset::east_opt(0)
            .ok_or_else(|| JobCenterError::internal("UTC偏移构造失败"))?;
        let tz = match timezone {
            None => return Ok(utc),
            Some(tz) => tz.trim(),
        };
        if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz == "Z" {
            return Ok(utc);
        }

        let (sign, rest) = match tz.as_bytes()[0] {
            b'+' => (1i32, &tz[1..]),
            b'-' => (-1i32, &tz[1..]),
            _ => {
                return Err(JobCenterError::Validation(format!(
                    "无效的时区偏移: {tz}"
                )))
            }
        };

        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(JobCenterError::Validation(format!("无效的时区偏移: {tz}")));
        }
        let hours: i32 = digits[..2]
            .parse()
            .map_err(|_| JobCenterError::Validation(format!("无效的时区偏移: {tz}")))?;
        let minutes: i32 = digits[2..]
            .parse()
            .map_err(|_| JobCenterError::Validation(format!("无效的时区偏移: {tz}")))?;
        if hours > 14 || minutes > 59 {
            return Err(JobCenterError::Validation(format!("无效的时区偏移: {tz}")));
        }

        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .ok_or_else(|| JobCenterError::Validation(format!("无效的时区偏移: {tz}")))
    }

    /// 验证表达式是否有效
    pub fn validate(cron_expr: &str, timezone: Option<&str>) -> JobCenterResult<()> {
        Self::new(cron_expr, timezone).map(|_| ())
    }

    /// `from`之后的下一次触发时间
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&from.with_timezone(&self.offset))
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// 从`from`开始的多个触发时间
    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&from.with_timezone(&self.offset))
            .take(count)
            .map(|dt| dt.with_timezone(&Utc))
            .collect()
    }

    /// `(after, until]`之间错过的触发时间，最多`limit`个
    pub fn missed_ticks(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.offset))
            .take(limit)
            .map(|dt| dt.with_timezone(&Utc))
            .take_while(|dt| *dt <= until)
            .collect()
    }

    /// 距下次触发的时长
    pub fn time_until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_after(now).map(|next| next - now)
    }
}
