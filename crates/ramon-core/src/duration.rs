use crate::error::{RamonError, Result};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// 解析时长（"10s"、"5m"、"1h30m"）
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(RamonError::config("empty duration"));
    }
    duration_str::parse(input)
        .map_err(|e| RamonError::config(format!("invalid duration {:?}: {}", input, e)))
}

/// 解析 cron 表达式（秒 分 时 日 月 周 [年]）
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr.trim())
        .map_err(|e| RamonError::config(format!("invalid cron expression {:?}: {}", expr, e)))
}

/// 频率 "n/period"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    pub count: u32,
    pub period: Duration,
}

impl Rate {
    pub fn new(count: u32, period: Duration) -> Self {
        Self { count, period }
    }
}

/// 解析频率，周期可以只写单位（"10/m" 等价于 "10/1m"）
pub fn parse_rate(input: &str) -> Result<Rate> {
    let (count, period) = input
        .split_once('/')
        .ok_or_else(|| RamonError::config(format!("invalid rate {:?}: expected \"n/period\"", input)))?;

    let count: u32 = count
        .trim()
        .parse()
        .map_err(|_| RamonError::config(format!("invalid rate {:?}: count must be a positive integer", input)))?;
    if count == 0 {
        return Err(RamonError::config(format!("invalid rate {:?}: count must be at least 1", input)));
    }

    let period = period.trim();
    let period = if period.starts_with(|c: char| c.is_ascii_digit()) {
        parse_duration(period)?
    } else {
        parse_duration(&format!("1{}", period))?
    };
    if period.is_zero() {
        return Err(RamonError::config(format!("invalid rate {:?}: period must be non-zero", input)));
    }

    Ok(Rate { count, period })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_rate_with_bare_unit() {
        let rate = parse_rate("10/m").unwrap();
        assert_eq!(rate.count, 10);
        assert_eq!(rate.period, Duration::from_secs(60));

        let rate = parse_rate("3/30s").unwrap();
        assert_eq!(rate, Rate::new(3, Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_rate_rejects_garbage() {
        assert!(parse_rate("10").is_err());
        assert!(parse_rate("0/m").is_err());
        assert!(parse_rate("x/m").is_err());
    }

    #[test]
    fn test_parse_schedule() {
        assert!(parse_schedule("0 0 9 * * *").is_ok());
        assert!(parse_schedule("every day").is_err());
    }
}
