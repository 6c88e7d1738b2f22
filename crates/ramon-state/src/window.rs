use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

/// 窗口起点 `now - window`，溢出时取最小时间
fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// 按时间排序的单键事件序列
#[derive(Debug, Default)]
struct Series {
    timestamps: VecDeque<DateTime<Utc>>,
}

impl Series {
    fn insert(&mut self, at: DateTime<Utc>) {
        match self.timestamps.back() {
            Some(last) if *last > at => {
                let pos = self.timestamps.partition_point(|t| *t <= at);
                self.timestamps.insert(pos, at);
            }
            _ => self.timestamps.push_back(at),
        }
    }

    /// 惰性淘汰窗口之外的记录
    fn evict(&mut self, window_start: DateTime<Utc>) {
        while matches!(self.timestamps.front(), Some(t) if *t < window_start) {
            self.timestamps.pop_front();
        }
    }

    fn count(&self, window_start: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        self.timestamps
            .iter()
            .filter(|t| **t >= window_start && **t <= now)
            .count()
    }
}

/// 滑动窗口计数器
///
/// 每个键一个有序时间序列。`count_in_window` 只统计 `[now - window, now]`
/// 之内的记录，窗口外的记录在查询时淘汰。
#[derive(Debug, Default)]
pub struct WindowCounter {
    series: RwLock<HashMap<String, Arc<Mutex<Series>>>>,
}

impl WindowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<Series>> {
        {
            let series = self.series.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = series.get(key) {
                return entry.clone();
            }
        }

        let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());
        series.entry(key.to_string()).or_default().clone()
    }

    pub fn record(&self, key: &str, at: DateTime<Utc>) {
        let entry = self.entry(key);
        let mut series = entry.lock().unwrap_or_else(|e| e.into_inner());
        series.insert(at);
    }

    pub fn count_in_window(&self, key: &str, window: Duration, now: DateTime<Utc>) -> usize {
        let entry = self.entry(key);
        let mut series = entry.lock().unwrap_or_else(|e| e.into_inner());
        let start = window_start(now, window);
        series.evict(start);
        series.count(start, now)
    }

    /// 记录一次并返回窗口内计数（原子操作）
    pub fn record_and_count(&self, key: &str, window: Duration, now: DateTime<Utc>) -> usize {
        let entry = self.entry(key);
        let mut series = entry.lock().unwrap_or_else(|e| e.into_inner());
        let start = window_start(now, window);
        series.insert(now);
        series.evict(start);
        series.count(start, now)
    }

    /// 限流准入：窗口内未满 `limit` 时记录并放行；
    /// 否则返回最早可放行的时间
    pub fn try_acquire(
        &self,
        key: &str,
        limit: usize,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), DateTime<Utc>> {
        let entry = self.entry(key);
        let mut series = entry.lock().unwrap_or_else(|e| e.into_inner());
        let start = window_start(now, window);
        series.evict(start);

        let in_window: Vec<DateTime<Utc>> = series
            .timestamps
            .iter()
            .copied()
            .filter(|t| *t >= start && *t <= now)
            .collect();

        if in_window.len() < limit.max(1) {
            series.insert(now);
            return Ok(());
        }

        // 需要有 len - limit + 1 条记录离开窗口
        let blocking = in_window[in_window.len() - limit.max(1)];
        let next = ChronoDuration::from_std(window)
            .ok()
            .and_then(|w| blocking.checked_add_signed(w + ChronoDuration::milliseconds(1)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        debug!(key = %key, limit = limit, next = %next, "Window at capacity");
        Err(next)
    }

    pub fn clear(&self, key: &str) {
        let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());
        series.remove(key);
    }

    /// 导出全部序列
    pub fn snapshot(&self) -> HashMap<String, Vec<DateTime<Utc>>> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series
            .iter()
            .map(|(key, entry)| {
                let s = entry.lock().unwrap_or_else(|e| e.into_inner());
                (key.clone(), s.timestamps.iter().copied().collect::<Vec<_>>())
            })
            .filter(|(_, timestamps)| !timestamps.is_empty())
            .collect()
    }

    /// 从快照恢复（合并到现有记录）
    pub fn restore(&self, snapshot: HashMap<String, Vec<DateTime<Utc>>>) {
        for (key, timestamps) in snapshot {
            let entry = self.entry(&key);
            let mut series = entry.lock().unwrap_or_else(|e| e.into_inner());
            for at in timestamps {
                series.insert(at);
            }
        }
    }
}
