use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// 冷却跟踪器：记录每个监视器最后一次执行动作的时间
#[derive(Debug, Default)]
pub struct CooldownTracker {
    last_fired: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 没有触发记录，或距上次触发已满 `duration` 时返回 true
    pub fn check(&self, monitor: &str, duration: Duration, now: DateTime<Utc>) -> bool {
        let last_fired = self.last_fired.read().unwrap_or_else(|e| e.into_inner());
        match last_fired.get(monitor) {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(*last);
                let ready = match ChronoDuration::from_std(duration) {
                    Ok(duration) => elapsed >= duration,
                    Err(_) => false,
                };
                if !ready {
                    debug!(
                        monitor = %monitor,
                        elapsed_secs = elapsed.num_seconds(),
                        "Monitor is cooling down"
                    );
                }
                ready
            }
        }
    }

    /// 只在全部条件通过后调用
    pub fn record_fired(&self, monitor: &str, now: DateTime<Utc>) {
        let mut last_fired = self.last_fired.write().unwrap_or_else(|e| e.into_inner());
        let entry = last_fired.entry(monitor.to_string()).or_insert(now);
        if *entry < now {
            *entry = now;
        }
    }

    pub fn last_fired(&self, monitor: &str) -> Option<DateTime<Utc>> {
        let last_fired = self.last_fired.read().unwrap_or_else(|e| e.into_inner());
        last_fired.get(monitor).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, DateTime<Utc>> {
        self.last_fired.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 从快照恢复，保留较新的时间
    pub fn restore(&self, snapshot: HashMap<String, DateTime<Utc>>) {
        let mut last_fired = self.last_fired.write().unwrap_or_else(|e| e.into_inner());
        for (monitor, at) in snapshot {
            let entry = last_fired.entry(monitor).or_insert(at);
            if *entry < at {
                *entry = at;
            }
        }
    }
}
