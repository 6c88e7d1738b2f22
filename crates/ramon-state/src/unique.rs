use crate::encode_name;
use crate::persist::{append_line, read_complete_lines, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// 追加日志中的一条记录
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UniqueRecord {
    var: String,
    value: String,
    first_seen: DateTime<Utc>,
}

/// 单个监视器的已见值集合
#[derive(Debug, Default)]
struct MonitorUniques {
    // (变量名, 值) -> 首次出现时间
    seen: HashMap<(String, String), DateTime<Utc>>,
    log_path: Option<PathBuf>,
}

impl MonitorUniques {
    fn load(log_path: Option<PathBuf>) -> Self {
        let mut uniques = Self {
            seen: HashMap::new(),
            log_path,
        };

        let Some(path) = uniques.log_path.clone() else {
            return uniques;
        };

        match read_complete_lines(&path) {
            Ok(lines) => {
                for line in lines {
                    match serde_json::from_str::<UniqueRecord>(&line) {
                        Ok(record) => {
                            uniques
                                .seen
                                .entry((record.var, record.value))
                                .or_insert(record.first_seen);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Skipping malformed unique record");
                        }
                    }
                }
                debug!(path = %path.display(), count = uniques.seen.len(), "Unique cache loaded");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load unique cache, continuing in memory");
            }
        }

        uniques
    }

    fn persist(&self, record: &UniqueRecord) {
        let Some(path) = &self.log_path else {
            return;
        };

        let result = serde_json::to_string(record)
            .map_err(|e| e.to_string())
            .and_then(|line| append_line(path, &line).map_err(|e| e.to_string()));

        if let Err(e) = result {
            warn!(
                path = %path.display(),
                var = %record.var,
                error = %e,
                "Failed to persist unique value, kept in memory only"
            );
        }
    }

    fn rewrite(&self) {
        let Some(path) = &self.log_path else {
            return;
        };

        let mut data = String::new();
        for ((var, value), first_seen) in &self.seen {
            let record = UniqueRecord {
                var: var.clone(),
                value: value.clone(),
                first_seen: *first_seen,
            };
            match serde_json::to_string(&record) {
                Ok(line) => {
                    data.push_str(&line);
                    data.push('\n');
                }
                Err(e) => warn!(error = %e, "Failed to encode unique record"),
            }
        }

        if let Err(e) = write_atomic(path, data.as_bytes()) {
            warn!(path = %path.display(), error = %e, "Failed to rewrite unique cache");
        }
    }
}

/// 唯一值缓存
///
/// 每个监视器一个追加日志 `<dir>/<monitor>.unique`（名称经百分号编码），每行一条 JSON 记录。
/// 同一 (监视器, 变量, 值) 并发调用时只有一个调用者看到"首次出现"。
pub struct UniqueCache {
    dir: Option<PathBuf>,
    monitors: RwLock<HashMap<String, Arc<Mutex<MonitorUniques>>>>,
}

impl UniqueCache {
    /// 持久化到目录
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            monitors: RwLock::new(HashMap::new()),
        }
    }

    /// 仅内存
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            monitors: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn log_path(&self, monitor: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.unique", encode_name(monitor))))
    }

    fn monitor_entry(&self, monitor: &str) -> Arc<Mutex<MonitorUniques>> {
        {
            let monitors = self.monitors.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = monitors.get(monitor) {
                return entry.clone();
            }
        }

        let mut monitors = self.monitors.write().unwrap_or_else(|e| e.into_inner());
        monitors
            .entry(monitor.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(MonitorUniques::load(self.log_path(monitor)))))
            .clone()
    }

    /// 值未出现过时记录并返回 true；已出现过返回 false
    pub fn seen_and_record(&self, monitor: &str, var: &str, value: &str, at: DateTime<Utc>) -> bool {
        let entry = self.monitor_entry(monitor);
        let mut uniques = entry.lock().unwrap_or_else(|e| e.into_inner());

        let key = (var.to_string(), value.to_string());
        if uniques.seen.contains_key(&key) {
            return false;
        }

        uniques.seen.insert(key, at);
        uniques.persist(&UniqueRecord {
            var: var.to_string(),
            value: value.to_string(),
            first_seen: at,
        });

        debug!(monitor = %monitor, var = %var, value = %value, "New unique value recorded");
        true
    }

    pub fn is_seen(&self, monitor: &str, var: &str, value: &str) -> bool {
        let entry = self.monitor_entry(monitor);
        let uniques = entry.lock().unwrap_or_else(|e| e.into_inner());
        uniques.seen.contains_key(&(var.to_string(), value.to_string()))
    }

    pub fn first_seen(&self, monitor: &str, var: &str, value: &str) -> Option<DateTime<Utc>> {
        let entry = self.monitor_entry(monitor);
        let uniques = entry.lock().unwrap_or_else(|e| e.into_inner());
        uniques.seen.get(&(var.to_string(), value.to_string())).copied()
    }

    pub fn len(&self, monitor: &str) -> usize {
        let entry = self.monitor_entry(monitor);
        let uniques = entry.lock().unwrap_or_else(|e| e.into_inner());
        uniques.seen.len()
    }

    /// 清除某个变量（None 表示全部）的已见值
    pub fn clear(&self, monitor: &str, var: Option<&str>) -> usize {
        let entry = self.monitor_entry(monitor);
        let mut uniques = entry.lock().unwrap_or_else(|e| e.into_inner());

        let before = uniques.seen.len();
        match var {
            Some(var) => uniques.seen.retain(|(v, _), _| v != var),
            None => uniques.seen.clear(),
        }
        let removed = before - uniques.seen.len();

        if removed > 0 {
            uniques.rewrite();
        }

        info!(monitor = %monitor, var = ?var, removed = removed, "Unique cache cleared");
        removed
    }
}
