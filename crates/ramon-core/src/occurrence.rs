use crate::variables::Variables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// 事件订阅描述，由外部事件源消费
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventSpec {
    /// 服务日志（journal）
    Service { name: String },

    /// 日志文件
    LogFile { path: PathBuf },

    /// 文件系统变化
    Watch { globs: Vec<String> },

    /// 固定间隔
    Every { interval: Duration },

    /// Cron 表达式
    At { cron: String },

    /// 监视器间信号
    On { signals: BTreeSet<String> },
}

impl EventSpec {
    pub fn kind(&self) -> EventKind {
        match self {
            EventSpec::Service { .. } => EventKind::Service,
            EventSpec::LogFile { .. } => EventKind::Log,
            EventSpec::Watch { .. } => EventKind::Watch,
            EventSpec::Every { .. } => EventKind::Every,
            EventSpec::At { .. } => EventKind::At,
            EventSpec::On { .. } => EventKind::On,
        }
    }
}

/// 事件来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Service,
    Log,
    Watch,
    Every,
    At,
    On,
}

impl EventKind {
    /// 是否携带原始日志行
    pub fn carries_lines(&self) -> bool {
        matches!(self, EventKind::Service | EventKind::Log)
    }
}

/// 一次事件发生
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    /// 目标监视器
    pub monitor: String,

    /// 触发时间
    pub timestamp: DateTime<Utc>,

    /// 事件来源
    pub kind: EventKind,

    /// 事件局部变量（service、file、port 等）
    pub locals: Variables,

    /// 原始日志行
    pub line: Option<String>,
}

impl Occurrence {
    pub fn new(monitor: impl Into<String>, kind: EventKind) -> Self {
        Self {
            monitor: monitor.into(),
            timestamp: Utc::now(),
            kind,
            locals: Variables::new(),
            line: None,
        }
    }

    /// 来自日志文件的一行
    pub fn log_line(monitor: impl Into<String>, path: impl Into<String>, line: impl Into<String>) -> Self {
        Self::new(monitor, EventKind::Log)
            .with_local("file", Value::String(path.into()))
            .with_line(line)
    }

    /// 来自服务日志的一行
    pub fn service_line(monitor: impl Into<String>, service: impl Into<String>, line: impl Into<String>) -> Self {
        Self::new(monitor, EventKind::Service)
            .with_local("service", Value::String(service.into()))
            .with_line(line)
    }

    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.line = Some(line.into());
        self
    }

    pub fn with_local(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.locals.insert(name.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 用于日志条件的文本；非日志来源返回 None
    pub fn log_text(&self) -> Option<&str> {
        if self.kind.carries_lines() {
            self.line.as_deref()
        } else {
            None
        }
    }
}
