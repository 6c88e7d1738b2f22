use ramon_core::Variables;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// 配置文件顶层结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    /// 引擎设置
    #[serde(default)]
    pub engine: EngineSettings,

    /// 全局变量
    #[serde(default)]
    pub var: Variables,

    /// 通知配置（按名称）
    #[serde(default)]
    pub notify: BTreeMap<String, NotifyDef>,

    /// 监视器定义（按名称）
    #[serde(default)]
    pub monitor: BTreeMap<String, MonitorDef>,
}

/// 引擎设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// 持久化状态根目录
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// 每个监视器的事件队列容量
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// 状态快照间隔
    #[serde(default = "default_persist_interval")]
    pub persist_interval: String,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_queue_capacity() -> usize {
    256
}

fn default_persist_interval() -> String {
    "30s".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            queue_capacity: default_queue_capacity(),
            persist_interval: default_persist_interval(),
        }
    }
}

/// 单个或多个值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

/// 多个 match_log 正则的组合方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

/// 监视器定义
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorDef {
    // 事件
    pub service: Option<String>,
    pub log: Option<PathBuf>,
    pub watch: Option<OneOrMany<String>>,
    pub every: Option<String>,
    pub at: Option<String>,
    pub on: Option<OneOrMany<String>>,

    // 条件
    pub cooldown: Option<String>,
    pub match_log: Option<OneOrMany<String>>,
    pub match_log_mode: Option<MatchMode>,
    pub ignore_log: Option<String>,
    pub unique: Option<String>,
    #[serde(rename = "if")]
    pub if_expr: Option<String>,
    pub threshold: Option<String>,

    // 动作
    pub exec: Option<ExecDef>,
    pub notify: Option<NotifyActionDef>,
    #[serde(default)]
    pub set: Variables,
    #[serde(default)]
    pub push: Variables,

    /// 监视器局部变量
    #[serde(default)]
    pub var: Variables,
}

/// exec 动作：字符串走 shell，数组直接执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecDef {
    Shell(String),
    Argv(Vec<String>),
}

/// notify 动作：字符串只作为标题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotifyActionDef {
    Title(String),
    Table(NotifyActionTable),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyActionTable {
    pub title: Option<String>,
    pub body: Option<String>,
    /// 通知配置名称，默认 "default"
    #[serde(rename = "type")]
    pub config: Option<String>,
    /// 聚合 id，默认监视器名称
    pub id: Option<String>,
}

/// 通知配置定义
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyDef {
    /// 发送频率限制 "n/period"
    pub limit: Option<String>,
    /// 聚合方式：时长（防抖）、cron 表达式或 0
    pub aggregate: Option<AggregateDef>,
    /// 防抖最长等待
    pub aggregate_timeout: Option<String>,
    pub smtp: Option<SmtpDef>,
    pub pushbullet: Option<PushBulletDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateDef {
    Seconds(u64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpDef {
    pub from: String,
    pub to: String,
    /// 未设置时使用本机未加密 SMTP
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushBulletDef {
    pub token: String,
}
