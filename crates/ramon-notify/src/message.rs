use chrono::{DateTime, Utc};
use ramon_config::{AggregateDef, NotifyDef};
use ramon_core::{parse_duration, parse_rate, parse_schedule, Rate, RamonError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 通知消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// 聚合 id，默认为监视器名称
    pub id: String,

    /// 标题
    pub title: String,

    /// 内容
    pub body: String,

    /// 时间
    pub timestamp: DateTime<Utc>,

    /// 通知配置名称
    pub config: String,
}

impl Notification {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        config: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            timestamp: Utc::now(),
            config: config.into(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// 聚合方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateMode {
    /// 立即发送
    None,
    /// 静默期防抖
    Debounce(Duration),
    /// 按 cron 表达式批量发送
    Cron(String),
}

/// 投递目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryTarget {
    /// 只写日志
    Log,
    Smtp {
        from: String,
        to: String,
        host: Option<String>,
        username: Option<String>,
        password: Option<String>,
    },
    PushBullet {
        token: String,
    },
}

/// 命名通知配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub name: String,
    pub target: DeliveryTarget,
    pub limit: Option<Rate>,
    pub aggregate: AggregateMode,
    /// 仅对 Debounce 生效
    pub aggregate_timeout: Option<Duration>,
}

impl NotifyConfig {
    /// 只写日志、不聚合、不限流
    pub fn log_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: DeliveryTarget::Log,
            limit: None,
            aggregate: AggregateMode::None,
            aggregate_timeout: None,
        }
    }

    pub fn with_limit(mut self, limit: Rate) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_debounce(mut self, quiet: Duration, timeout: Option<Duration>) -> Self {
        self.aggregate = AggregateMode::Debounce(quiet);
        self.aggregate_timeout = timeout;
        self
    }

    pub fn with_cron(mut self, expr: impl Into<String>) -> Self {
        self.aggregate = AggregateMode::Cron(expr.into());
        self
    }

    /// 从配置定义构建，所有错误均为配置错误
    pub fn from_def(name: &str, def: &NotifyDef) -> Result<Self> {
        let context = |e: RamonError| RamonError::config(format!("Notify `{}`: {}", name, e));

        let limit = def.limit.as_deref().map(parse_rate).transpose().map_err(context)?;
        let aggregate = match &def.aggregate {
            None | Some(AggregateDef::Seconds(0)) => AggregateMode::None,
            Some(AggregateDef::Seconds(secs)) => AggregateMode::Debounce(Duration::from_secs(*secs)),
            Some(AggregateDef::Text(text)) => parse_aggregate(text).map_err(context)?,
        };

        let aggregate_timeout = match (&def.aggregate_timeout, &aggregate) {
            (None, _) => None,
            (Some(timeout), AggregateMode::Debounce(_)) => {
                Some(parse_duration(timeout).map_err(context)?)
            }
            (Some(_), _) => {
                return Err(RamonError::config(format!(
                    "Notify `{}`: aggregate_timeout requires a duration aggregate",
                    name
                )))
            }
        };

        let target = match (&def.smtp, &def.pushbullet) {
            (Some(_), Some(_)) => {
                return Err(RamonError::config(format!(
                    "Notify `{}`: smtp and pushbullet are mutually exclusive",
                    name
                )))
            }
            (Some(smtp), None) => {
                for address in [&smtp.from, &smtp.to] {
                    address.parse::<lettre::message::Mailbox>().map_err(|e| {
                        RamonError::config(format!(
                            "Notify `{}`: invalid address `{}`: {}",
                            name, address, e
                        ))
                    })?;
                }
                DeliveryTarget::Smtp {
                    from: smtp.from.clone(),
                    to: smtp.to.clone(),
                    host: smtp.host.clone(),
                    username: smtp.username.clone(),
                    password: smtp.password.clone(),
                }
            }
            (None, Some(pushbullet)) => DeliveryTarget::PushBullet {
                token: pushbullet.token.clone(),
            },
            (None, None) => DeliveryTarget::Log,
        };

        Ok(Self {
            name: name.to_string(),
            target,
            limit,
            aggregate,
            aggregate_timeout,
        })
    }
}

/// 含空白的按 cron 解析，否则按时长解析；"0" 表示不聚合
fn parse_aggregate(text: &str) -> Result<AggregateMode> {
    let text = text.trim();
    if text == "0" {
        return Ok(AggregateMode::None);
    }
    if text.contains(char::is_whitespace) {
        parse_schedule(text)?;
        return Ok(AggregateMode::Cron(text.to_string()));
    }
    let quiet = parse_duration(text)?;
    if quiet.is_zero() {
        Ok(AggregateMode::None)
    } else {
        Ok(AggregateMode::Debounce(quiet))
    }
}
