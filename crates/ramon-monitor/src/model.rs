use ramon_config::{ExecDef, MatchMode, MonitorDef, NotifyActionDef, DEFAULT_NOTIFY};
use ramon_core::{
    parse_duration, parse_rate, parse_schedule, EventSpec, Rate, RamonError, Result, Variables,
};
use ramon_script::ScriptEngine;
use regex::{Regex, RegexBuilder};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// 监视器定义
#[derive(Debug, Clone)]
pub struct Monitor {
    /// 名称（唯一）
    pub name: String,

    /// 订阅的事件
    pub events: Vec<EventSpec>,

    /// 条件，按优先级从高到低排列
    pub conditions: Vec<Condition>,

    /// 动作，按顺序执行
    pub actions: Vec<Action>,

    /// 监视器局部变量
    pub vars: Arc<Variables>,

    /// 安装时所属的代数，0 表示尚未安装
    pub generation: u64,
}

/// 条件
#[derive(Debug, Clone)]
pub enum Condition {
    /// 距上次触发至少间隔
    Cooldown(Duration),

    /// 日志行匹配正则
    MatchLog { patterns: Vec<Regex>, mode: MatchMode },

    /// 日志行匹配则忽略
    IgnoreLog(Regex),

    /// 值首次出现；`key` 为配置原文，`template` 为求值模板
    Unique { key: String, template: String },

    /// 布尔表达式
    If(String),

    /// 前置条件在窗口内共同通过至少 n 次
    Threshold(Rate),
}

impl Condition {
    /// 固定优先级，数值越大越先求值
    pub fn priority(&self) -> i32 {
        match self {
            Condition::Cooldown(_) => -10,
            Condition::MatchLog { .. } => -20,
            Condition::IgnoreLog(_) => -21,
            Condition::Unique { .. } => -30,
            Condition::If(_) => -50,
            Condition::Threshold(_) => -90,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Condition::Cooldown(_) => "cooldown",
            Condition::MatchLog { .. } => "match_log",
            Condition::IgnoreLog(_) => "ignore_log",
            Condition::Unique { .. } => "unique",
            Condition::If(_) => "if",
            Condition::Threshold(_) => "threshold",
        }
    }

    /// 编译多行模式的日志正则
    pub fn log_regex(pattern: &str) -> Result<Regex> {
        RegexBuilder::new(pattern)
            .multi_line(true)
            .build()
            .map_err(|e| RamonError::config(format!("invalid regex {:?}: {}", pattern, e)))
    }

    pub fn match_log(patterns: &[&str], mode: MatchMode) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Self::log_regex(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Condition::MatchLog { patterns, mode })
    }

    pub fn ignore_log(pattern: &str) -> Result<Self> {
        Ok(Condition::IgnoreLog(Self::log_regex(pattern)?))
    }

    /// 裸变量名等价于 `{{ name }}`
    pub fn unique(spec: &str) -> Self {
        let spec = spec.trim();
        let template = if is_variable_name(spec) {
            format!("{{{{ {} }}}}", spec)
        } else {
            spec.to_string()
        };
        Condition::Unique {
            key: spec.to_string(),
            template,
        }
    }
}

fn is_variable_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// exec 命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecCommand {
    /// `sh -c <rendered>`
    Shell(String),
    /// 直接执行，逐个参数渲染
    Argv(Vec<String>),
}

/// notify 动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyAction {
    /// 聚合 id 模板，None 表示使用监视器名称
    pub id: Option<String>,
    pub title: String,
    pub body: String,
    /// 通知配置名称
    pub config: String,
}

impl NotifyAction {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            body: body.into(),
            config: DEFAULT_NOTIFY.to_string(),
        }
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// 动作
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Exec(ExecCommand),
    Notify(NotifyAction),
    /// 覆盖全局变量
    Set(Variables),
    /// 追加到全局数组
    Push(Variables),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Exec(_) => "exec",
            Action::Notify(_) => "notify",
            Action::Set(_) => "set",
            Action::Push(_) => "push",
        }
    }
}

/// 从配置构建监视器所需的上下文
pub struct BuildContext<'a> {
    pub script: &'a ScriptEngine,
    pub notify_configs: HashSet<String>,
}

impl Monitor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
            vars: Arc::new(Variables::new()),
            generation: 0,
        }
    }

    pub fn with_event(mut self, event: EventSpec) -> Self {
        self.events.push(event);
        self
    }

    /// 添加条件并保持优先级顺序（同优先级保持添加顺序）
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self.conditions.sort_by_key(|c| Reverse(c.priority()));
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Arc::make_mut(&mut self.vars).insert(name.into(), value.into());
        self
    }

    /// `if` 表达式在脚本引擎中的 id，不同代数互不覆盖
    pub fn if_script_id(&self) -> String {
        format!("{}#if@{}", self.name, self.generation)
    }

    /// 从配置定义构建，所有问题都在这里以配置错误报告
    pub fn from_def(name: &str, def: &MonitorDef, ctx: &BuildContext<'_>) -> Result<Self> {
        build_monitor(name, def, ctx)
            .map_err(|e| RamonError::config(format!("Monitor `{}`: {}", name, strip_config_prefix(e))))
    }
}

fn strip_config_prefix(err: RamonError) -> String {
    match err {
        RamonError::Config(message) => message,
        other => other.to_string(),
    }
}

fn build_monitor(name: &str, def: &MonitorDef, ctx: &BuildContext<'_>) -> Result<Monitor> {
    let mut monitor = Monitor::new(name);
    monitor.vars = Arc::new(def.var.clone());

    // 事件
    if let Some(service) = &def.service {
        monitor.events.push(EventSpec::Service { name: service.clone() });
    }
    if let Some(path) = &def.log {
        monitor.events.push(EventSpec::LogFile { path: path.clone() });
    }
    if let Some(globs) = &def.watch {
        let globs = globs.clone().into_vec();
        if globs.is_empty() {
            return Err(RamonError::config("`watch` must not be empty"));
        }
        monitor.events.push(EventSpec::Watch { globs });
    }
    if let Some(every) = &def.every {
        let interval = parse_duration(every)?;
        if interval.is_zero() {
            return Err(RamonError::config("`every` must be greater than 0"));
        }
        monitor.events.push(EventSpec::Every { interval });
    }
    if let Some(at) = &def.at {
        parse_schedule(at)?;
        monitor.events.push(EventSpec::At { cron: at.clone() });
    }
    if let Some(on) = &def.on {
        let signals: BTreeSet<String> = on.clone().into_vec().into_iter().collect();
        if signals.is_empty() {
            return Err(RamonError::config("`on` must not be empty"));
        }
        monitor.events.push(EventSpec::On { signals });
    }
    if monitor.events.is_empty() {
        return Err(RamonError::config(
            "no event configured (service, log, watch, every, at or on)",
        ));
    }

    // 条件
    if let Some(cooldown) = &def.cooldown {
        monitor = monitor.with_condition(Condition::Cooldown(parse_duration(cooldown)?));
    }
    match (&def.match_log, def.match_log_mode) {
        (Some(patterns), mode) => {
            let patterns = patterns.clone().into_vec();
            if patterns.is_empty() {
                return Err(RamonError::config("`match_log` must not be empty"));
            }
            let patterns: Vec<&str> = patterns.iter().map(String::as_str).collect();
            monitor = monitor.with_condition(Condition::match_log(&patterns, mode.unwrap_or_default())?);
        }
        (None, Some(_)) => {
            return Err(RamonError::config("`match_log_mode` requires `match_log`"));
        }
        (None, None) => {}
    }
    if let Some(pattern) = &def.ignore_log {
        monitor = monitor.with_condition(Condition::ignore_log(pattern)?);
    }
    if let Some(unique) = &def.unique {
        let condition = Condition::unique(unique);
        if let Condition::Unique { template, .. } = &condition {
            ctx.script.check_template(template)?;
        }
        monitor = monitor.with_condition(condition);
    }
    if let Some(expr) = &def.if_expr {
        ctx.script.compile(&monitor.if_script_id(), expr)?;
        monitor = monitor.with_condition(Condition::If(expr.clone()));
    }
    if let Some(threshold) = &def.threshold {
        monitor = monitor.with_condition(Condition::Threshold(parse_rate(threshold)?));
    }

    // 动作：exec、notify、set、push
    if let Some(exec) = &def.exec {
        let command = match exec {
            ExecDef::Shell(script) if script.trim().is_empty() => {
                return Err(RamonError::config("`exec` must not be empty"));
            }
            ExecDef::Shell(script) => {
                ctx.script.check_template(script)?;
                ExecCommand::Shell(script.clone())
            }
            ExecDef::Argv(args) if args.is_empty() => {
                return Err(RamonError::config("`exec` must not be empty"));
            }
            ExecDef::Argv(args) => {
                for arg in args {
                    ctx.script.check_template(arg)?;
                }
                ExecCommand::Argv(args.clone())
            }
        };
        monitor.actions.push(Action::Exec(command));
    }
    if let Some(notify) = &def.notify {
        let action = match notify {
            NotifyActionDef::Title(title) => NotifyAction::new(title.clone(), ""),
            NotifyActionDef::Table(table) => NotifyAction {
                id: table.id.clone(),
                title: table.title.clone().unwrap_or_else(|| name.to_string()),
                body: table.body.clone().unwrap_or_default(),
                config: table
                    .config
                    .clone()
                    .unwrap_or_else(|| DEFAULT_NOTIFY.to_string()),
            },
        };
        if !ctx.notify_configs.contains(&action.config) {
            return Err(RamonError::config(format!(
                "unknown notify config `{}`",
                action.config
            )));
        }
        for template in [Some(&action.title), Some(&action.body), action.id.as_ref()]
            .into_iter()
            .flatten()
        {
            ctx.script.check_template(template)?;
        }
        monitor.actions.push(Action::Notify(action));
    }
    if !def.set.is_empty() {
        check_value_templates(ctx.script, &def.set)?;
        monitor.actions.push(Action::Set(def.set.clone()));
    }
    if !def.push.is_empty() {
        check_value_templates(ctx.script, &def.push)?;
        monitor.actions.push(Action::Push(def.push.clone()));
    }

    Ok(monitor)
}

fn check_value_templates(script: &ScriptEngine, values: &Variables) -> Result<()> {
    for value in values.values() {
        if let serde_json::Value::String(template) = value {
            script.check_template(template)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramon_config::{parse_document, OneOrMany};

    fn context(script: &ScriptEngine) -> BuildContext<'_> {
        BuildContext {
            script,
            notify_configs: [DEFAULT_NOTIFY.to_string(), "critical".to_string()]
                .into_iter()
                .collect(),
        }
    }

    fn kinds(monitor: &Monitor) -> Vec<&'static str> {
        monitor.conditions.iter().map(Condition::name).collect()
    }

    #[test]
    fn test_conditions_sorted_by_priority() {
        let monitor = Monitor::new("m")
            .with_condition(Condition::Threshold(Rate::new(3, Duration::from_secs(60))))
            .with_condition(Condition::If("true".into()))
            .with_condition(Condition::unique("ip"))
            .with_condition(Condition::ignore_log("debug").unwrap())
            .with_condition(Condition::match_log(&["error"], MatchMode::All).unwrap())
            .with_condition(Condition::Cooldown(Duration::from_secs(5)));

        assert_eq!(
            kinds(&monitor),
            vec!["cooldown", "match_log", "ignore_log", "unique", "if", "threshold"]
        );
    }

    #[test]
    fn test_same_priority_keeps_declaration_order() {
        let monitor = Monitor::new("m")
            .with_condition(Condition::If("a".into()))
            .with_condition(Condition::Cooldown(Duration::from_secs(1)))
            .with_condition(Condition::If("b".into()));

        let sources: Vec<&str> = monitor
            .conditions
            .iter()
            .filter_map(|c| match c {
                Condition::If(src) => Some(src.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(sources, vec!["a", "b"]);
    }

    #[test]
    fn test_unique_bare_name_becomes_template() {
        match Condition::unique("ip") {
            Condition::Unique { key, template } => {
                assert_eq!(key, "ip");
                assert_eq!(template, "{{ ip }}");
            }
            other => panic!("unexpected condition: {:?}", other),
        }
        match Condition::unique("{{ user }}@{{ ip }}") {
            Condition::Unique { template, .. } => assert_eq!(template, "{{ user }}@{{ ip }}"),
            other => panic!("unexpected condition: {:?}", other),
        }
    }

    #[test]
    fn test_from_def_full_monitor() {
        let doc = parse_document(
            r#"
[monitor.ssh]
log = "/var/log/auth.log"
threshold = "3/m"
if = "user != \"root\""
unique = "ip"
ignore_log = "invalid"
match_log = 'Accepted \w+ for (?P<user>\w+) from (?P<ip>[\d.]+)'
cooldown = "10s"
exec = "echo {{ user }}"
notify = { title = "login {{ user }}", type = "critical" }
set = { last_ip = "{{ ip }}" }
"#,
        )
        .unwrap();
        let script = ScriptEngine::new();
        let monitor = Monitor::from_def("ssh", &doc.monitor["ssh"], &context(&script)).unwrap();

        assert_eq!(
            kinds(&monitor),
            vec!["cooldown", "match_log", "ignore_log", "unique", "if", "threshold"]
        );
        let actions: Vec<&str> = monitor.actions.iter().map(Action::name).collect();
        assert_eq!(actions, vec!["exec", "notify", "set"]);
        assert!(matches!(monitor.events[0], EventSpec::LogFile { .. }));
    }

    #[test]
    fn test_from_def_errors_are_fatal() {
        let script = ScriptEngine::new();
        let ctx = context(&script);

        let cases = vec![
            MonitorDef::default(),
            MonitorDef {
                every: Some("1m".into()),
                match_log: Some(OneOrMany::One("(unclosed".into())),
                ..Default::default()
            },
            MonitorDef {
                every: Some("soon".into()),
                ..Default::default()
            },
            MonitorDef {
                at: Some("not a cron".into()),
                ..Default::default()
            },
            MonitorDef {
                every: Some("1m".into()),
                if_expr: Some("1 +".into()),
                ..Default::default()
            },
            MonitorDef {
                every: Some("1m".into()),
                notify: Some(NotifyActionDef::Table(ramon_config::NotifyActionTable {
                    title: Some("x".into()),
                    config: Some("missing".into()),
                    ..Default::default()
                })),
                ..Default::default()
            },
            MonitorDef {
                every: Some("1m".into()),
                exec: Some(ExecDef::Argv(vec![])),
                ..Default::default()
            },
            MonitorDef {
                every: Some("1m".into()),
                threshold: Some("0/m".into()),
                ..Default::default()
            },
        ];

        for def in cases {
            let err = Monitor::from_def("bad", &def, &ctx).unwrap_err();
            assert!(err.is_fatal(), "expected configuration error, got {:?}", err);
            assert!(err.to_string().contains("Monitor `bad`"));
        }
    }

    #[test]
    fn test_log_regex_is_multi_line() {
        let re = Condition::log_regex("^error$").unwrap();
        assert!(re.is_match("info\nerror\ndone"));
    }
}
