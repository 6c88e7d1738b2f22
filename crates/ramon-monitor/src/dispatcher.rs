use crate::model::{Action, ExecCommand, Monitor, NotifyAction};
use chrono::{DateTime, Utc};
use ramon_core::{value_to_string, RamonError, Result, VariableStore, Variables};
use ramon_notify::{Notification, NotificationAggregator};
use ramon_script::ScriptEngine;
use ramon_state::CooldownTracker;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// 进程启动请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// 进程启动 trait：只负责启动，不等待退出
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<()>;
}

/// 基于 tokio::process 的启动器，子进程在后台回收
#[derive(Debug, Default)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<()> {
        let mut child = tokio::process::Command::new(&request.program)
            .args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .spawn()?;

        let program = request.program.clone();
        let pid = child.id();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(program = %program, pid = ?pid, "Child exited");
                }
                Ok(status) => {
                    warn!(program = %program, pid = ?pid, status = %status, "Child exited with failure");
                }
                Err(e) => {
                    warn!(program = %program, pid = ?pid, error = %e, "Failed to wait for child");
                }
            }
        });
        Ok(())
    }
}

/// 一次分发的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// 动作分发器
pub struct ActionDispatcher {
    script: Arc<ScriptEngine>,
    spawner: Arc<dyn ProcessSpawner>,
    aggregator: NotificationAggregator,
    cooldowns: Arc<CooldownTracker>,
    globals: Arc<RwLock<Arc<Variables>>>,
}

impl ActionDispatcher {
    pub fn new(
        script: Arc<ScriptEngine>,
        spawner: Arc<dyn ProcessSpawner>,
        aggregator: NotificationAggregator,
        cooldowns: Arc<CooldownTracker>,
        globals: Arc<RwLock<Arc<Variables>>>,
    ) -> Self {
        Self {
            script,
            spawner,
            aggregator,
            cooldowns,
            globals,
        }
    }

    /// 条件全部通过后执行动作
    ///
    /// 先记录冷却时间：动作失败时事件仍然算作发生过。
    pub fn run(&self, monitor: &Monitor, vars: &VariableStore, fired_at: DateTime<Utc>) -> DispatchSummary {
        self.cooldowns.record_fired(&monitor.name, fired_at);

        let merged = vars.merged();
        let mut summary = DispatchSummary::default();
        for action in &monitor.actions {
            match self.run_action(monitor, action, &merged, fired_at) {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!(monitor = %monitor.name, action = action.name(), error = %e, "Action failed");
                }
            }
        }

        debug!(
            monitor = %monitor.name,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Actions dispatched"
        );
        summary
    }

    fn run_action(
        &self,
        monitor: &Monitor,
        action: &Action,
        vars: &Variables,
        fired_at: DateTime<Utc>,
    ) -> Result<()> {
        match action {
            Action::Exec(command) => {
                let request = self.build_spawn(command, vars)?;
                self.spawner
                    .spawn(&request)
                    .map_err(|e| RamonError::Action(format!("spawn `{}` failed: {}", request.program, e)))?;
                info!(monitor = %monitor.name, program = %request.program, "Process spawned");
                Ok(())
            }
            Action::Notify(notify) => {
                let notification = self.build_notification(monitor, notify, vars, fired_at)?;
                self.aggregator.submit(notification)
            }
            Action::Set(values) => {
                let rendered = self.render_values(values, vars)?;
                self.update_globals(|globals| {
                    for (name, value) in rendered {
                        globals.insert(name, value);
                    }
                });
                Ok(())
            }
            Action::Push(values) => {
                let rendered = self.render_values(values, vars)?;
                self.update_globals(|globals| {
                    for (name, value) in rendered {
                        push_value(globals, name, value);
                    }
                });
                Ok(())
            }
        }
    }

    /// 字符串走 `sh -c`，数组逐个渲染；所有可见变量导出到子进程环境
    pub fn build_spawn(&self, command: &ExecCommand, vars: &Variables) -> Result<SpawnRequest> {
        let (program, args) = match command {
            ExecCommand::Shell(script) => (
                "sh".to_string(),
                vec!["-c".to_string(), self.script.render(script, vars)?],
            ),
            ExecCommand::Argv(argv) => {
                let mut rendered = argv
                    .iter()
                    .map(|arg| self.script.render(arg, vars))
                    .collect::<Result<Vec<_>>>()?;
                if rendered.is_empty() {
                    return Err(RamonError::Action("empty command".into()));
                }
                let program = rendered.remove(0);
                (program, rendered)
            }
        };

        let env = vars
            .iter()
            .filter(|(name, _)| is_env_name(name))
            .map(|(name, value)| (name.clone(), value_to_string(value)))
            .filter(|(_, value)| !value.contains('\0'))
            .collect();

        Ok(SpawnRequest { program, args, env })
    }

    pub fn build_notification(
        &self,
        monitor: &Monitor,
        notify: &NotifyAction,
        vars: &Variables,
        fired_at: DateTime<Utc>,
    ) -> Result<Notification> {
        let id = match &notify.id {
            Some(template) => self.script.render(template, vars)?,
            None => monitor.name.clone(),
        };
        let title = self.script.render(&notify.title, vars)?;
        let body = self.script.render(&notify.body, vars)?;
        Ok(Notification::new(id, title, body, notify.config.clone()).at(fired_at))
    }

    fn render_values(&self, values: &Variables, vars: &Variables) -> Result<Vec<(String, Value)>> {
        values
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(template) => Value::String(self.script.render(template, vars)?),
                    other => other.clone(),
                };
                Ok((name.clone(), value))
            })
            .collect()
    }

    /// 写时复制，读者始终拿到完整快照
    fn update_globals(&self, apply: impl FnOnce(&mut Variables)) {
        let mut guard = self.globals.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Variables::clone(&guard);
        apply(&mut next);
        *guard = Arc::new(next);
    }
}

fn push_value(globals: &mut Variables, name: String, value: Value) {
    match globals.remove(&name) {
        Some(Value::Array(mut items)) => {
            items.push(value);
            globals.insert(name, Value::Array(items));
        }
        Some(existing) => {
            globals.insert(name, Value::Array(vec![existing, value]));
        }
        None => {
            globals.insert(name, Value::Array(vec![value]));
        }
    }
}

fn is_env_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('=') && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramon_core::ManualClock;
    use ramon_notify::{LogNotifier, NotifyConfig};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSpawner {
        requests: Mutex<Vec<SpawnRequest>>,
        fail: bool,
    }

    impl ProcessSpawner for RecordingSpawner {
        fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("no such file");
            }
            self.requests.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    struct Fixture {
        dispatcher: ActionDispatcher,
        spawner: Arc<RecordingSpawner>,
        cooldowns: Arc<CooldownTracker>,
        globals: Arc<RwLock<Arc<Variables>>>,
        aggregator: NotificationAggregator,
    }

    fn fixture(fail: bool) -> Fixture {
        let spawner = Arc::new(RecordingSpawner {
            fail,
            ..Default::default()
        });
        let cooldowns = Arc::new(CooldownTracker::new());
        let globals = Arc::new(RwLock::new(Arc::new(Variables::new())));
        let aggregator =
            NotificationAggregator::new(Arc::new(LogNotifier), Arc::new(ManualClock::default()));
        aggregator.register(NotifyConfig::log_only("default").with_debounce(std::time::Duration::from_secs(3600), None));
        let dispatcher = ActionDispatcher::new(
            Arc::new(ScriptEngine::new()),
            spawner.clone(),
            aggregator.clone(),
            cooldowns.clone(),
            globals.clone(),
        );
        Fixture {
            dispatcher,
            spawner,
            cooldowns,
            globals,
            aggregator,
        }
    }

    fn vars() -> VariableStore {
        VariableStore::default().with_locals(
            [
                ("user".to_string(), Value::from("bob")),
                ("ip".to_string(), Value::from("10.0.0.1")),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[test]
    fn test_shell_exec_exports_variables() {
        let f = fixture(false);
        let request = f
            .dispatcher
            .build_spawn(&ExecCommand::Shell("echo {{ user }}".into()), &vars().merged())
            .unwrap();

        assert_eq!(request.program, "sh");
        assert_eq!(request.args, vec!["-c".to_string(), "echo bob".to_string()]);
        assert_eq!(request.env.get("ip").map(String::as_str), Some("10.0.0.1"));
    }

    #[test]
    fn test_argv_exec_renders_each_argument() {
        let f = fixture(false);
        let request = f
            .dispatcher
            .build_spawn(
                &ExecCommand::Argv(vec!["/usr/bin/ban".into(), "{{ ip }}".into(), "--reason=ssh".into()]),
                &vars().merged(),
            )
            .unwrap();

        assert_eq!(request.program, "/usr/bin/ban");
        assert_eq!(request.args, vec!["10.0.0.1".to_string(), "--reason=ssh".to_string()]);
    }

    #[tokio::test]
    async fn test_run_records_cooldown_even_when_action_fails() {
        let f = fixture(true);
        let monitor = Monitor::new("ssh").with_action(Action::Exec(ExecCommand::Shell("true".into())));
        let fired_at = Utc::now();

        let summary = f.dispatcher.run(&monitor, &vars(), fired_at);
        assert_eq!(summary, DispatchSummary { succeeded: 0, failed: 1 });
        assert_eq!(f.cooldowns.last_fired("ssh"), Some(fired_at));
        assert!(f.spawner.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notify_defaults_id_to_monitor_name() {
        let f = fixture(false);
        let monitor = Monitor::new("ssh")
            .with_action(Action::Notify(NotifyAction::new("login {{ user }}", "from {{ ip }}")));

        let summary = f.dispatcher.run(&monitor, &vars(), Utc::now());
        assert_eq!(summary.succeeded, 1);
        assert_eq!(f.aggregator.pending(), 1);

        let notification = f
            .dispatcher
            .build_notification(&monitor, &NotifyAction::new("login {{ user }}", "from {{ ip }}"), &vars().merged(), Utc::now())
            .unwrap();
        assert_eq!(notification.id, "ssh");
        assert_eq!(notification.title, "login bob");
        assert_eq!(notification.body, "from 10.0.0.1");
        assert_eq!(notification.config, "default");
    }

    #[tokio::test]
    async fn test_unknown_notify_config_is_an_action_failure() {
        let f = fixture(false);
        let monitor = Monitor::new("ssh")
            .with_action(Action::Notify(NotifyAction::new("t", "b").with_config("missing")))
            .with_action(Action::Exec(ExecCommand::Shell("true".into())));

        let summary = f.dispatcher.run(&monitor, &vars(), Utc::now());
        assert_eq!(summary, DispatchSummary { succeeded: 1, failed: 1 });
        assert_eq!(f.spawner.requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_set_and_push_update_globals() {
        let f = fixture(false);
        let monitor = Monitor::new("ssh")
            .with_action(Action::Set(
                [("last_ip".to_string(), Value::from("{{ ip }}"))].into_iter().collect(),
            ))
            .with_action(Action::Push(
                [("ips".to_string(), Value::from("{{ ip }}"))].into_iter().collect(),
            ))
            .with_action(Action::Push(
                [("ips".to_string(), Value::from("127.0.0.1"))].into_iter().collect(),
            ));

        f.dispatcher.run(&monitor, &vars(), Utc::now());

        let globals = f.globals.read().unwrap().clone();
        assert_eq!(globals["last_ip"], "10.0.0.1");
        assert_eq!(globals["ips"], serde_json::json!(["10.0.0.1", "127.0.0.1"]));
    }

    #[test]
    fn test_missing_template_variable_skips_action() {
        let f = fixture(false);
        let monitor = Monitor::new("ssh").with_action(Action::Exec(ExecCommand::Shell("kill {{ pid }}".into())));

        let summary = f.dispatcher.run(&monitor, &vars(), Utc::now());
        assert_eq!(summary.failed, 1);
        assert!(f.spawner.requests.lock().unwrap().is_empty());
    }
}
