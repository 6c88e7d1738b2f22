use crate::model::{Condition, Monitor};
use ramon_config::MatchMode;
use ramon_core::{Occurrence, VariableStore, Variables};
use ramon_script::ScriptEngine;
use ramon_state::{CooldownTracker, UniqueCache, WindowCounter};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// 条件求值结果
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// 全部通过，携带补充后的变量
    Pass(VariableStore),
    /// 在某个条件处短路
    Fail { condition: &'static str },
}

impl PipelineOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, PipelineOutcome::Pass(_))
    }

    pub fn failed_condition(&self) -> Option<&'static str> {
        match self {
            PipelineOutcome::Fail { condition } => Some(*condition),
            PipelineOutcome::Pass(_) => None,
        }
    }
}

/// threshold 在 WindowCounter 中的键
pub fn threshold_key(monitor: &str) -> String {
    format!("threshold:{}", monitor)
}

/// 条件管道
pub struct ConditionPipeline {
    uniques: Arc<UniqueCache>,
    windows: Arc<WindowCounter>,
    cooldowns: Arc<CooldownTracker>,
    script: Arc<ScriptEngine>,
}

impl ConditionPipeline {
    pub fn new(
        uniques: Arc<UniqueCache>,
        windows: Arc<WindowCounter>,
        cooldowns: Arc<CooldownTracker>,
        script: Arc<ScriptEngine>,
    ) -> Self {
        Self {
            uniques,
            windows,
            cooldowns,
            script,
        }
    }

    /// 按优先级依次求值，遇到第一个失败的条件即返回
    pub fn evaluate(
        &self,
        monitor: &Monitor,
        occurrence: &Occurrence,
        globals: Arc<Variables>,
    ) -> PipelineOutcome {
        let mut vars = VariableStore::new(globals, monitor.vars.clone())
            .with_locals(occurrence.locals.clone());
        if !vars.locals().contains_key("monitor") {
            vars.insert_local("monitor", monitor.name.as_str());
        }
        if let Some(line) = &occurrence.line {
            if !vars.locals().contains_key("line") {
                vars.insert_local("line", line.as_str());
            }
        }

        for condition in &monitor.conditions {
            if !self.check(monitor, condition, occurrence, &mut vars) {
                debug!(monitor = %monitor.name, condition = condition.name(), "Condition failed");
                return PipelineOutcome::Fail {
                    condition: condition.name(),
                };
            }
        }

        PipelineOutcome::Pass(vars)
    }

    fn check(
        &self,
        monitor: &Monitor,
        condition: &Condition,
        occurrence: &Occurrence,
        vars: &mut VariableStore,
    ) -> bool {
        let now = occurrence.timestamp;

        match condition {
            Condition::Cooldown(duration) => self.cooldowns.check(&monitor.name, *duration, now),

            Condition::MatchLog { patterns, mode } => match occurrence.log_text() {
                None => true,
                Some(text) => match mode {
                    MatchMode::All => patterns.iter().all(|re| capture_into(re, text, vars)),
                    MatchMode::Any => patterns.iter().any(|re| capture_into(re, text, vars)),
                },
            },

            Condition::IgnoreLog(re) => match occurrence.log_text() {
                None => true,
                Some(text) => !re.is_match(text),
            },

            Condition::Unique { key, template } => {
                match self.script.render(template, &vars.merged()) {
                    Ok(value) => self.uniques.seen_and_record(&monitor.name, key, &value, now),
                    Err(e) => {
                        warn!(monitor = %monitor.name, error = %e, "`unique` evaluation failed");
                        false
                    }
                }
            }

            Condition::If(_) => match self.script.eval_bool(&monitor.if_script_id(), &vars.merged()) {
                Ok(result) => result,
                Err(e) => {
                    warn!(monitor = %monitor.name, error = %e, "`if` evaluation failed");
                    false
                }
            },

            Condition::Threshold(rate) => {
                let count = self
                    .windows
                    .record_and_count(&threshold_key(&monitor.name), rate.period, now);
                debug!(monitor = %monitor.name, count = count, needed = rate.count, "Threshold count");
                count >= rate.count as usize
            }
        }
    }
}

/// 匹配则把命名捕获组写入局部变量
fn capture_into(re: &Regex, text: &str, vars: &mut VariableStore) -> bool {
    let Some(captures) = re.captures(text) else {
        return false;
    };
    for name in re.capture_names().flatten() {
        if let Some(m) = captures.name(name) {
            vars.insert_local(name, m.as_str());
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use ramon_core::{EventKind, Rate};
    use std::time::Duration;

    fn pipeline() -> (ConditionPipeline, Arc<ScriptEngine>) {
        let script = Arc::new(ScriptEngine::new());
        let pipeline = ConditionPipeline::new(
            Arc::new(UniqueCache::in_memory()),
            Arc::new(WindowCounter::new()),
            Arc::new(CooldownTracker::new()),
            script.clone(),
        );
        (pipeline, script)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn line(text: &str, secs: i64) -> Occurrence {
        Occurrence::log_line("ssh", "/var/log/auth.log", text).at(t0() + ChronoDuration::seconds(secs))
    }

    fn globals() -> Arc<Variables> {
        Arc::new(Variables::new())
    }

    #[test]
    fn test_match_log_captures_named_groups() {
        let (pipeline, _) = pipeline();
        let monitor = Monitor::new("ssh").with_condition(
            Condition::match_log(&[r"Accepted \w+ for (?P<user>\w+) from (?P<ip>[\d.]+)"], MatchMode::All)
                .unwrap(),
        );

        match pipeline.evaluate(&monitor, &line("Accepted password for bob from 10.0.0.1", 0), globals()) {
            PipelineOutcome::Pass(vars) => {
                assert_eq!(vars.get_string("user").as_deref(), Some("bob"));
                assert_eq!(vars.get_string("ip").as_deref(), Some("10.0.0.1"));
                assert_eq!(vars.get_string("file").as_deref(), Some("/var/log/auth.log"));
                assert_eq!(vars.get_string("monitor").as_deref(), Some("ssh"));
            }
            other => panic!("expected pass, got {:?}", other),
        }

        let outcome = pipeline.evaluate(&monitor, &line("Failed password for bob", 1), globals());
        assert_eq!(outcome.failed_condition(), Some("match_log"));
    }

    #[test]
    fn test_match_log_modes() {
        let (pipeline, _) = pipeline();
        let all = Monitor::new("m")
            .with_condition(Condition::match_log(&["disk", "full"], MatchMode::All).unwrap());
        let any = Monitor::new("m")
            .with_condition(Condition::match_log(&["disk", "full"], MatchMode::Any).unwrap());

        assert!(!pipeline.evaluate(&all, &line("disk ok", 0), globals()).is_pass());
        assert!(pipeline.evaluate(&all, &line("disk full", 0), globals()).is_pass());
        assert!(pipeline.evaluate(&any, &line("disk ok", 0), globals()).is_pass());
    }

    #[test]
    fn test_log_conditions_pass_for_non_line_events() {
        let (pipeline, _) = pipeline();
        let monitor = Monitor::new("tick")
            .with_condition(Condition::match_log(&["never"], MatchMode::All).unwrap())
            .with_condition(Condition::ignore_log(".*").unwrap());

        let occurrence = Occurrence::new("tick", EventKind::Every).at(t0());
        assert!(pipeline.evaluate(&monitor, &occurrence, globals()).is_pass());
    }

    #[test]
    fn test_ignore_log() {
        let (pipeline, _) = pipeline();
        let monitor = Monitor::new("m").with_condition(Condition::ignore_log("healthcheck").unwrap());

        assert!(!pipeline.evaluate(&monitor, &line("GET /healthcheck", 0), globals()).is_pass());
        assert!(pipeline.evaluate(&monitor, &line("GET /login", 0), globals()).is_pass());
    }

    #[test]
    fn test_unique_fires_once_per_value() {
        let (pipeline, _) = pipeline();
        let monitor = Monitor::new("ssh")
            .with_condition(Condition::match_log(&[r"from (?P<ip>[\d.]+)"], MatchMode::All).unwrap())
            .with_condition(Condition::unique("ip"));

        assert!(pipeline.evaluate(&monitor, &line("from 1.1.1.1", 0), globals()).is_pass());
        assert!(!pipeline.evaluate(&monitor, &line("from 1.1.1.1", 1), globals()).is_pass());
        assert!(pipeline.evaluate(&monitor, &line("from 2.2.2.2", 2), globals()).is_pass());
    }

    #[test]
    fn test_unique_missing_variable_fails() {
        let (pipeline, _) = pipeline();
        let monitor = Monitor::new("m").with_condition(Condition::unique("ip"));
        let outcome = pipeline.evaluate(&monitor, &line("no captures", 0), globals());
        assert_eq!(outcome.failed_condition(), Some("unique"));
    }

    #[test]
    fn test_if_uses_variables_and_fails_safe() {
        let (pipeline, script) = pipeline();
        let monitor = Monitor::new("m")
            .with_var("limit", 90)
            .with_condition(Condition::If("usage > limit".into()));
        script.compile(&monitor.if_script_id(), "usage > limit").unwrap();

        let high = Occurrence::new("m", EventKind::Every).with_local("usage", 95).at(t0());
        let low = Occurrence::new("m", EventKind::Every).with_local("usage", 10).at(t0());
        let missing = Occurrence::new("m", EventKind::Every).at(t0());

        assert!(pipeline.evaluate(&monitor, &high, globals()).is_pass());
        assert!(!pipeline.evaluate(&monitor, &low, globals()).is_pass());
        assert_eq!(
            pipeline.evaluate(&monitor, &missing, globals()).failed_condition(),
            Some("if")
        );
    }

    #[test]
    fn test_cooldown_is_checked_not_recorded() {
        let (pipeline, _) = pipeline();
        let monitor = Monitor::new("m").with_condition(Condition::Cooldown(Duration::from_secs(60)));
        let occurrence = Occurrence::new("m", EventKind::Every).at(t0());

        // 管道本身不记录触发时间
        assert!(pipeline.evaluate(&monitor, &occurrence, globals()).is_pass());
        assert!(pipeline.evaluate(&monitor, &occurrence, globals()).is_pass());

        pipeline.cooldowns.record_fired("m", t0());
        assert!(!pipeline.evaluate(&monitor, &occurrence, globals()).is_pass());
    }

    #[test]
    fn test_threshold_counts_joint_passes_of_prior_conditions() {
        let (pipeline, _) = pipeline();
        let monitor = Monitor::new("m")
            .with_condition(Condition::match_log(&["error"], MatchMode::All).unwrap())
            .with_condition(Condition::Threshold(Rate::new(3, Duration::from_secs(60))));

        assert!(!pipeline.evaluate(&monitor, &line("error", 0), globals()).is_pass());
        // 不匹配的行不计数
        assert!(!pipeline.evaluate(&monitor, &line("ok", 1), globals()).is_pass());
        assert!(!pipeline.evaluate(&monitor, &line("error", 10), globals()).is_pass());
        assert!(pipeline.evaluate(&monitor, &line("error", 20), globals()).is_pass());
        assert!(pipeline.evaluate(&monitor, &line("error", 30), globals()).is_pass());

        // 窗口滑动后计数重新累积
        assert!(!pipeline.evaluate(&monitor, &line("error", 200), globals()).is_pass());
    }

    #[test]
    fn test_short_circuit_stops_later_conditions() {
        let (pipeline, _) = pipeline();
        let monitor = Monitor::new("m")
            .with_condition(Condition::ignore_log("skip").unwrap())
            .with_condition(Condition::unique("line"));

        assert!(!pipeline.evaluate(&monitor, &line("skip me", 0), globals()).is_pass());
        // ignore_log 短路后 unique 未记录
        assert_eq!(
            pipeline.evaluate(&monitor, &line("skip me", 1), globals()).failed_condition(),
            Some("ignore_log")
        );
        assert!(!pipeline.uniques.is_seen("m", "line", "skip me"));
    }
}
