use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// 变量表
pub type Variables = BTreeMap<String, Value>;

/// 将变量值转换为字符串（字符串不带引号）
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 分层变量存储
///
/// 查找顺序：局部变量 > 监视器变量 > 全局变量。全局与监视器层是共享快照，
/// 只有局部层随一次事件发生而变化。
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    globals: Arc<Variables>,
    monitor: Arc<Variables>,
    locals: Variables,
}

impl VariableStore {
    pub fn new(globals: Arc<Variables>, monitor: Arc<Variables>) -> Self {
        Self {
            globals,
            monitor,
            locals: Variables::new(),
        }
    }

    pub fn with_locals(mut self, locals: Variables) -> Self {
        self.locals.extend(locals);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.locals
            .get(name)
            .or_else(|| self.monitor.get(name))
            .or_else(|| self.globals.get(name))
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).map(value_to_string)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 写入局部变量（例如正则命名捕获组）
    pub fn insert_local(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.locals.insert(name.into(), value.into());
    }

    pub fn locals(&self) -> &Variables {
        &self.locals
    }

    /// 展平为单层视图，上层覆盖下层
    pub fn merged(&self) -> Variables {
        let mut merged = (*self.globals).clone();
        merged.extend(self.monitor.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.extend(self.locals.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}
