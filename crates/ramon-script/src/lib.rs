use ramon_core::{value_to_string, RamonError, Result, Variables};
use rhai::{Dynamic, Engine, Scope, AST};
use std::collections::HashMap;
use std::sync::RwLock;

/// 表达式引擎：`if` 条件与 `{{ }}` 模板插值
pub struct ScriptEngine {
    engine: Engine,
    // 已编译的 `if` 表达式：id -> AST
    expr_cache: RwLock<HashMap<String, AST>>,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine {
    pub fn new() -> Self {
        let mut engine = Engine::new();

        // 限制最大操作数
        engine.set_max_operations(100_000);

        engine.register_fn("now_ms", || chrono::Utc::now().timestamp_millis());

        engine.on_print(|x| {
            tracing::info!("SCRIPT: {}", x);
        });

        Self {
            engine,
            expr_cache: RwLock::new(HashMap::new()),
        }
    }

    /// 编译布尔表达式，语法错误属于配置错误
    pub fn compile(&self, id: &str, expr: &str) -> Result<()> {
        let ast = self
            .engine
            .compile_expression(expr)
            .map_err(|e| RamonError::config(format!("invalid `if` expression {:?}: {}", expr, e)))?;

        let mut cache = self
            .expr_cache
            .write()
            .map_err(|e| RamonError::config(format!("Failed to acquire write lock: {}", e)))?;
        cache.insert(id.to_string(), ast);
        Ok(())
    }

    /// 求值已编译的表达式
    pub fn eval_bool(&self, id: &str, vars: &Variables) -> Result<bool> {
        let cache = self
            .expr_cache
            .read()
            .map_err(|e| RamonError::evaluation(format!("Failed to acquire read lock: {}", e)))?;
        let ast = cache
            .get(id)
            .ok_or_else(|| RamonError::NotFound(format!("expression `{}`", id)))?;

        let mut scope = build_scope(vars)?;
        self.engine
            .eval_ast_with_scope::<bool>(&mut scope, ast)
            .map_err(|e| RamonError::evaluation(format!("`if` evaluation failed: {}", e)))
    }

    pub fn remove(&self, id: &str) {
        match self.expr_cache.write() {
            Ok(mut cache) => {
                cache.remove(id);
            }
            Err(e) => {
                tracing::error!("Failed to acquire write lock in remove: {}", e);
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.expr_cache
            .read()
            .map(|cache| cache.contains_key(id))
            .unwrap_or(false)
    }

    /// 校验模板语法（只检查括号配对）
    pub fn check_template(&self, template: &str) -> Result<()> {
        split_template(template).map(|_| ())
    }

    /// 渲染模板：`{{ name }}` 直接查变量，其它内容按表达式求值
    pub fn render(&self, template: &str, vars: &Variables) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut scope: Option<Scope> = None;

        for segment in split_template(template)? {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(expr) if is_identifier(expr) => {
                    let value = vars
                        .get(expr)
                        .ok_or_else(|| RamonError::evaluation(format!("undefined variable `{}`", expr)))?;
                    out.push_str(&value_to_string(value));
                }
                Segment::Expr(expr) => {
                    if scope.is_none() {
                        scope = Some(build_scope(vars)?);
                    }
                    let scope = scope.as_mut().ok_or_else(|| RamonError::evaluation("scope unavailable"))?;
                    let value: Dynamic = self
                        .engine
                        .eval_expression_with_scope(scope, expr)
                        .map_err(|e| RamonError::evaluation(format!("template expression {:?} failed: {}", expr, e)))?;
                    out.push_str(&value.to_string());
                }
            }
        }

        Ok(out)
    }
}

enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

fn split_template(template: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| RamonError::config(format!("unterminated `{{{{` in template {:?}", template)))?;
        let expr = after[..end].trim();
        if expr.is_empty() {
            return Err(RamonError::config(format!("empty `{{{{ }}}}` in template {:?}", template)));
        }
        segments.push(Segment::Expr(expr));
        rest = &after[end + 2..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn build_scope(vars: &Variables) -> Result<Scope<'static>> {
    let mut scope = Scope::new();
    for (name, value) in vars {
        // 非法标识符无法在表达式中引用
        if !is_identifier(name) {
            continue;
        }
        let dynamic = rhai::serde::to_dynamic(value)
            .map_err(|e| RamonError::evaluation(format!("variable `{}`: {}", name, e)))?;
        scope.push_dynamic(name.as_str(), dynamic);
    }
    Ok(scope)
}
