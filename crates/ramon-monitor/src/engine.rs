use crate::dispatcher::{ActionDispatcher, ProcessSpawner};
use crate::model::{BuildContext, Condition, Monitor};
use crate::pipeline::{ConditionPipeline, PipelineOutcome};
use ramon_config::ConfigDocument;
use ramon_core::{EventSpec, Occurrence, RamonError, Result, SystemClock, Variables};
use ramon_notify::{AggregateMode, CronFlushScheduler, NotificationAggregator, Notifier, NotifyConfig};
use ramon_script::ScriptEngine;
use ramon_state::{CooldownTracker, StateSnapshot, UniqueCache, WindowCounter};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 引擎依赖，全部显式注入
pub struct EngineParts {
    pub uniques: Arc<UniqueCache>,
    pub windows: Arc<WindowCounter>,
    pub cooldowns: Arc<CooldownTracker>,
    pub script: Arc<ScriptEngine>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub aggregator: NotificationAggregator,
    /// 初始全局变量
    pub globals: Variables,
    /// 冷却与窗口快照文件，None 表示不持久化
    pub state_path: Option<PathBuf>,
    /// 每个监视器的队列容量
    pub queue_capacity: usize,
}

impl EngineParts {
    /// 状态仅保存在内存中
    pub fn in_memory(aggregator: NotificationAggregator, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            uniques: Arc::new(UniqueCache::in_memory()),
            windows: Arc::new(WindowCounter::new()),
            cooldowns: Arc::new(CooldownTracker::new()),
            script: Arc::new(ScriptEngine::new()),
            spawner,
            aggregator,
            globals: Variables::new(),
            state_path: None,
            queue_capacity: 256,
        }
    }
}

/// 一代监视器集合
struct Generation {
    id: u64,
    monitors: HashMap<String, Arc<Monitor>>,
    senders: HashMap<String, mpsc::Sender<Occurrence>>,
}

struct EngineInner {
    pipeline: ConditionPipeline,
    dispatcher: ActionDispatcher,
    globals: Arc<RwLock<Arc<Variables>>>,
    generation: RwLock<Arc<Generation>>,
    next_generation: AtomicU64,
    script: Arc<ScriptEngine>,
    aggregator: NotificationAggregator,
    uniques: Arc<UniqueCache>,
    windows: Arc<WindowCounter>,
    cooldowns: Arc<CooldownTracker>,
    state_path: Option<PathBuf>,
    queue_capacity: usize,
    // 每个监视器名称最近一个 worker，新 worker 等它退出后才开始消费
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
    cron: tokio::sync::Mutex<Option<CronFlushScheduler>>,
}

/// 监视器引擎
///
/// 每个监视器一个 worker 任务和一个有界队列：同一监视器的事件按提交顺序处理，
/// 不同监视器之间互不阻塞。需要在 tokio 运行时中创建。
#[derive(Clone)]
pub struct MonitorEngine {
    inner: Arc<EngineInner>,
}

impl MonitorEngine {
    /// 创建引擎并安装第一代监视器
    pub fn new(parts: EngineParts, monitors: Vec<Monitor>) -> Result<Self> {
        let globals = Arc::new(RwLock::new(Arc::new(parts.globals)));
        let pipeline = ConditionPipeline::new(
            parts.uniques.clone(),
            parts.windows.clone(),
            parts.cooldowns.clone(),
            parts.script.clone(),
        );
        let dispatcher = ActionDispatcher::new(
            parts.script.clone(),
            parts.spawner,
            parts.aggregator.clone(),
            parts.cooldowns.clone(),
            globals.clone(),
        );

        let engine = Self {
            inner: Arc::new(EngineInner {
                pipeline,
                dispatcher,
                globals,
                generation: RwLock::new(Arc::new(Generation {
                    id: 0,
                    monitors: HashMap::new(),
                    senders: HashMap::new(),
                })),
                next_generation: AtomicU64::new(0),
                script: parts.script,
                aggregator: parts.aggregator,
                uniques: parts.uniques,
                windows: parts.windows,
                cooldowns: parts.cooldowns,
                state_path: parts.state_path,
                queue_capacity: parts.queue_capacity.max(1),
                workers: Mutex::new(HashMap::new()),
                cron: tokio::sync::Mutex::new(None),
            }),
        };

        engine.replace_monitors(monitors)?;
        Ok(engine)
    }

    /// 从配置文档创建引擎：恢复持久化状态、注册通知配置、构建监视器并启动 cron 聚合
    pub async fn from_config(
        doc: &ConfigDocument,
        notifier: Arc<dyn Notifier>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Result<Self> {
        let (notify_configs, monitors) = build_generation(doc)?;

        let state_dir = doc.engine.state_dir.clone();
        let state_path = state_dir.join("state.json");
        let windows = Arc::new(WindowCounter::new());
        let cooldowns = Arc::new(CooldownTracker::new());
        match StateSnapshot::load(&state_path) {
            Ok(snapshot) => {
                debug!(
                    cooldowns = snapshot.cooldowns.len(),
                    windows = snapshot.windows.len(),
                    "Engine state restored"
                );
                cooldowns.restore(snapshot.cooldowns);
                windows.restore(snapshot.windows);
            }
            Err(e) => warn!(path = %state_path.display(), error = %e, "Ignoring unreadable engine state"),
        }

        let aggregator =
            NotificationAggregator::with_limiter(notifier, Arc::new(SystemClock), windows.clone());
        for config in notify_configs {
            aggregator.register(config);
        }

        let parts = EngineParts {
            uniques: Arc::new(UniqueCache::persistent(state_dir.join("unique"))),
            windows,
            cooldowns,
            script: Arc::new(ScriptEngine::new()),
            spawner,
            aggregator,
            globals: doc.var.clone(),
            state_path: Some(state_path),
            queue_capacity: doc.engine.queue_capacity,
        };
        let engine = Self::new(parts, monitors)?;

        let configs: Vec<Arc<NotifyConfig>> = engine
            .inner
            .aggregator
            .config_names()
            .iter()
            .filter_map(|name| engine.inner.aggregator.config(name))
            .collect();
        let scheduler = engine.build_cron(configs.iter().map(|c| c.as_ref())).await?;
        engine.install_cron(scheduler).await?;
        Ok(engine)
    }

    /// 重新加载配置：全部校验通过后才替换通知配置、cron 任务、全局变量和监视器
    pub async fn apply_config(&self, doc: &ConfigDocument) -> Result<u64> {
        let (notify_configs, monitors) = build_generation(doc)?;
        validate_monitors(&monitors)?;
        let scheduler = self.build_cron(notify_configs.iter()).await?;

        self.inner.aggregator.replace_configs(notify_configs);
        self.install_cron(scheduler).await?;
        {
            let mut globals = self.inner.globals.write().unwrap_or_else(|e| e.into_inner());
            *globals = Arc::new(doc.var.clone());
        }
        self.replace_monitors(monitors)
    }

    /// 原子地安装新一代监视器
    ///
    /// 同名监视器的新 worker 等旧 worker 处理完队列后才开始消费，
    /// 同一监视器的事件始终按提交顺序串行处理。
    pub fn replace_monitors(&self, monitors: Vec<Monitor>) -> Result<u64> {
        validate_monitors(&monitors)?;

        // 串行化并发的替换
        let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());

        let id = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let monitors: Vec<Monitor> = monitors
            .into_iter()
            .map(|mut monitor| {
                monitor.generation = id;
                monitor
            })
            .collect();
        self.compile_scripts(&monitors)?;

        let mut generation = Generation {
            id,
            monitors: HashMap::new(),
            senders: HashMap::new(),
        };
        for monitor in monitors {
            let monitor = Arc::new(monitor);
            let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
            let previous = workers.remove(&monitor.name);
            let handle = tokio::spawn(run_worker(Arc::downgrade(&self.inner), monitor.clone(), rx, previous));
            workers.insert(monitor.name.clone(), handle);
            generation.senders.insert(monitor.name.clone(), tx);
            generation.monitors.insert(monitor.name.clone(), monitor);
        }
        // 已移除的监视器保留未结束的 worker，重新加入时仍需等待
        workers.retain(|name, handle| generation.monitors.contains_key(name) || !handle.is_finished());

        let count = generation.monitors.len();
        let previous = {
            let mut current = self.inner.generation.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, Arc::new(generation))
        };
        drop(workers);

        info!(generation = id, monitors = count, replaced = previous.id, "Monitor generation installed");
        Ok(id)
    }

    fn compile_scripts(&self, monitors: &[Monitor]) -> Result<()> {
        let mut compiled: Vec<String> = Vec::new();
        for monitor in monitors {
            for condition in &monitor.conditions {
                if let Condition::If(expr) = condition {
                    let id = monitor.if_script_id();
                    if let Err(e) = self.inner.script.compile(&id, expr) {
                        for id in &compiled {
                            self.inner.script.remove(id);
                        }
                        return Err(e);
                    }
                    compiled.push(id);
                }
            }
        }
        Ok(())
    }

    /// 为 Cron 聚合的通知配置创建调度器（尚未启动）；没有 Cron 配置时返回 None
    async fn build_cron<'a>(
        &self,
        configs: impl Iterator<Item = &'a NotifyConfig>,
    ) -> Result<Option<CronFlushScheduler>> {
        let configs: Vec<&NotifyConfig> = configs
            .filter(|c| matches!(c.aggregate, AggregateMode::Cron(_)))
            .collect();
        if configs.is_empty() {
            return Ok(None);
        }

        let mut scheduler = CronFlushScheduler::new().await?;
        for config in configs {
            scheduler.schedule_config(&self.inner.aggregator, config).await?;
        }
        Ok(Some(scheduler))
    }

    /// 停止旧调度器并启动新调度器
    async fn install_cron(&self, scheduler: Option<CronFlushScheduler>) -> Result<()> {
        let mut slot = self.inner.cron.lock().await;
        if let Some(mut old) = slot.take() {
            if let Err(e) = old.shutdown().await {
                warn!(error = %e, "Failed to stop cron flush scheduler");
            }
        }
        if let Some(scheduler) = scheduler {
            scheduler.start().await?;
            *slot = Some(scheduler);
        }
        Ok(())
    }

    /// 当前 cron flush 任务数
    pub async fn cron_jobs(&self) -> usize {
        let slot = self.inner.cron.lock().await;
        slot.as_ref().map(CronFlushScheduler::job_count).unwrap_or(0)
    }

    /// 提交一次事件发生；队列满时等待
    pub async fn submit_occurrence(&self, occurrence: Occurrence) -> Result<()> {
        let sender = self
            .inner
            .current()
            .senders
            .get(&occurrence.monitor)
            .cloned()
            .ok_or_else(|| RamonError::NotFound(format!("monitor `{}`", occurrence.monitor)))?;
        sender.send(occurrence).await?;
        Ok(())
    }

    /// 同步处理一次事件发生（worker 使用）
    pub fn on_occurrence(&self, monitor: &Monitor, occurrence: Occurrence) -> PipelineOutcome {
        self.inner.on_occurrence(monitor, occurrence)
    }

    /// 事件源需要订阅的 (监视器, 事件)
    pub fn subscriptions(&self) -> Vec<(String, EventSpec)> {
        let generation = self.inner.current();
        let mut subscriptions: Vec<(String, EventSpec)> = generation
            .monitors
            .values()
            .flat_map(|m| m.events.iter().map(move |e| (m.name.clone(), e.clone())))
            .collect();
        subscriptions.sort_by(|a, b| a.0.cmp(&b.0));
        subscriptions
    }

    pub fn monitor(&self, name: &str) -> Option<Arc<Monitor>> {
        self.inner.current().monitors.get(name).cloned()
    }

    pub fn monitor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.current().monitors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn generation(&self) -> u64 {
        self.inner.current().id
    }

    /// 全局变量快照
    pub fn globals(&self) -> Arc<Variables> {
        self.inner.globals_snapshot()
    }

    pub fn aggregator(&self) -> &NotificationAggregator {
        &self.inner.aggregator
    }

    /// 清除唯一值记录，返回清除条数
    pub fn clear_unique(&self, monitor: &str, var: Option<&str>) -> usize {
        self.inner.uniques.clear(monitor, var)
    }

    /// 保存冷却与窗口快照
    pub fn persist_state(&self) -> Result<()> {
        self.inner.persist_state()
    }

    /// 定期保存状态，引擎释放后任务自动结束
    pub fn spawn_persist_task(&self, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = engine.upgrade() else {
                    break;
                };
                if let Err(e) = inner.persist_state() {
                    warn!(error = %e, "Failed to persist engine state");
                }
            }
        })
    }

    /// 关闭前停止 cron 任务、flush 所有聚合桶并保存状态
    pub async fn shutdown(&self) -> Result<()> {
        self.install_cron(None).await?;
        let flushed = self.inner.aggregator.flush_all();
        info!(buckets = flushed, "Engine shutting down");
        self.inner.persist_state()
    }
}

impl EngineInner {
    fn current(&self) -> Arc<Generation> {
        self.generation.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn globals_snapshot(&self) -> Arc<Variables> {
        self.globals.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn on_occurrence(&self, monitor: &Monitor, occurrence: Occurrence) -> PipelineOutcome {
        let outcome = self
            .pipeline
            .evaluate(monitor, &occurrence, self.globals_snapshot());

        if let PipelineOutcome::Pass(vars) = &outcome {
            info!(monitor = %monitor.name, kind = ?occurrence.kind, "Monitor triggered");
            self.dispatcher.run(monitor, vars, occurrence.timestamp);
        }
        outcome
    }

    fn persist_state(&self) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let snapshot = StateSnapshot {
            cooldowns: self.cooldowns.snapshot(),
            windows: self.windows.snapshot(),
        };
        snapshot.save(path)?;
        debug!(path = %path.display(), "Engine state saved");
        Ok(())
    }
}

async fn run_worker(
    engine: Weak<EngineInner>,
    monitor: Arc<Monitor>,
    mut rx: mpsc::Receiver<Occurrence>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            warn!(monitor = %monitor.name, error = %e, "Previous monitor worker failed");
        }
    }

    debug!(monitor = %monitor.name, generation = monitor.generation, "Monitor worker started");
    while let Some(occurrence) = rx.recv().await {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.on_occurrence(&monitor, occurrence);
    }

    // 队列已排空，本代的 `if` 表达式不再需要
    if let Some(engine) = engine.upgrade() {
        engine.script.remove(&monitor.if_script_id());
    }
    debug!(monitor = %monitor.name, generation = monitor.generation, "Monitor worker stopped");
}

/// 名称唯一，`if` 表达式可编译
fn validate_monitors(monitors: &[Monitor]) -> Result<()> {
    let scratch = ScriptEngine::new();
    let mut names = HashSet::new();
    for monitor in monitors {
        if !names.insert(monitor.name.as_str()) {
            return Err(RamonError::config(format!("duplicate monitor `{}`", monitor.name)));
        }
        for condition in &monitor.conditions {
            if let Condition::If(expr) = condition {
                scratch.compile(&monitor.if_script_id(), expr)?;
            }
        }
    }
    Ok(())
}

fn build_generation(doc: &ConfigDocument) -> Result<(Vec<NotifyConfig>, Vec<Monitor>)> {
    let notify_configs = doc
        .notify
        .iter()
        .map(|(name, def)| NotifyConfig::from_def(name, def))
        .collect::<Result<Vec<_>>>()?;

    let scratch = ScriptEngine::new();
    let ctx = BuildContext {
        script: &scratch,
        notify_configs: notify_configs.iter().map(|c| c.name.clone()).collect(),
    };
    let monitors = doc
        .monitor
        .iter()
        .map(|(name, def)| Monitor::from_def(name, def, &ctx))
        .collect::<Result<Vec<_>>>()?;
    Ok((notify_configs, monitors))
}
