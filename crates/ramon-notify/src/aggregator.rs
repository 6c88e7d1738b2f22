use crate::message::{AggregateMode, Notification, NotifyConfig};
use crate::notifier::Notifier;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ramon_core::{Clock, RamonError, Result};
use ramon_state::WindowCounter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 限流计数在共享 WindowCounter 中的键前缀
const LIMIT_KEY_PREFIX: &str = "notify:";

/// (通知配置, 通知 id)
type BucketKey = (String, String);

/// 聚合桶
struct Bucket {
    items: Vec<Notification>,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Bucket {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            items: Vec::new(),
            first: now,
            last: now,
            generation: 0,
            timer: None,
        }
    }

    fn push(&mut self, notification: Notification, now: DateTime<Utc>) {
        self.items.push(notification);
        self.last = now;
    }
}

/// 待投递消息
struct Outgoing {
    config: Arc<NotifyConfig>,
    title: String,
    body: String,
}

/// 投递侧共享状态（出队 worker 持有）
struct Delivery {
    notifier: Arc<dyn Notifier>,
    limiter: Arc<WindowCounter>,
    clock: Arc<dyn Clock>,
    queued: AtomicUsize,
}

struct Inner {
    configs: RwLock<HashMap<String, Arc<NotifyConfig>>>,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
    outboxes: Mutex<HashMap<String, mpsc::UnboundedSender<Outgoing>>>,
    delivery: Arc<Delivery>,
}

/// 通知聚合器
///
/// 每个 (配置, id) 一个聚合桶。Debounce 模式下每个桶最多一个定时 flush，
/// 重新调度时替换旧定时器；Cron 模式由 [`crate::CronFlushScheduler`] 调用
/// [`NotificationAggregator::flush_config`]。每个配置一条出队 worker 按 FIFO 投递，
/// 超过 `limit` 的消息延后到窗口放行时间，不丢弃。
///
/// 需要在 tokio 运行时中调用。
#[derive(Clone)]
pub struct NotificationAggregator {
    inner: Arc<Inner>,
}

impl NotificationAggregator {
    pub fn new(notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self::with_limiter(notifier, clock, Arc::new(WindowCounter::new()))
    }

    /// 使用共享的窗口计数器（便于随引擎状态一起持久化）
    pub fn with_limiter(
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        limiter: Arc<WindowCounter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                configs: RwLock::new(HashMap::new()),
                buckets: Mutex::new(HashMap::new()),
                outboxes: Mutex::new(HashMap::new()),
                delivery: Arc::new(Delivery {
                    notifier,
                    limiter,
                    clock,
                    queued: AtomicUsize::new(0),
                }),
            }),
        }
    }

    /// 注册（或替换）通知配置
    pub fn register(&self, config: NotifyConfig) {
        let mut configs = self.inner.configs.write().unwrap_or_else(|e| e.into_inner());
        info!(config = %config.name, aggregate = ?config.aggregate, "Notify config registered");
        configs.insert(config.name.clone(), Arc::new(config));
    }

    /// 整体替换配置；被移除配置的缓冲先 flush
    pub fn replace_configs(&self, configs: Vec<NotifyConfig>) {
        let removed: Vec<String> = {
            let current = self.inner.configs.read().unwrap_or_else(|e| e.into_inner());
            current
                .keys()
                .filter(|name| !configs.iter().any(|c| &c.name == *name))
                .cloned()
                .collect()
        };
        for name in &removed {
            self.flush_config(name);
        }

        {
            let mut current = self.inner.configs.write().unwrap_or_else(|e| e.into_inner());
            current.clear();
            for config in configs {
                current.insert(config.name.clone(), Arc::new(config));
            }
        }

        // 关闭发送端后 worker 投递完剩余消息即退出
        let mut outboxes = self.inner.outboxes.lock().unwrap_or_else(|e| e.into_inner());
        for name in &removed {
            if outboxes.remove(name).is_some() {
                debug!(config = %name, "Outbox released");
            }
        }
    }

    /// 当前存活的出队 worker 数量
    pub fn outbox_count(&self) -> usize {
        self.inner.outboxes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn config(&self, name: &str) -> Option<Arc<NotifyConfig>> {
        self.inner.config(name)
    }

    pub fn config_names(&self) -> Vec<String> {
        let configs = self.inner.configs.read().unwrap_or_else(|e| e.into_inner());
        configs.keys().cloned().collect()
    }

    /// 提交一条通知
    pub fn submit(&self, notification: Notification) -> Result<()> {
        let config = self
            .inner
            .config(&notification.config)
            .ok_or_else(|| RamonError::NotFound(format!("notify config `{}`", notification.config)))?;
        let now = self.inner.delivery.clock.now();

        match &config.aggregate {
            AggregateMode::None => {
                self.inner.enqueue(&config, notification.title, notification.body);
            }
            AggregateMode::Debounce(quiet) => {
                buffer_debounced(&self.inner, &config, notification, *quiet, now);
            }
            AggregateMode::Cron(_) => {
                let key = (config.name.clone(), notification.id.clone());
                let mut buckets = self.inner.lock_buckets();
                buckets
                    .entry(key)
                    .or_insert_with(|| Bucket::new(now))
                    .push(notification, now);
            }
        }
        Ok(())
    }

    /// 立即 flush 某个配置下所有聚合桶，返回 flush 的桶数
    pub fn flush_config(&self, name: &str) -> usize {
        let drained: Vec<(String, Bucket)> = {
            let mut buckets = self.inner.lock_buckets();
            let keys: Vec<BucketKey> = buckets.keys().filter(|(c, _)| c == name).cloned().collect();
            keys.into_iter()
                .filter_map(|key| buckets.remove(&key).map(|bucket| (key.1, bucket)))
                .collect()
        };

        let Some(config) = self.inner.config(name) else {
            if !drained.is_empty() {
                warn!(config = %name, buckets = drained.len(), "Dropping buffered notifications of unknown config");
            }
            return 0;
        };

        let flushed = drained.len();
        for (id, mut bucket) in drained {
            if let Some(timer) = bucket.timer.take() {
                timer.abort();
            }
            self.inner.flush_bucket(&config, &id, bucket);
        }
        if flushed > 0 {
            debug!(config = %name, buckets = flushed, "Flushed notify config");
        }
        flushed
    }

    /// flush 所有配置（关闭时使用）
    pub fn flush_all(&self) -> usize {
        self.config_names()
            .iter()
            .map(|name| self.flush_config(name))
            .sum()
    }

    /// 仍在缓冲或等待投递的通知数量
    pub fn pending(&self) -> usize {
        let buffered: usize = self.inner.lock_buckets().values().map(|b| b.items.len()).sum();
        buffered + self.inner.delivery.queued.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn config(&self, name: &str) -> Option<Arc<NotifyConfig>> {
        let configs = self.configs.read().unwrap_or_else(|e| e.into_inner());
        configs.get(name).cloned()
    }

    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<BucketKey, Bucket>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 只有定时器的代数与桶一致时才 flush，避免重复发送
    fn flush_if_current(&self, key: &BucketKey, generation: u64) {
        let bucket = {
            let mut buckets = self.lock_buckets();
            match buckets.get(key) {
                Some(bucket) if bucket.generation == generation => buckets.remove(key),
                _ => None,
            }
        };

        if let Some(mut bucket) = bucket {
            // 当前任务就是该定时器
            bucket.timer.take();
            match self.config(&key.0) {
                Some(config) => self.flush_bucket(&config, &key.1, bucket),
                None => warn!(config = %key.0, id = %key.1, "Notify config vanished before flush"),
            }
        }
    }

    fn flush_bucket(&self, config: &Arc<NotifyConfig>, id: &str, bucket: Bucket) {
        debug!(
            config = %config.name,
            id = %id,
            count = bucket.items.len(),
            first = %bucket.first,
            last = %bucket.last,
            "Flushing aggregation bucket"
        );
        if bucket.items.is_empty() {
            return;
        }
        let (title, body) = combine(id, &bucket.items);
        self.enqueue(config, title, body);
    }

    /// 交给配置对应的出队 worker（按需创建）
    fn enqueue(&self, config: &Arc<NotifyConfig>, title: String, body: String) {
        let mut outboxes = self.outboxes.lock().unwrap_or_else(|e| e.into_inner());
        let sender = outboxes.entry(config.name.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_outbox(config.name.clone(), self.delivery.clone(), rx));
            tx
        });

        self.delivery.queued.fetch_add(1, Ordering::SeqCst);
        let outgoing = Outgoing {
            config: config.clone(),
            title,
            body,
        };
        if let Err(e) = sender.send(outgoing) {
            self.delivery.queued.fetch_sub(1, Ordering::SeqCst);
            error!(config = %config.name, title = %e.0.title, "Outbox closed, notification lost");
        }
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(36500))
}

/// 防抖缓冲：截止时间为 min(now + quiet, first + timeout)
fn buffer_debounced(
    inner: &Arc<Inner>,
    config: &Arc<NotifyConfig>,
    notification: Notification,
    quiet: Duration,
    now: DateTime<Utc>,
) {
    let key = (config.name.clone(), notification.id.clone());
    let mut buckets = inner.lock_buckets();
    let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket::new(now));
    bucket.push(notification, now);

    let timeout = config.aggregate_timeout.map(to_chrono);
    if let Some(timeout) = timeout {
        if now - bucket.first >= timeout {
            let expired = buckets.remove(&key);
            drop(buckets);
            if let Some(mut bucket) = expired {
                if let Some(timer) = bucket.timer.take() {
                    timer.abort();
                }
                debug!(config = %key.0, id = %key.1, "Aggregation timeout reached");
                inner.flush_bucket(config, &key.1, bucket);
            }
            return;
        }
    }

    let mut deadline = now + to_chrono(quiet);
    if let Some(timeout) = timeout {
        deadline = deadline.min(bucket.first + timeout);
    }

    if let Some(old) = bucket.timer.take() {
        old.abort();
    }
    bucket.generation += 1;
    let generation = bucket.generation;
    let delay = (deadline - now).to_std().unwrap_or_default();
    let timer_inner = inner.clone();
    bucket.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        timer_inner.flush_if_current(&key, generation);
    }));
}

/// 合并通知：单条原样发送，多条合并标题与内容
pub fn combine(id: &str, items: &[Notification]) -> (String, String) {
    if let [single] = items {
        return (single.title.clone(), single.body.clone());
    }

    let title = format!("{}: {} notifications", id, items.len());
    let body = items
        .iter()
        .map(|n| format!("{}\n{}", n.title, n.body))
        .collect::<Vec<_>>()
        .join("\n\n");
    (title, body)
}

/// 出队 worker：按 FIFO 投递，超过限流时等待到放行时间
async fn run_outbox(name: String, delivery: Arc<Delivery>, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    let limit_key = format!("{}{}", LIMIT_KEY_PREFIX, name);

    while let Some(outgoing) = rx.recv().await {
        if let Some(limit) = outgoing.config.limit {
            loop {
                let now = delivery.clock.now();
                match delivery
                    .limiter
                    .try_acquire(&limit_key, limit.count as usize, limit.period, now)
                {
                    Ok(()) => break,
                    Err(next) => {
                        info!(config = %name, until = %next, "Rate limit reached, deferring notification");
                        let wait = (next - now)
                            .to_std()
                            .unwrap_or(Duration::from_millis(1))
                            .max(Duration::from_millis(1));
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        let Outgoing { config, title, body } = outgoing;
        match delivery.notifier.deliver(&config, &title, &body).await {
            Ok(result) if result.success => {
                info!(config = %name, notifier = %delivery.notifier.name(), title = %title, "Notification sent");
            }
            Ok(result) => {
                error!(config = %name, notifier = %delivery.notifier.name(), error = %result.message, "Notification failed");
            }
            Err(e) => {
                error!(config = %name, notifier = %delivery.notifier.name(), error = %e, "Notification error");
            }
        }
        delivery.queued.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(config = %name, "Outbox closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NotifyResult;
    use async_trait::async_trait;
    use ramon_core::{ManualClock, Rate, TokioClock};

    /// 记录投递内容与时间
    struct RecordingNotifier {
        clock: Arc<dyn Clock>,
        sent: Mutex<Vec<(DateTime<Utc>, String, String)>>,
    }

    impl RecordingNotifier {
        fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
            Arc::new(Self {
                clock,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(DateTime<Utc>, String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn deliver(&self, _config: &NotifyConfig, title: &str, body: &str) -> anyhow::Result<NotifyResult> {
            self.sent
                .lock()
                .unwrap()
                .push((self.clock.now(), title.to_string(), body.to_string()));
            Ok(NotifyResult::success())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn setup(config: NotifyConfig) -> (NotificationAggregator, Arc<RecordingNotifier>, Arc<TokioClock>) {
        let clock = Arc::new(TokioClock::new());
        let notifier = RecordingNotifier::new(clock.clone());
        let aggregator = NotificationAggregator::new(notifier.clone(), clock.clone());
        aggregator.register(config);
        (aggregator, notifier, clock)
    }

    fn note(title: &str) -> Notification {
        Notification::new("disk", title, format!("{} body", title), "info")
    }

    async fn sleep_secs(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[test]
    fn test_combine_single_is_sent_as_is() {
        let items = vec![note("a")];
        assert_eq!(combine("disk", &items), ("a".to_string(), "a body".to_string()));
    }

    #[test]
    fn test_combine_multiple() {
        let items = vec![note("a"), note("b")];
        let (title, body) = combine("disk", &items);
        assert_eq!(title, "disk: 2 notifications");
        assert_eq!(body, "a\na body\n\nb\nb body");
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_delivery_without_aggregate() {
        let (aggregator, notifier, _) = setup(NotifyConfig::log_only("info"));
        aggregator.submit(note("a")).unwrap();
        sleep_secs(1).await;

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "a");
        assert_eq!(aggregator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_config_is_rejected() {
        let (aggregator, _, _) = setup(NotifyConfig::log_only("info"));
        let result = aggregator.submit(Notification::new("x", "t", "b", "missing"));
        assert!(matches!(result, Err(RamonError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_flushes_after_quiet_period() {
        let config = NotifyConfig::log_only("info")
            .with_debounce(Duration::from_secs(10), Some(Duration::from_secs(60)));
        let (aggregator, notifier, clock) = setup(config);
        let start = clock.now();

        aggregator.submit(note("a")).unwrap();
        sleep_secs(5).await;
        aggregator.submit(note("b")).unwrap();
        sleep_secs(3).await;
        aggregator.submit(note("c")).unwrap();

        sleep_secs(9).await;
        assert!(notifier.sent().is_empty());
        assert_eq!(aggregator.pending(), 3);

        sleep_secs(2).await;
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, start + ChronoDuration::seconds(18));
        assert_eq!(sent[0].1, "disk: 3 notifications");
        assert_eq!(aggregator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_timeout_caps_debounce() {
        let config = NotifyConfig::log_only("info")
            .with_debounce(Duration::from_secs(10), Some(Duration::from_secs(30)));
        let (aggregator, notifier, clock) = setup(config);
        let start = clock.now();

        // 每 4s 一条，静默期永远不会到达
        for i in 0..8 {
            aggregator.submit(note(&format!("n{}", i))).unwrap();
            sleep_secs(4).await;
        }

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, start + ChronoDuration::seconds(30));
        assert_eq!(sent[0].1, "disk: 8 notifications");
        assert_eq!(aggregator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_after_timeout_flushes_immediately() {
        let clock = Arc::new(ManualClock::default());
        let notifier = RecordingNotifier::new(clock.clone());
        let aggregator = NotificationAggregator::new(notifier.clone(), clock.clone());
        aggregator.register(
            NotifyConfig::log_only("info")
                .with_debounce(Duration::from_secs(10), Some(Duration::from_secs(30))),
        );

        aggregator.submit(note("a")).unwrap();
        // 定时器尚未触发，但聚合已超时
        clock.advance(Duration::from_secs(30));
        aggregator.submit(note("b")).unwrap();
        assert_eq!(aggregator.inner.lock_buckets().len(), 0);

        sleep_secs(60).await;
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "disk: 2 notifications");
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_are_per_id() {
        let config = NotifyConfig::log_only("info").with_debounce(Duration::from_secs(10), None);
        let (aggregator, notifier, _) = setup(config);

        aggregator.submit(note("a")).unwrap();
        aggregator
            .submit(Notification::new("cpu", "load", "high", "info"))
            .unwrap();
        sleep_secs(11).await;

        let mut titles: Vec<String> = notifier.sent().into_iter().map(|s| s.1).collect();
        titles.sort();
        assert_eq!(titles, vec!["a".to_string(), "load".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cron_buckets_flush_on_demand() {
        let config = NotifyConfig::log_only("info").with_cron("0 0 9 * * *");
        let (aggregator, notifier, _) = setup(config);

        aggregator.submit(note("a")).unwrap();
        aggregator.submit(note("b")).unwrap();
        sleep_secs(3600).await;
        assert!(notifier.sent().is_empty());

        assert_eq!(aggregator.flush_config("info"), 1);
        sleep_secs(1).await;
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "disk: 2 notifications");
        assert_eq!(aggregator.flush_config("info"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_defers_instead_of_dropping() {
        let config = NotifyConfig::log_only("info").with_limit(Rate::new(10, Duration::from_secs(60)));
        let (aggregator, notifier, clock) = setup(config);
        let start = clock.now();

        for i in 0..11 {
            aggregator.submit(note(&format!("n{}", i))).unwrap();
        }
        sleep_secs(1).await;
        assert_eq!(notifier.sent().len(), 10);
        assert_eq!(aggregator.pending(), 1);

        sleep_secs(60).await;
        let sent = notifier.sent();
        assert_eq!(sent.len(), 11);
        assert_eq!(sent[10].1, "n10");
        assert!(sent[10].0 >= start + ChronoDuration::seconds(60));
        assert_eq!(aggregator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_on_shutdown() {
        let config = NotifyConfig::log_only("info").with_debounce(Duration::from_secs(600), None);
        let (aggregator, notifier, _) = setup(config);

        aggregator.submit(note("a")).unwrap();
        assert_eq!(aggregator.flush_all(), 1);
        sleep_secs(1).await;
        assert_eq!(notifier.sent().len(), 1);

        // 被取消的定时器不会再次发送
        sleep_secs(700).await;
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_config_releases_outbox() {
        let (aggregator, notifier, _) = setup(NotifyConfig::log_only("info"));
        aggregator.register(NotifyConfig::log_only("ops").with_debounce(Duration::from_secs(600), None));

        aggregator.submit(note("a")).unwrap();
        aggregator
            .submit(Notification::new("disk", "buffered", "", "ops"))
            .unwrap();
        sleep_secs(1).await;
        assert_eq!(aggregator.outbox_count(), 1);

        // 被移除配置的缓冲先投递，随后释放对应 worker
        aggregator.replace_configs(vec![NotifyConfig::log_only("info")]);
        assert_eq!(aggregator.outbox_count(), 1);
        sleep_secs(1).await;

        let titles: Vec<String> = notifier.sent().into_iter().map(|s| s.1).collect();
        assert_eq!(titles, vec!["a".to_string(), "buffered".to_string()]);
        assert_eq!(aggregator.pending(), 0);

        aggregator.replace_configs(vec![]);
        assert_eq!(aggregator.outbox_count(), 0);
    }
}
