use crate::aggregator::NotificationAggregator;
use crate::message::{AggregateMode, NotifyConfig};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

/// cron 聚合调度器：按每个 Cron 配置的表达式 flush 对应聚合桶
pub struct CronFlushScheduler {
    scheduler: JobScheduler,
    jobs: usize,
}

impl CronFlushScheduler {
    /// 创建调度器
    pub async fn new() -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self { scheduler, jobs: 0 })
    }

    /// 为已注册的配置添加 flush 任务；非 Cron 配置返回 false
    pub async fn schedule(
        &mut self,
        aggregator: &NotificationAggregator,
        config_name: &str,
    ) -> anyhow::Result<bool> {
        let Some(config) = aggregator.config(config_name) else {
            return Err(anyhow::anyhow!("unknown notify config `{}`", config_name));
        };
        self.schedule_config(aggregator, &config).await
    }

    /// 为给定配置添加 flush 任务，配置可以尚未注册（重载时先建任务再替换配置）
    pub async fn schedule_config(
        &mut self,
        aggregator: &NotificationAggregator,
        config: &NotifyConfig,
    ) -> anyhow::Result<bool> {
        let AggregateMode::Cron(expr) = &config.aggregate else {
            return Ok(false);
        };

        let aggregator = aggregator.clone();
        let name = config.name.clone();
        let job = Job::new_async(expr.as_str(), move |_uuid, _lock| {
            let aggregator = aggregator.clone();
            let name = name.clone();

            Box::pin(async move {
                let flushed = aggregator.flush_config(&name);
                debug!(config = %name, buckets = flushed, "Cron flush");
            })
        })?;

        self.scheduler.add(job).await?;
        self.jobs += 1;
        info!(config = %config.name, cron = %expr, "Cron aggregation scheduled");
        Ok(true)
    }

    /// 为所有 Cron 配置添加任务，返回任务数
    pub async fn schedule_all(&mut self, aggregator: &NotificationAggregator) -> anyhow::Result<usize> {
        let mut scheduled = 0;
        for name in aggregator.config_names() {
            if self.schedule(aggregator, &name).await? {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    pub fn job_count(&self) -> usize {
        self.jobs
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.start().await?;
        info!(jobs = self.jobs, "Cron flush scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.scheduler.shutdown().await?;
        info!("Cron flush scheduler stopped");
        Ok(())
    }
}
