use crate::message::NotifyConfig;
use anyhow::Result;
use async_trait::async_trait;

/// 通知结果
#[derive(Debug, Clone)]
pub struct NotifyResult {
    pub success: bool,
    pub message: String,
}

impl NotifyResult {
    pub fn success() -> Self {
        Self {
            success: true,
            message: "Notification sent successfully".to_string(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// 通知投递 trait：每次 flush 调用一次
#[async_trait]
pub trait Notifier: Send + Sync {
    /// 投递合并后的标题和内容
    async fn deliver(&self, config: &NotifyConfig, title: &str, body: &str) -> Result<NotifyResult>;

    /// 通知器名称
    fn name(&self) -> &str;
}
