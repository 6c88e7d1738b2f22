use crate::message::{DeliveryTarget, NotifyConfig};
use crate::notifier::{Notifier, NotifyResult};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::info;

// ============================================================================
// 邮件通知
// ============================================================================

/// SMTP 邮件：配置了 host 时走 STARTTLS，否则使用本机未加密 SMTP
#[derive(Debug, Default)]
pub struct EmailNotifier;

impl EmailNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn deliver(&self, config: &NotifyConfig, title: &str, body: &str) -> Result<NotifyResult> {
        use lettre::message::header::ContentType;
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

        let DeliveryTarget::Smtp {
            from,
            to,
            host,
            username,
            password,
        } = &config.target
        else {
            return Err(anyhow!("notify config `{}` has no smtp target", config.name));
        };

        let email = Message::builder()
            .from(from.parse()?)
            .to(to.parse()?)
            .subject(title)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;

        let mailer = match host {
            Some(host) => {
                let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?;
                if let (Some(username), Some(password)) = (username, password) {
                    builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
                }
                builder.build()
            }
            None => AsyncSmtpTransport::<Tokio1Executor>::unencrypted_localhost(),
        };

        match mailer.send(email).await {
            Ok(_) => Ok(NotifyResult::success()),
            Err(e) => Ok(NotifyResult::failure(format!("Email send failed: {}", e))),
        }
    }

    fn name(&self) -> &str {
        "email"
    }
}

// ============================================================================
// PushBullet 通知
// ============================================================================

const PUSHBULLET_URL: &str = "https://api.pushbullet.com/v2/pushes";

pub struct PushBulletNotifier {
    client: reqwest::Client,
    url: String,
}

impl PushBulletNotifier {
    pub fn new() -> Self {
        Self::with_url(PUSHBULLET_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    fn build_message(title: &str, body: &str) -> serde_json::Value {
        serde_json::json!({
            "type": "note",
            "title": title,
            "body": body,
        })
    }
}

impl Default for PushBulletNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for PushBulletNotifier {
    async fn deliver(&self, config: &NotifyConfig, title: &str, body: &str) -> Result<NotifyResult> {
        let DeliveryTarget::PushBullet { token } = &config.target else {
            return Err(anyhow!("notify config `{}` has no pushbullet target", config.name));
        };

        let response = self
            .client
            .post(&self.url)
            .header("Access-Token", token)
            .json(&Self::build_message(title, body))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(NotifyResult::success())
        } else {
            Ok(NotifyResult::failure(format!(
                "PushBullet failed: {}",
                response.status()
            )))
        }
    }

    fn name(&self) -> &str {
        "pushbullet"
    }
}

// ============================================================================
// 日志通知
// ============================================================================

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, config: &NotifyConfig, title: &str, body: &str) -> Result<NotifyResult> {
        info!(config = %config.name, title = %title, body = %body, "Notification");
        Ok(NotifyResult::success())
    }

    fn name(&self) -> &str {
        "log"
    }
}

// ============================================================================
// 按目标分发
// ============================================================================

/// 根据 NotifyConfig 的投递目标选择通知器
#[derive(Default)]
pub struct TargetRouter {
    email: EmailNotifier,
    pushbullet: PushBulletNotifier,
    log: LogNotifier,
}

impl TargetRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(&self, target: &DeliveryTarget) -> &dyn Notifier {
        match target {
            DeliveryTarget::Log => &self.log,
            DeliveryTarget::Smtp { .. } => &self.email,
            DeliveryTarget::PushBullet { .. } => &self.pushbullet,
        }
    }
}

#[async_trait]
impl Notifier for TargetRouter {
    async fn deliver(&self, config: &NotifyConfig, title: &str, body: &str) -> Result<NotifyResult> {
        self.route(&config.target).deliver(config, title, body).await
    }

    fn name(&self) -> &str {
        "router"
    }
}
