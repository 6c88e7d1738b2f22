use thiserror::Error;

/// ramon 统一错误类型
#[derive(Error, Debug)]
pub enum RamonError {
    /// 配置错误：只允许在加载阶段出现
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Action error: {0}")]
    Action(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RamonError {
    pub fn config(message: impl Into<String>) -> Self {
        RamonError::Config(message.into())
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        RamonError::Evaluation(message.into())
    }

    /// 只有配置错误允许终止进程
    pub fn is_fatal(&self) -> bool {
        matches!(self, RamonError::Config(_))
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, RamonError>;

impl From<anyhow::Error> for RamonError {
    fn from(err: anyhow::Error) -> Self {
        RamonError::Action(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RamonError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RamonError::ChannelSend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_errors_are_fatal() {
        assert!(RamonError::config("bad regex").is_fatal());
        assert!(!RamonError::evaluation("missing var").is_fatal());
        assert!(!RamonError::Persistence("disk full".into()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = RamonError::config("Monitor `ssh`: invalid cooldown");
        assert_eq!(
            err.to_string(),
            "Configuration error: Monitor `ssh`: invalid cooldown"
        );
    }
}
