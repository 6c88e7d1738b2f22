use config::{Config, Environment, File, FileFormat};
use ramon_core::{parse_duration, RamonError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{ConfigDocument, EngineSettings, NotifyDef};

/// 默认通知配置名称
pub const DEFAULT_NOTIFY: &str = "default";

/// 配置加载器
pub struct ConfigLoader {
    path: PathBuf,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// 创建配置加载器，`[engine]` 可被 `RAMON_ENGINE__*` 环境变量覆盖
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            env_prefix: Some("RAMON".to_string()),
        }
    }

    /// 不读取环境变量
    pub fn without_env(mut self) -> Self {
        self.env_prefix = None;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载并校验配置文件
    pub fn load(&self) -> Result<ConfigDocument> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            RamonError::config(format!("cannot read {}: {}", self.path.display(), e))
        })?;

        let mut document = parse_document(&text)
            .map_err(|e| RamonError::config(format!("{}: {}", self.path.display(), e)))?;
        document.engine = self.engine_settings(&text)?;
        validate_engine(&document.engine)?;

        info!(
            path = %self.path.display(),
            monitors = document.monitor.len(),
            notify_configs = document.notify.len(),
            "Configuration loaded"
        );
        Ok(document)
    }

    /// 引擎设置：文件中的 `[engine]` 之上叠加环境变量
    fn engine_settings(&self, text: &str) -> Result<EngineSettings> {
        let defaults = EngineSettings::default();
        let mut builder = Config::builder()
            .set_default("engine.state_dir", defaults.state_dir.to_string_lossy().to_string())
            .and_then(|b| b.set_default("engine.queue_capacity", defaults.queue_capacity as u64))
            .and_then(|b| b.set_default("engine.persist_interval", defaults.persist_interval))
            .map_err(|e| RamonError::config(e.to_string()))?
            .add_source(File::from_str(text, FileFormat::Toml));

        if let Some(prefix) = &self.env_prefix {
            builder = builder.add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let settings = builder
            .build()
            .and_then(|config| config.get::<EngineSettings>("engine"))
            .map_err(|e| RamonError::config(format!("[engine]: {}", e)))?;
        debug!(?settings, "Engine settings resolved");
        Ok(settings)
    }
}

/// 解析 TOML 文本（不读取环境变量）
pub fn parse_document(text: &str) -> Result<ConfigDocument> {
    let mut document: ConfigDocument =
        toml::from_str(text).map_err(|e| RamonError::config(e.to_string()))?;

    if !document.notify.contains_key(DEFAULT_NOTIFY) {
        document
            .notify
            .insert(DEFAULT_NOTIFY.to_string(), NotifyDef::default());
    }
    validate_engine(&document.engine)?;
    Ok(document)
}

fn validate_engine(settings: &EngineSettings) -> Result<()> {
    if settings.queue_capacity == 0 {
        return Err(RamonError::config("engine.queue_capacity must be greater than 0"));
    }
    parse_duration(&settings.persist_interval)
        .map_err(|e| RamonError::config(format!("engine.persist_interval: {}", e)))?;
    Ok(())
}
