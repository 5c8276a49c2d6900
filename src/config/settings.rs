//! 中继运行参数
//!
//! 描述中继本身如何运行：从哪里读取配置存储、重载的并发与防抖、日志输出。

use crate::config::source::{ConfigSource, DEFAULTS_RANK, OVERRIDE_RANK};
use crate::config::store::{substitute_env_vars, FileStore};
use crate::error::SettingsError;
use crate::logging::LogConfig;
use crate::unit::{UnitOptions, WorkerPool};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// 支持的日志级别
const VALID_LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// 中继运行参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySettings {
    /// 默认配置文件（必需、不监控）
    #[serde(default)]
    pub defaults_path: Option<PathBuf>,
    /// 覆盖配置文件（被监控）
    #[serde(default)]
    pub override_path: Option<PathBuf>,
    /// 覆盖配置文件缺失时是否视为空文档
    #[serde(default)]
    pub override_optional: bool,
    /// 配置存储内容是否进行 ${VAR} 替换
    #[serde(default)]
    pub env_substitution: bool,
    /// 文件变更防抖动延迟（毫秒）
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// 系统范围内同时运行的重载处理器上限
    #[serde(default = "default_max_concurrent_reloads")]
    pub max_concurrent_reloads: usize,
    /// 每个组件的订阅队列容量
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// 获取初始配置的超时时间（毫秒），不设置时一直等待
    #[serde(default)]
    pub fetch_timeout_ms: Option<u64>,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 是否输出JSON格式日志
    #[serde(default)]
    pub json_logs: bool,
    /// 日志文件路径
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_debounce_ms() -> u64 {
    200
}
fn default_max_concurrent_reloads() -> usize {
    crate::unit::dispatch::DEFAULT_POOL_SIZE
}
fn default_queue_capacity() -> usize {
    crate::unit::DEFAULT_QUEUE_CAPACITY
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            defaults_path: None,
            override_path: None,
            override_optional: false,
            env_substitution: false,
            debounce_ms: default_debounce_ms(),
            max_concurrent_reloads: default_max_concurrent_reloads(),
            queue_capacity: default_queue_capacity(),
            fetch_timeout_ms: None,
            log_level: default_log_level(),
            json_logs: false,
            log_file: None,
        }
    }
}

impl RelaySettings {
    /// 防抖动延迟
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// 获取初始配置的超时时间
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    /// 日志级别
    pub fn log_level_filter(&self) -> Result<LevelFilter, SettingsError> {
        LevelFilter::from_str(&self.log_level).map_err(|_| {
            SettingsError::ValidationError(format!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level, VALID_LOG_LEVELS
            ))
        })
    }

    /// 日志配置
    pub fn log_config(&self) -> Result<LogConfig, SettingsError> {
        Ok(LogConfig {
            level: self.log_level_filter()?,
            file_path: self.log_file.clone(),
            json_format: self.json_logs,
            ..LogConfig::default()
        })
    }

    /// 按参数构建的重载工作池
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(self.max_concurrent_reloads)
    }

    /// 按参数构建的组件选项
    pub fn unit_options(&self) -> UnitOptions {
        let options = UnitOptions::default().with_queue_capacity(self.queue_capacity);
        match self.fetch_timeout() {
            Some(timeout) => options.with_fetch_timeout(timeout),
            None => options,
        }
    }

    /// 按参数构建配置源
    pub fn config_source(&self) -> ConfigSource {
        let mut builder = ConfigSource::builder().debounce(self.debounce());

        if let Some(path) = &self.defaults_path {
            let store = FileStore::new(path, DEFAULTS_RANK)
                .with_name("defaults")
                .watched(false)
                .with_env_substitution(self.env_substitution);
            builder = builder.store(Arc::new(store));
        }

        if let Some(path) = &self.override_path {
            let store = FileStore::new(path, OVERRIDE_RANK)
                .with_name("override")
                .optional(self.override_optional)
                .with_env_substitution(self.env_substitution);
            builder = builder.store(Arc::new(store));
        }

        builder.build()
    }

    /// 将相对路径解析为相对于参数文件所在目录
    fn resolve_paths(&mut self, base_dir: &Path) {
        for path in [
            &mut self.defaults_path,
            &mut self.override_path,
            &mut self.log_file,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base_dir.join(&*path);
            }
        }
    }
}

/// 运行参数加载器
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    /// 是否启用环境变量替换
    enable_env_substitution: bool,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SettingsLoader {
    /// 创建加载器
    pub fn new(enable_env_substitution: bool) -> Self {
        Self {
            enable_env_substitution,
        }
    }

    /// 从文件加载并验证参数
    pub async fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<RelaySettings, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SettingsError::ParseError(format!("读取文件失败: {}", e)))?;
        let mut settings = self.parse(&content)?;
        if let Some(base_dir) = path.parent() {
            settings.resolve_paths(base_dir);
        }
        self.validate(&settings)?;
        Ok(settings)
    }

    /// 从字符串加载并验证参数
    pub fn load_from_str(&self, content: &str) -> Result<RelaySettings, SettingsError> {
        let settings = self.parse(content)?;
        self.validate(&settings)?;
        Ok(settings)
    }

    fn parse(&self, content: &str) -> Result<RelaySettings, SettingsError> {
        let content = if self.enable_env_substitution {
            substitute_env_vars(content).map_err(|var| SettingsError::EnvVarError { var })?
        } else {
            content.to_string()
        };

        toml::from_str(&content).map_err(|e| SettingsError::ParseError(format!("TOML解析失败: {}", e)))
    }

    /// 验证参数
    pub fn validate(&self, settings: &RelaySettings) -> Result<(), SettingsError> {
        if settings.defaults_path.is_none() && settings.override_path.is_none() {
            return Err(SettingsError::ValidationError(
                "至少需要配置 defaults_path 或 override_path".to_string(),
            ));
        }

        if settings.max_concurrent_reloads == 0 {
            return Err(SettingsError::ValidationError(
                "最大并发重载数不能为0".to_string(),
            ));
        }

        if settings.queue_capacity == 0 {
            return Err(SettingsError::ValidationError(
                "订阅队列容量不能为0".to_string(),
            ));
        }

        if settings.fetch_timeout_ms == Some(0) {
            return Err(SettingsError::ValidationError(
                "获取配置超时时间不能为0".to_string(),
            ));
        }

        settings.log_level_filter()?;
        Ok(())
    }
}

/// 默认的参数文件路径
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(crate::APP_NAME)
        .join("relay.toml")
}
