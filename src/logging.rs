//! 日志系统模块
//!
//! 进程内只安装一次全局 tracing subscriber，`log` 记录通过 LogTracer 桥接进来。

use crate::config::snapshot::ConfigSnapshot;
use log::LevelFilter;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter, Layer};

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 日志级别
    pub level: LevelFilter,
    /// 日志文件路径，设置后输出到文件而不是控制台
    pub file_path: Option<PathBuf>,
    /// 是否使用JSON格式
    pub json_format: bool,
    /// 模块级别日志控制
    pub module_levels: HashMap<String, LevelFilter>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            file_path: None,
            json_format: false,
            module_levels: HashMap::new(),
        }
    }
}

impl LogConfig {
    /// 指定级别的控制台日志配置
    pub fn with_level(level: LevelFilter) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }
}

/// 全局初始化记录：首次初始化的结果与配置
#[derive(Default)]
struct LoggingState {
    outcome: Option<Result<LogConfig, String>>,
}

static LOGGING_STATE: OnceLock<Mutex<LoggingState>> = OnceLock::new();

fn state() -> MutexGuard<'static, LoggingState> {
    LOGGING_STATE
        .get_or_init(|| Mutex::new(LoggingState::default()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// 日志系统
pub struct LoggingSystem {
    config: LogConfig,
}

impl LoggingSystem {
    /// 初始化日志系统
    ///
    /// 重复调用不会重新安装 subscriber；首次初始化失败后再次调用返回同样的错误。
    ///
    /// # 参数
    /// * `config` - 日志配置
    pub fn setup_logging(config: LogConfig) -> anyhow::Result<Self> {
        let mut state = state();
        match &state.outcome {
            Some(Ok(_)) => return Ok(Self { config }),
            Some(Err(e)) => return Err(anyhow::anyhow!("日志系统之前初始化失败: {}", e)),
            None => {}
        }

        let result = Self::init_log_tracer().and_then(|_| Self::init_tracing_subscriber(&config));
        state.outcome = Some(
            result
                .as_ref()
                .map(|_| config.clone())
                .map_err(|e| e.to_string()),
        );
        result.map(|_| Self { config })
    }

    /// 本实例使用的配置
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// 是否已成功初始化
    pub fn is_initialized() -> bool {
        matches!(state().outcome, Some(Ok(_)))
    }

    /// 首次成功初始化时使用的配置
    pub fn current_config() -> Option<LogConfig> {
        match &state().outcome {
            Some(Ok(config)) => Some(config.clone()),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn reset_for_testing() {
        state().outcome = None;
    }

    fn init_log_tracer() -> anyhow::Result<()> {
        static LOG_TRACER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

        LOG_TRACER_INIT
            .get_or_init(|| tracing_log::LogTracer::init().map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|e| anyhow::anyhow!("LogTracer初始化失败: {}", e))?;
        Ok(())
    }

    fn build_filter(config: &LogConfig) -> anyhow::Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(level_directive(config.level));
        for (module, level) in &config.module_levels {
            let directive: Directive = format!("{}={}", module, level.as_str().to_lowercase())
                .parse()
                .map_err(|e| anyhow::anyhow!("无效的模块日志级别 {}: {}", module, e))?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }

    fn init_tracing_subscriber(config: &LogConfig) -> anyhow::Result<()> {
        let filter = Self::build_filter(config)?;

        let layer = match &config.file_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| anyhow::anyhow!("创建日志目录失败: {}", e))?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| anyhow::anyhow!("创建日志文件失败: {}", e))?;
                let base = fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_timer(fmt::time::ChronoUtc::rfc_3339());
                if config.json_format {
                    base.json().boxed()
                } else {
                    base.boxed()
                }
            }
            None => {
                let base = fmt::layer()
                    .with_timer(fmt::time::ChronoUtc::rfc_3339())
                    .with_target(true)
                    .with_thread_names(true);
                if config.json_format {
                    base.json().boxed()
                } else {
                    base.with_ansi(true).boxed()
                }
            }
        };

        match registry().with(filter).with(layer).try_init() {
            Ok(()) => {
                tracing::info!("日志系统初始化完成");
                tracing::debug!("日志配置: {:?}", config);
                Ok(())
            }
            // 其他代码（例如测试框架）已经安装了全局 subscriber
            Err(e) if e.to_string().contains("already") => {
                tracing::debug!("全局日志 subscriber 已存在");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("tracing subscriber初始化失败: {}", e)),
        }
    }

    /// 记录一次配置应用的结构化摘要
    pub fn snapshot_log(unit: &str, snapshot: &ConfigSnapshot, applied: bool) {
        let entry = json!({
            "type": "config_applied",
            "unit": unit,
            "version": snapshot.version(),
            "produced_at": snapshot.produced_at().to_rfc3339(),
            "keys": snapshot.document().len(),
            "applied": applied,
        });
        if applied {
            tracing::info!(target: "config_relay::audit", "{}", entry);
        } else {
            tracing::warn!(target: "config_relay::audit", "{}", entry);
        }
    }
}

fn level_directive(level: LevelFilter) -> Directive {
    match level.to_level() {
        Some(log::Level::Error) => tracing::Level::ERROR.into(),
        Some(log::Level::Warn) => tracing::Level::WARN.into(),
        Some(log::Level::Info) => tracing::Level::INFO.into(),
        Some(log::Level::Debug) => tracing::Level::DEBUG.into(),
        Some(log::Level::Trace) => tracing::Level::TRACE.into(),
        None => tracing_subscriber::filter::LevelFilter::OFF.into(),
    }
}

/// 默认日志文件路径
pub fn default_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(crate::APP_NAME)
        .join("config-relay.log")
}
