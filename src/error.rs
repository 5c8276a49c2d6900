//! 错误处理模块
//!
//! 定义配置分发协议的统一错误类型

use thiserror::Error;

/// Config Relay 的主要错误类型
#[derive(Error, Debug)]
pub enum ConfigRelayError {
    /// 配置源相关错误
    #[error("配置源错误: {0}")]
    Source(#[from] SourceError),

    /// 消息总线相关错误
    #[error("消息总线错误: {0}")]
    Bus(#[from] BusError),

    /// 组件生命周期相关错误
    #[error("组件错误: {0}")]
    Unit(#[from] UnitError),

    /// 运行参数错误
    #[error("运行参数错误: {0}")]
    Settings(#[from] SettingsError),

    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON序列化/反序列化错误
    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),

    /// 其他错误
    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

/// 配置源错误类型
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// 必需的配置存储无法读取
    #[error("配置存储不可用: {store}: {reason}")]
    Unavailable { store: String, reason: String },

    /// 配置内容解析失败
    #[error("配置解析失败: {store}: {reason}")]
    Parse { store: String, reason: String },

    /// 环境变量替换失败
    #[error("环境变量替换失败: {store}: {var}")]
    EnvVar { store: String, var: String },

    /// 文件监控注册失败
    #[error("文件监控失败: {store}: {reason}")]
    Watch { store: String, reason: String },
}

impl SourceError {
    /// 出错的配置存储名称
    pub fn store(&self) -> &str {
        match self {
            SourceError::Unavailable { store, .. }
            | SourceError::Parse { store, .. }
            | SourceError::EnvVar { store, .. }
            | SourceError::Watch { store, .. } => store,
        }
    }
}

/// 消息总线错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    /// 地址上没有注册处理器
    #[error("地址上没有处理器: {address}")]
    NoHandler { address: String },

    /// 请求等待回复超时
    #[error("请求超时: {address} ({timeout_ms}ms)")]
    Timeout { address: String, timeout_ms: u64 },

    /// 处理器返回失败
    #[error("处理器失败 [{code}]: {message}")]
    Handler { code: u16, message: String },

    /// 处理器未回复就被丢弃
    #[error("回复通道已关闭: {address}")]
    ReplyDropped { address: String },

    /// 消息类型与地址约定不一致
    #[error("消息类型不匹配: {address}")]
    TypeMismatch { address: String },
}

/// 组件生命周期错误类型
#[derive(Error, Debug)]
pub enum UnitError {
    /// 首次应用配置失败（启动失败）
    #[error("组件 {unit} 首次应用配置失败: {source}")]
    InitialApply {
        unit: String,
        #[source]
        source: anyhow::Error,
    },

    /// 获取初始配置失败
    #[error("组件 {unit} 获取初始配置失败: {source}")]
    Fetch {
        unit: String,
        #[source]
        source: BusError,
    },

    /// 非法的状态转换
    #[error("组件 {unit} 无法从 {from} 状态执行 {action}")]
    InvalidTransition {
        unit: String,
        from: String,
        action: &'static str,
    },
}

/// 运行参数错误类型
#[derive(Error, Debug)]
pub enum SettingsError {
    /// 参数文件解析错误
    #[error("参数文件解析失败: {0}")]
    ParseError(String),

    /// 参数验证错误
    #[error("参数验证失败: {0}")]
    ValidationError(String),

    /// 参数文件不存在
    #[error("参数文件不存在: {path}")]
    FileNotFound { path: String },

    /// 环境变量替换错误
    #[error("环境变量替换失败: {var}")]
    EnvVarError { var: String },
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ConfigRelayError>;
