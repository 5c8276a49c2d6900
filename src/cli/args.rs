//! 命令行参数定义
//!
//! 使用clap定义应用程序的命令行接口

use crate::config::settings::{default_settings_path, RelaySettings};
use crate::logging::LogConfig;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Config Relay - 进程内配置分发与热重载
#[derive(Parser, Debug, Clone)]
#[command(
    name = "config-relay",
    version = crate::VERSION,
    about = crate::APP_DESCRIPTION,
    long_about = None
)]
pub struct Args {
    /// 运行参数文件路径
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "运行参数文件路径",
        env = "CONFIG_RELAY_SETTINGS"
    )]
    pub settings: Option<PathBuf>,

    /// 日志级别，未指定时使用运行参数文件中的级别
    #[arg(
        short,
        long,
        value_enum,
        help = "日志级别",
        env = "CONFIG_RELAY_LOG_LEVEL"
    )]
    pub log_level: Option<LogLevel>,

    /// 是否输出JSON格式日志
    #[arg(long, help = "输出JSON格式日志")]
    pub json_logs: bool,

    /// 子命令
    #[command(subcommand)]
    pub command: Commands,
}

/// 日志级别枚举
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum LogLevel {
    /// 跟踪级别
    Trace,
    /// 调试级别
    Debug,
    /// 信息级别
    Info,
    /// 警告级别
    Warn,
    /// 错误级别
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

/// 输出格式
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Default)]
pub enum OutputFormat {
    /// 文本格式
    #[default]
    Text,
    /// JSON格式
    Json,
}

/// 子命令定义
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// 合并配置存储并输出结果
    Merge {
        /// 默认配置文件，指定后忽略运行参数文件
        #[arg(long, value_name = "FILE", help = "默认配置文件")]
        defaults: Option<PathBuf>,

        /// 覆盖配置文件
        #[arg(long = "override", value_name = "FILE", help = "覆盖配置文件")]
        override_file: Option<PathBuf>,

        /// 只输出该点分路径下的配置
        #[arg(short, long, value_name = "PATH", help = "只输出该路径下的配置")]
        path: Option<String>,

        /// 输出紧凑格式
        #[arg(long, help = "输出紧凑格式")]
        compact: bool,
    },

    /// 在前台运行配置中继，打印每一次应用的配置直到 Ctrl-C
    Watch {
        /// 只打印该点分路径下的配置
        #[arg(short, long, value_name = "PATH", help = "只打印该路径下的配置")]
        path: Option<String>,
    },

    /// 验证运行参数文件
    Validate {
        /// 运行参数文件路径
        #[arg(value_name = "FILE", help = "运行参数文件路径")]
        settings_path: Option<PathBuf>,

        /// 同时读取并合并配置存储
        #[arg(long, help = "同时读取并合并配置存储")]
        check_stores: bool,

        /// 是否显示详细信息
        #[arg(short, long, help = "显示详细信息")]
        verbose: bool,
    },

    /// 显示版本信息
    Version {
        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text", help = "输出格式")]
        format: OutputFormat,
    },
}

impl Args {
    /// 运行参数文件路径，未指定时使用默认位置
    pub fn get_settings_path(&self) -> PathBuf {
        self.settings.clone().unwrap_or_else(default_settings_path)
    }

    /// 日志配置：命令行参数优先，其次是运行参数文件
    pub fn log_config(&self, settings: Option<&RelaySettings>) -> LogConfig {
        let mut config = settings
            .and_then(|s| s.log_config().ok())
            .unwrap_or_default();
        if let Some(level) = self.log_level {
            config.level = level.into();
        }
        config.json_format |= self.json_logs;
        config
    }
}
