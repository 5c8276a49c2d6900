//! Config Relay - 进程内配置分发与热重载
//!
//! 一个配置源按优先级合并多个配置存储，分发器持有合并后的当前配置，
//! 各个可重配置组件在启动时获取它，并在每次变更广播时重新推导自己的状态：
//! - 按优先级覆盖的配置合并
//! - 文件变更监控与热重载
//! - 单个组件的重载失败不影响其他组件
//! - 首次配置失败即启动失败
//! - 结构化日志记录

pub mod bus;
pub mod cli;
pub mod config;
pub mod db;
pub mod distributor;
pub mod error;
pub mod logging;
pub mod relay;
pub mod unit;

// 重新导出主要类型
pub use bus::Bus;
pub use config::{ConfigSnapshot, ConfigSource, Document, FileStore, MemoryStore, RelaySettings, Store};
pub use distributor::Distributor;
pub use error::ConfigRelayError;
pub use relay::Relay;
pub use unit::{Reconfigurable, StartupPolicy, Unit, UnitOptions, UnitPhase, WorkerPool};

/// 应用程序版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 应用程序名称
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// 应用程序描述
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
