//! 存储层协作者边界
//!
//! 连接池按配置值注册，一个不同的 `DbConfig` 对应一个独立的数据源实例。
//! 数据源不参与配置热重载：新的配置值只会得到另一个键下的新实例。

pub mod config;
pub mod health;
pub mod pool;

pub use config::{ConnectionTarget, DbConfig};
pub use health::{check_health, HealthProbe, HealthStatus, DEFAULT_HEALTH_TIMEOUT};
pub use pool::{ConnectionPool, DataSourceFactory};
