//! 数据库连接配置

use crate::config::snapshot::ConfigSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

fn default_port() -> u16 {
    5432
}

/// 数据库连接配置
///
/// 作为连接池注册表的键使用，未知字段在反序列化时被忽略。
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbConfig {
    /// 数据库主机
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// 数据库名称
    pub database: String,
    /// 用户名
    pub user: String,
    /// 密码
    #[serde(default)]
    pub password: Option<String>,
    /// 非空时通过该套接字文件连接，而不是通过网络
    #[serde(default, alias = "socketFile")]
    pub socket_file: Option<PathBuf>,
}

/// 连接目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// TCP/IP 连接
    Tcp { host: String, port: u16 },
    /// 本地套接字连接
    Socket { path: PathBuf },
}

impl DbConfig {
    /// 从配置快照中绑定数据库配置
    ///
    /// # 参数
    /// * `snapshot` - 配置快照
    /// * `path` - 点分路径，例如 `"db"`
    pub fn from_snapshot(snapshot: &ConfigSnapshot, path: &str) -> anyhow::Result<Self> {
        snapshot.bind(path)
    }

    /// 实际的连接目标，配置了套接字文件时优先使用套接字
    pub fn connection_target(&self) -> ConnectionTarget {
        match &self.socket_file {
            Some(path) => ConnectionTarget::Socket { path: path.clone() },
            None => ConnectionTarget::Tcp {
                host: self.host.clone(),
                port: self.port,
            },
        }
    }
}

// 密码不出现在日志中
impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("socket_file", &self.socket_file)
            .finish()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionTarget::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ConnectionTarget::Socket { path } => write!(f, "unix://{}", path.display()),
        }
    }
}
