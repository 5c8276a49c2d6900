//! 可重配置组件模块
//!
//! 组件启动时获取初始配置（部署时直接提供，或从分发器获取），
//! 之后在每次配置广播时重新推导自己的内部状态。

pub mod dispatch;
pub mod lifecycle;

pub use dispatch::WorkerPool;
pub use lifecycle::{Unit, UnitStats};

use crate::config::snapshot::{ConfigSnapshot, Document};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// 默认的订阅队列容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// 组件的配置处理逻辑
#[async_trait]
pub trait Reconfigurable: Send + Sync + 'static {
    /// 由配置推导出的组件私有状态
    type State: Send + Sync + 'static;

    /// 组件名称
    fn name(&self) -> &str;

    /// 处理配置（重新）读取
    ///
    /// 返回新的状态，由组件在成功后整体替换旧状态；返回错误时旧状态保持不变。
    ///
    /// # 参数
    /// * `conf` - 完整的应用配置，组件自行挑选需要的部分
    /// * `previous` - 上一次成功应用的状态
    /// * `force` - 为 true 时即使没有变化也应输出状态日志，例如组件启动时
    async fn read_configuration(
        &self,
        conf: &ConfigSnapshot,
        previous: Option<&Self::State>,
        force: bool,
    ) -> anyhow::Result<Self::State>;
}

/// 组件生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    /// 尚未启动
    Uninitialized,
    /// 正在获取并应用初始配置
    Starting,
    /// 运行中，响应配置广播
    Running,
    /// 已停止
    Stopped,
}

impl fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitPhase::Uninitialized => write!(f, "uninitialized"),
            UnitPhase::Starting => write!(f, "starting"),
            UnitPhase::Running => write!(f, "running"),
            UnitPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// 启动策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupPolicy {
    /// 首次应用配置失败时启动失败
    #[default]
    FailFast,
    /// 首次应用失败只记录日志，组件以无状态运行并等待下一次广播
    Lenient,
}

/// 组件选项
#[derive(Debug, Clone)]
pub struct UnitOptions {
    /// 部署时直接提供的配置，非空时不会访问分发器
    pub deployment_config: Option<Document>,
    /// 获取初始配置的超时时间，None 表示一直等待
    pub fetch_timeout: Option<Duration>,
    /// 订阅队列容量
    pub queue_capacity: usize,
    /// 启动策略
    pub policy: StartupPolicy,
}

impl Default for UnitOptions {
    fn default() -> Self {
        Self {
            deployment_config: None,
            fetch_timeout: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            policy: StartupPolicy::default(),
        }
    }
}

impl UnitOptions {
    /// 使用部署时提供的配置
    pub fn with_deployment_config(mut self, document: Document) -> Self {
        self.deployment_config = Some(document);
        self
    }

    /// 设置获取初始配置的超时时间
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// 设置订阅队列容量
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// 设置启动策略
    pub fn with_policy(mut self, policy: StartupPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 非空的部署配置
    pub(crate) fn explicit_config(&self) -> Option<&Document> {
        self.deployment_config.as_ref().filter(|d| !d.is_empty())
    }
}
