//! 运行时上下文
//!
//! 把总线、分发器和重载工作池绑在一起。分发器不是进程级全局对象，
//! 它的生命周期就是持有它的 `Relay` 的生命周期。

use crate::bus::Bus;
use crate::config::settings::RelaySettings;
use crate::config::snapshot::Document;
use crate::config::source::{ConfigSource, SourceHandle};
use crate::distributor::Distributor;
use crate::error::SourceError;
use crate::unit::{Reconfigurable, Unit, UnitOptions, WorkerPool};
use tracing::info;

/// 一组共享同一份当前配置的总线、分发器与工作池
#[derive(Clone)]
pub struct Relay {
    bus: Bus,
    distributor: Distributor,
    pool: WorkerPool,
    options: UnitOptions,
}

impl Relay {
    /// 创建运行时上下文
    ///
    /// # 参数
    /// * `pool` - 所有组件共享的重载工作池
    /// * `options` - 新组件的默认选项
    pub fn new(pool: WorkerPool, options: UnitOptions) -> Self {
        let bus = Bus::new();
        let distributor = Distributor::new(&bus);
        Self {
            bus,
            distributor,
            pool,
            options,
        }
    }

    /// 按运行参数创建运行时上下文
    pub fn from_settings(settings: &RelaySettings) -> Self {
        info!(
            "创建配置中继: 最大并发重载 {}，队列容量 {}",
            settings.max_concurrent_reloads, settings.queue_capacity
        );
        Self::new(settings.worker_pool(), settings.unit_options())
    }

    /// 消息总线
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// 配置分发器
    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    /// 重载工作池
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// 启动配置源，首次合并失败时返回错误
    pub async fn start_source(&self, source: ConfigSource) -> Result<SourceHandle, SourceError> {
        source.start(self.distributor.clone()).await
    }

    /// 使用默认选项创建组件
    pub fn unit<R: Reconfigurable>(&self, handler: R) -> Unit<R> {
        self.unit_with(handler, self.options.clone())
    }

    /// 使用部署时提供的配置创建组件，该组件不会向分发器请求配置
    pub fn deployed_unit<R: Reconfigurable>(&self, handler: R, document: Document) -> Unit<R> {
        self.unit_with(handler, self.options.clone().with_deployment_config(document))
    }

    /// 使用指定选项创建组件
    pub fn unit_with<R: Reconfigurable>(&self, handler: R, options: UnitOptions) -> Unit<R> {
        Unit::new(handler, &self.bus, self.pool.clone(), options)
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(WorkerPool::default(), UnitOptions::default())
    }
}
