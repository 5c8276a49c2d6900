//! 按配置值注册的连接池

use crate::db::config::DbConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

/// 数据源工厂，由具体的数据库驱动实现
pub trait DataSourceFactory: Send + Sync {
    /// 池化的数据源句柄
    type DataSource: Send + Sync + 'static;

    /// 根据配置创建数据源
    fn create(&self, config: &DbConfig) -> anyhow::Result<Self::DataSource>;

    /// 关闭数据源，默认什么也不做
    fn close(&self, _source: &Self::DataSource) {}
}

/// 数据源注册表
pub struct ConnectionPool<F: DataSourceFactory> {
    factory: F,
    sources: Mutex<HashMap<DbConfig, Arc<F::DataSource>>>,
}

impl<F: DataSourceFactory> ConnectionPool<F> {
    /// 创建空的注册表
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            sources: Mutex::new(HashMap::new()),
        }
    }

    fn sources(&self) -> MutexGuard<'_, HashMap<DbConfig, Arc<F::DataSource>>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 获取配置对应的数据源，不存在时创建
    pub fn data_source(&self, config: &DbConfig) -> anyhow::Result<Arc<F::DataSource>> {
        let mut sources = self.sources();
        if let Some(source) = sources.get(config) {
            return Ok(Arc::clone(source));
        }

        info!(
            "创建新的数据源: {} (数据库 {})",
            config.connection_target(),
            config.database
        );
        let source = Arc::new(self.factory.create(config)?);
        sources.insert(config.clone(), Arc::clone(&source));
        Ok(source)
    }

    /// 关闭数据源并从注册表移除
    ///
    /// # 返回
    /// * `bool` - 是否存在该数据源
    pub fn close_data_source(&self, config: &DbConfig) -> bool {
        let removed = self.sources().remove(config);
        match removed {
            Some(source) => {
                self.factory.close(&source);
                info!("已关闭数据源: {}", config.connection_target());
                true
            }
            None => false,
        }
    }

    /// 已注册的数据源数量
    pub fn len(&self) -> usize {
        self.sources().len()
    }

    /// 注册表是否为空
    pub fn is_empty(&self) -> bool {
        self.sources().is_empty()
    }
}
