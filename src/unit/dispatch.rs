//! 配置重载调度
//!
//! 每个组件有一个调度任务按 FIFO 顺序取出广播的快照，先从共享的工作池获取许可，
//! 再在独立任务中运行处理器。调度任务等待处理器结束后才处理下一份快照，
//! 因此同一组件内严格有序，不同组件之间互不阻塞，总并发受工作池大小限制。
//! 处理器较慢时订阅队列会合并为最新的快照，组件最终总会追上分发器的当前配置。

use crate::bus::Subscription;
use crate::config::snapshot::ConfigSnapshot;
use crate::logging::LoggingSystem;
use crate::unit::lifecycle::{ApplyFailure, UnitShared};
use crate::unit::Reconfigurable;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

/// 默认的工作池大小
pub const DEFAULT_POOL_SIZE: usize = 8;

/// 有界的重载工作池
#[derive(Clone, Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// 创建工作池（大小为 0 时按 1 处理）
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// 工作池大小
    pub fn size(&self) -> usize {
        self.size
    }

    /// 当前空闲的许可数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).acquire_owned().await.ok()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

/// 组件的调度循环
pub(crate) async fn run_dispatcher<R: Reconfigurable>(
    shared: Arc<UnitShared<R>>,
    mut subscription: Subscription<ConfigSnapshot>,
    pool: WorkerPool,
) {
    debug!("组件 {} 的配置调度任务已启动", shared.name());

    while let Some(snapshot) = subscription.recv().await {
        if shared.is_stopped() {
            break;
        }

        let coalesced = subscription.take_coalesced();
        if coalesced > 0 {
            debug!(
                "组件 {} 处理较慢，{} 个中间配置版本已被更新的版本取代",
                shared.name(),
                coalesced
            );
            shared.stats.skipped.fetch_add(coalesced, Ordering::Relaxed);
        }

        let snapshot = ConfigSnapshot::clone(&snapshot);
        if shared.is_stale(&snapshot) {
            debug!(
                "组件 {} 跳过过期配置版本 {}（已应用 {}）",
                shared.name(),
                snapshot.version(),
                shared.applied_version()
            );
            shared.stats.skipped.fetch_add(1, Ordering::Relaxed);
            LoggingSystem::snapshot_log(shared.name(), &snapshot, false);
            continue;
        }

        let Some(permit) = pool.acquire().await else {
            shared.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                "组件 {} 无法获取重载许可，配置版本 {} 未应用！注意：各组件的配置状态可能已不一致",
                shared.name(),
                snapshot.version()
            );
            continue;
        };

        // 获取许可期间可能已被停止
        if shared.is_stopped() {
            break;
        }

        info!("组件 {} 收到配置变更，重新加载配置", shared.name());
        let outcome = shared.apply(snapshot.clone(), false).await;
        drop(permit);

        match outcome {
            Ok(()) => {}
            Err(ApplyFailure::Handler(e)) => {
                // 保留之前的配置继续运行
                error!("组件 {} 更新配置失败: {:#}", shared.name(), e);
            }
            Err(ApplyFailure::Panicked) => {
                error!("组件 {} 的配置处理器发生 panic，保留之前的配置", shared.name());
            }
            Err(ApplyFailure::Dispatch(e)) => {
                shared.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "组件 {} 应用重载配置版本 {} 时调度出错！注意：组件可能停留在两个有效配置状态之间: {}",
                    shared.name(),
                    snapshot.version(),
                    e
                );
            }
        }
    }

    subscription.unsubscribe();
    debug!("组件 {} 的配置调度任务结束", shared.name());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size_at_least_one() {
        assert_eq!(WorkerPool::new(0).size(), 1);
        assert_eq!(WorkerPool::new(4).available(), 4);
        assert_eq!(WorkerPool::default().size(), DEFAULT_POOL_SIZE);
    }

    #[tokio::test]
    async fn test_permits_are_returned() {
        let pool = WorkerPool::new(1);
        let permit = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);
        drop(permit);
        assert_eq!(pool.available(), 1);
    }
}
