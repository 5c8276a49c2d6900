//! 配置源
//!
//! 按 rank 合并多个存储，监控 watched 存储并在每次变更后重新执行完整合并，
//! 把结果交给分发器。配置源本身从不直接与组件通信。

use crate::config::snapshot::{deep_merge, ConfigSnapshot, Document};
use crate::config::store::{FileStore, MemoryStore, Store, StoreFormat};
use crate::config::watcher::{StoreChangeEvent, StoreWatcher, WatchedFile};
use crate::distributor::Distributor;
use crate::error::SourceError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 默认防抖动延迟
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// 基础文档的 rank
pub const BASE_RANK: i32 = 0;
/// 默认配置的 rank
pub const DEFAULTS_RANK: i32 = 10;
/// 覆盖文件的 rank
pub const OVERRIDE_RANK: i32 = 20;

type ReloadReply = oneshot::Sender<Result<ConfigSnapshot, SourceError>>;

/// 按给定顺序合并存储（调用方负责按 rank 升序排列）
pub async fn merge(stores: &[Arc<dyn Store>]) -> Result<Document, SourceError> {
    let mut merged = Document::new();
    for store in stores {
        let partial = store.read().await?;
        debug!("合并配置存储: {} (rank {})", store.name(), store.rank());
        deep_merge(&mut merged, partial);
    }
    Ok(merged)
}

/// 配置源
pub struct ConfigSource {
    /// 按 rank 升序排列的存储
    stores: Vec<Arc<dyn Store>>,
    /// 防抖动延迟
    debounce: Duration,
}

impl ConfigSource {
    /// 创建配置源，存储按 rank 稳定排序
    pub fn new(mut stores: Vec<Arc<dyn Store>>) -> Self {
        stores.sort_by_key(|s| s.rank());
        Self {
            stores,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// 创建配置源构建器
    pub fn builder() -> ConfigSourceBuilder {
        ConfigSourceBuilder::default()
    }

    /// 设置防抖动延迟
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// 已排序的存储列表
    pub fn stores(&self) -> &[Arc<dyn Store>] {
        &self.stores
    }

    /// 执行一次完整合并
    pub async fn merge(&self) -> Result<Document, SourceError> {
        merge(&self.stores).await
    }

    /// 启动配置源
    ///
    /// 首次合并失败是致命的，直接返回错误；之后的重载失败只记录日志并保留当前配置。
    ///
    /// # 参数
    /// * `distributor` - 接收合并结果的分发器
    ///
    /// # 返回
    /// * `Result<SourceHandle, SourceError>` - 监控句柄
    pub async fn start(self, distributor: Distributor) -> Result<SourceHandle, SourceError> {
        info!("启动配置源，共 {} 个存储", self.stores.len());

        // 先注册监控再合并，合并期间发生的变更会在重载循环中补上
        let targets: Vec<WatchedFile> = self
            .stores
            .iter()
            .filter_map(|s| {
                s.watch_path()
                    .map(|p| WatchedFile::new(s.name(), p).optional(s.is_optional()))
            })
            .collect();

        let (watcher, change_rx) = if targets.is_empty() {
            debug!("没有需要监控的配置存储");
            (None, None)
        } else {
            let (watcher, rx) = StoreWatcher::start(targets)?;
            (Some(watcher), Some(rx))
        };

        let document = self.merge().await.map_err(|e| {
            error!("初始配置合并失败: {}", e);
            e
        })?;
        distributor.on_snapshot(document);

        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(reload_loop(
            self.stores,
            self.debounce,
            distributor,
            change_rx,
            reload_rx,
        ));

        Ok(SourceHandle {
            watcher,
            reload_tx,
            task: Some(task),
        })
    }
}

/// 重载循环：文件变更（防抖动后）或手动请求都会触发完整合并
async fn reload_loop(
    stores: Vec<Arc<dyn Store>>,
    debounce: Duration,
    distributor: Distributor,
    mut change_rx: Option<mpsc::UnboundedReceiver<StoreChangeEvent>>,
    mut reload_rx: mpsc::UnboundedReceiver<ReloadReply>,
) {
    loop {
        tokio::select! {
            event = recv_change(&mut change_rx) => {
                let Some(event) = event else {
                    change_rx = None;
                    continue;
                };
                debug!("配置存储 {} 发生变更: {}", event.store, event.path.display());

                // 延迟处理，确保文件写入完成，并合并这段时间内的重复事件
                tokio::time::sleep(debounce).await;
                if let Some(rx) = change_rx.as_mut() {
                    while rx.try_recv().is_ok() {}
                }

                match merge(&stores).await {
                    Ok(document) => {
                        let snapshot = distributor.on_snapshot(document);
                        info!("配置重载成功，版本: {}", snapshot.version());
                    }
                    Err(e) => {
                        error!("配置重载失败，保留当前配置: {}", e);
                    }
                }
            }
            request = reload_rx.recv() => {
                let Some(reply) = request else {
                    break;
                };
                let result = merge(&stores)
                    .await
                    .map(|document| distributor.on_snapshot(document));
                if let Err(e) = &result {
                    error!("手动重载失败，保留当前配置: {}", e);
                }
                if reply.send(result).is_err() {
                    debug!("手动重载的调用方已放弃等待");
                }
            }
        }
    }
    debug!("配置重载任务结束");
}

async fn recv_change(
    rx: &mut Option<mpsc::UnboundedReceiver<StoreChangeEvent>>,
) -> Option<StoreChangeEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// 运行中配置源的句柄，丢弃时注销文件监控
pub struct SourceHandle {
    watcher: Option<StoreWatcher>,
    reload_tx: mpsc::UnboundedSender<ReloadReply>,
    task: Option<JoinHandle<()>>,
}

impl SourceHandle {
    /// 是否有被监控的存储
    pub fn is_watching(&self) -> bool {
        self.watcher
            .as_ref()
            .is_some_and(|w| !w.directories().is_empty())
    }

    /// 立即执行一次完整合并并分发
    pub async fn reload_now(&self) -> Result<ConfigSnapshot, SourceError> {
        let (tx, rx) = oneshot::channel();
        let stopped = || SourceError::Unavailable {
            store: "*".to_string(),
            reason: "配置源已停止".to_string(),
        };
        self.reload_tx.send(tx).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// 停止监控并结束重载任务
    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(task) = self.task.take() {
            task.abort();
            info!("配置源已停止");
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 配置源构建器，对应常见的 "基础文档 + 默认配置 + 覆盖文件" 部署形态
#[derive(Default)]
pub struct ConfigSourceBuilder {
    stores: Vec<Arc<dyn Store>>,
    debounce: Option<Duration>,
}

impl ConfigSourceBuilder {
    /// 作为其他配置基础的文档
    pub fn base(mut self, document: Document) -> Self {
        info!("使用基础配置对象作为其他配置的底层");
        self.stores
            .push(Arc::new(MemoryStore::new("base", BASE_RANK, document)));
        self
    }

    /// 内嵌的默认配置文本
    pub fn embedded_defaults(
        mut self,
        format: StoreFormat,
        content: &str,
    ) -> Result<Self, SourceError> {
        info!("读取内嵌默认配置");
        let store = MemoryStore::parse("defaults", DEFAULTS_RANK, format, content)?;
        self.stores.push(Arc::new(store));
        Ok(self)
    }

    /// 文件形式的默认配置（必需、不监控）
    pub fn defaults_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        info!("读取默认配置文件: {}", path.as_ref().display());
        let store = FileStore::new(path, DEFAULTS_RANK)
            .with_name("defaults")
            .watched(false);
        self.stores.push(Arc::new(store));
        self
    }

    /// 覆盖默认配置并被监控变更的文件（必需）
    pub fn override_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        info!("使用 {} 中的配置覆盖默认配置", path.as_ref().display());
        let store = FileStore::new(path, OVERRIDE_RANK).with_name("override");
        self.stores.push(Arc::new(store));
        self
    }

    /// 添加任意存储
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.stores.push(store);
        self
    }

    /// 设置防抖动延迟
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    /// 构建配置源
    pub fn build(self) -> ConfigSource {
        if self.stores.is_empty() {
            warn!("配置源没有任何存储，合并结果将为空文档");
        }
        let source = ConfigSource::new(self.stores);
        match self.debounce {
            Some(debounce) => source.with_debounce(debounce),
            None => source,
        }
    }
}
