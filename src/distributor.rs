//! 配置分发器
//!
//! 系统中唯一持有 "当前配置" 的对象。`current` 槽位是核心中唯一共享的可变状态，
//! 只有 `on_snapshot` 写入（单写者），`fetch`/`current` 可被任意多个任务并发读取。

use crate::bus::{Bus, HandlerError, HandlerRegistration, CONFIG_CHANGE_ADDRESS, CONFIG_CURRENT_ADDRESS};
use crate::config::snapshot::{ConfigSnapshot, Document};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 初始配置请求消息
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchRequest;

struct DistributorInner {
    bus: Bus,
    current: watch::Sender<Option<ConfigSnapshot>>,
    /// 串行化 "替换当前值 + 发布"，保证版本号与发布顺序一致
    publish_lock: Mutex<()>,
    fetch_count: AtomicU64,
    registration: Mutex<Option<HandlerRegistration>>,
}

/// 配置分发器句柄，克隆后共享同一个槽位
#[derive(Clone)]
pub struct Distributor {
    inner: Arc<DistributorInner>,
}

impl Distributor {
    /// 创建分发器并在总线上注册当前配置请求处理器
    pub fn new(bus: &Bus) -> Self {
        let (current, _) = watch::channel(None);
        let distributor = Self {
            inner: Arc::new(DistributorInner {
                bus: bus.clone(),
                current,
                publish_lock: Mutex::new(()),
                fetch_count: AtomicU64::new(0),
                registration: Mutex::new(None),
            }),
        };
        distributor.attach();
        distributor
    }

    /// 创建已持有初始值的分发器，用于没有任何被监控存储的部署
    pub fn with_value(bus: &Bus, document: Document) -> Self {
        let distributor = Self::new(bus);
        distributor.on_snapshot(document);
        distributor
    }

    fn attach(&self) {
        // 处理器只持有弱引用，避免总线与分发器之间的引用环
        let weak: Weak<DistributorInner> = Arc::downgrade(&self.inner);
        let registration =
            self.inner
                .bus
                .register_handler(CONFIG_CURRENT_ADDRESS, move |_: Arc<FetchRequest>| {
                    let weak = weak.clone();
                    async move {
                        let inner = weak
                            .upgrade()
                            .ok_or_else(|| HandlerError::new(503, "配置分发器已关闭"))?;
                        Ok(Distributor { inner }.fetch().await)
                    }
                });

        let mut slot = self
            .inner
            .registration
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(registration);
        info!("配置分发器已注册: {}", CONFIG_CURRENT_ADDRESS);
    }

    /// 获取当前配置
    ///
    /// 尚无配置时挂起，直到第一份快照到达；不会返回空的默认值。
    pub async fn fetch(&self) -> ConfigSnapshot {
        self.inner.fetch_count.fetch_add(1, Ordering::Relaxed);
        let mut rx = self.inner.current.subscribe();

        if let Ok(slot) = rx.wait_for(Option::is_some).await {
            if let Some(snapshot) = slot.as_ref() {
                return snapshot.clone();
            }
        }

        // 发送端与 self 同生命周期，不会先于调用方关闭
        std::future::pending().await
    }

    /// 接收新合并的配置：编号、替换当前值，然后广播给所有订阅者
    ///
    /// 广播不等待订阅者处理，订阅者的失败对分发器不可见。
    pub fn on_snapshot(&self, document: Document) -> ConfigSnapshot {
        let _guard = self
            .inner
            .publish_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let version = self.version() + 1;
        let snapshot = ConfigSnapshot::stamped(document, version);
        self.inner.current.send_replace(Some(snapshot.clone()));

        let report = self.inner.bus.publish(CONFIG_CHANGE_ADDRESS, snapshot.clone());
        if report.failed > 0 {
            warn!(
                "配置版本 {} 广播部分失败: 成功 {}，失败 {}",
                version, report.delivered, report.failed
            );
        } else {
            debug!(
                "配置版本 {} 已广播: 入队 {}，合并 {}",
                version, report.delivered, report.coalesced
            );
        }

        snapshot
    }

    /// 当前配置（不等待）
    pub fn current(&self) -> Option<ConfigSnapshot> {
        self.inner.current.borrow().clone()
    }

    /// 当前配置版本，尚无配置时为 0
    pub fn version(&self) -> u64 {
        self.inner
            .current
            .borrow()
            .as_ref()
            .map_or(0, ConfigSnapshot::version)
    }

    /// 累计的 fetch 调用次数
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetch_count.load(Ordering::Relaxed)
    }

    /// 分发器所在的总线
    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test document must be an object"),
        }
    }

    #[tokio::test]
    async fn test_fetch_waits_for_first_snapshot() {
        let bus = Bus::new();
        let distributor = Distributor::new(&bus);

        let mut fetch = task::spawn(distributor.fetch());
        assert_pending!(fetch.poll());

        distributor.on_snapshot(doc(json!({"foo": "bar"})));
        assert!(fetch.is_woken());
        let snapshot = assert_ready!(fetch.poll());
        assert_eq!(snapshot.get_str("foo"), Some("bar"));
        assert_eq!(snapshot.version(), 1);
    }

    #[tokio::test]
    async fn test_fetch_returns_latest() {
        let bus = Bus::new();
        let distributor = Distributor::with_value(&bus, doc(json!({"foo": "one"})));
        distributor.on_snapshot(doc(json!({"foo": "two"})));

        let snapshot = distributor.fetch().await;
        assert_eq!(snapshot.get_str("foo"), Some("two"));
        assert_eq!(snapshot.version(), 2);
        assert_eq!(distributor.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_over_bus() {
        let bus = Bus::new();
        let distributor = Distributor::new(&bus);

        let requester = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.request::<FetchRequest, ConfigSnapshot>(CONFIG_CURRENT_ADDRESS, FetchRequest, None)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!requester.is_finished());

        distributor.on_snapshot(doc(json!({"foo": "bar"})));
        let snapshot = requester.await.unwrap().unwrap();
        assert_eq!(snapshot.get_str("foo"), Some("bar"));
    }

    #[tokio::test]
    async fn test_on_snapshot_broadcasts_in_order() {
        let bus = Bus::new();
        let distributor = Distributor::new(&bus);
        let mut subscription = bus.subscribe::<ConfigSnapshot>(CONFIG_CHANGE_ADDRESS, 8);

        distributor.on_snapshot(doc(json!({"n": 1})));
        distributor.on_snapshot(doc(json!({"n": 2})));

        assert_eq!(subscription.recv().await.unwrap().version(), 1);
        assert_eq!(subscription.recv().await.unwrap().version(), 2);
        assert_eq!(distributor.version(), 2);
    }

    #[tokio::test]
    async fn test_dropped_distributor_fails_bus_fetch() {
        let bus = Bus::new();
        drop(Distributor::new(&bus));

        let result = bus
            .request::<FetchRequest, ConfigSnapshot>(CONFIG_CURRENT_ADDRESS, FetchRequest, None)
            .await;
        assert!(result.is_err());
    }
}
