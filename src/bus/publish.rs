//! 发布/订阅原语
//!
//! 每个订阅拥有一个有界 FIFO 队列。发布时对每个活跃订阅尝试投递一次，不会阻塞发布方。
//! 队列已满时消息进入订阅的溢出槽，溢出槽只保留最新的一条，被替换的旧消息计入合并数；
//! 订阅方取空队列后再取溢出槽，因此顺序不变，最后发布的消息总能送达。
//! 队列已关闭视为投递失败。

use super::{lock, read_lock, write_lock, Bus, BusInner, Payload};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};
use tracing::{debug, warn};
use uuid::Uuid;

/// 队列满时保留的最新消息
#[derive(Default)]
struct Overflow {
    pending: Option<Payload>,
    /// 被更新的消息替换掉、不会再送达的消息数
    replaced: u64,
}

pub(crate) struct SubscriberSlot {
    id: Uuid,
    sender: mpsc::Sender<Payload>,
    overflow: Arc<Mutex<Overflow>>,
}

enum Delivery {
    Queued,
    Coalesced,
    Closed,
}

impl SubscriberSlot {
    // 溢出槽非空时新消息必须进入溢出槽，不能越过它进入队列
    fn deliver(&self, payload: Payload) -> Delivery {
        let mut overflow = lock(&self.overflow);
        if overflow.pending.is_some() {
            overflow.pending = Some(payload);
            overflow.replaced += 1;
            return Delivery::Coalesced;
        }
        match self.sender.try_send(payload) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(payload)) => {
                overflow.pending = Some(payload);
                Delivery::Coalesced
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

impl SubscriberSlot {
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// 一次发布的投递结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// 成功入队的订阅数
    pub delivered: usize,
    /// 队列已满、消息进入溢出槽的订阅数
    pub coalesced: usize,
    /// 投递失败的订阅数
    pub failed: usize,
}

/// 可克隆的订阅句柄，用于在队列所有者之外注销订阅
#[derive(Clone)]
pub struct SubscriptionHandle {
    bus: Weak<BusInner>,
    address: String,
    id: Uuid,
}

impl SubscriptionHandle {
    /// 订阅标识
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 订阅的地址
    pub fn address(&self) -> &str {
        &self.address
    }

    /// 注销订阅，之后的发布不再投递到该队列，已入队的消息仍可被取出
    pub fn unsubscribe(&self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut subscribers = write_lock(&inner.subscribers);
        if let Some(slots) = subscribers.get_mut(&self.address) {
            let before = slots.len();
            slots.retain(|slot| slot.id != self.id);
            if slots.len() < before {
                debug!("注销订阅: {} ({})", self.address, self.id);
            }
            if slots.is_empty() {
                subscribers.remove(&self.address);
            }
        }
    }
}

/// 地址上的一个订阅，丢弃时自动注销
pub struct Subscription<T> {
    receiver: mpsc::Receiver<Payload>,
    overflow: Arc<Mutex<Overflow>>,
    handle: SubscriptionHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> Subscription<T> {
    /// 接收下一条消息，订阅注销且队列取空后返回 None
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        loop {
            let payload = match self.try_next() {
                Ok(Some(payload)) => payload,
                Ok(None) => self.receiver.recv().await?,
                Err(()) => return None,
            };
            match payload.downcast::<T>() {
                Ok(message) => return Some(message),
                Err(_) => warn!("丢弃类型不匹配的消息: {}", self.handle.address),
            }
        }
    }

    // 持有溢出槽的锁时发布方无法入队，队列为空即说明溢出槽中的消息是最新的
    fn try_next(&mut self) -> Result<Option<Payload>, ()> {
        let mut overflow = lock(&self.overflow);
        match self.receiver.try_recv() {
            Ok(payload) => Ok(Some(payload)),
            Err(TryRecvError::Empty) => Ok(overflow.pending.take()),
            Err(TryRecvError::Disconnected) => overflow.pending.take().map(Some).ok_or(()),
        }
    }

    /// 取出并清零自上次调用以来被合并掉的消息数
    pub fn take_coalesced(&self) -> u64 {
        std::mem::take(&mut lock(&self.overflow).replaced)
    }

    /// 订阅句柄
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// 注销订阅
    pub fn unsubscribe(&mut self) {
        self.handle.unsubscribe();
        self.receiver.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

impl Bus {
    /// 订阅地址
    ///
    /// # 参数
    /// * `address` - 地址
    /// * `capacity` - 队列容量（0 按 1 处理），溢出槽不计入容量
    ///
    /// # 返回
    /// * `Subscription<T>` - 订阅
    pub fn subscribe<T: Any + Send + Sync>(
        &self,
        address: impl Into<String>,
        capacity: usize,
    ) -> Subscription<T> {
        let address = address.into();
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = Uuid::new_v4();
        let overflow = Arc::new(Mutex::new(Overflow::default()));

        write_lock(&self.inner.subscribers)
            .entry(address.clone())
            .or_default()
            .push(SubscriberSlot {
                id,
                sender,
                overflow: Arc::clone(&overflow),
            });
        debug!("新增订阅: {} ({})", address, id);

        Subscription {
            receiver,
            overflow,
            handle: SubscriptionHandle {
                bus: Arc::downgrade(&self.inner),
                address,
                id,
            },
            _marker: PhantomData,
        }
    }

    /// 向地址的所有活跃订阅发布消息，不等待订阅方处理
    ///
    /// # 参数
    /// * `address` - 地址
    /// * `message` - 消息，所有订阅共享同一份
    ///
    /// # 返回
    /// * `PublishReport` - 投递结果
    pub fn publish<T: Any + Send + Sync>(&self, address: &str, message: T) -> PublishReport {
        let payload: Payload = Arc::new(message);
        let mut report = PublishReport::default();
        let mut closed = Vec::new();

        {
            // 读锁内逐个入队，保证同一订阅者看到的顺序与发布顺序一致
            let subscribers = read_lock(&self.inner.subscribers);
            let Some(slots) = subscribers.get(address) else {
                debug!("地址上没有订阅者: {}", address);
                return report;
            };

            for slot in slots {
                match slot.deliver(Arc::clone(&payload)) {
                    Delivery::Queued => report.delivered += 1,
                    Delivery::Coalesced => {
                        report.coalesced += 1;
                        warn!("订阅 {} 的队列已满，只保留最新一条消息", slot.id);
                    }
                    Delivery::Closed => {
                        report.failed += 1;
                        closed.push(slot.id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = write_lock(&self.inner.subscribers);
            if let Some(slots) = subscribers.get_mut(address) {
                slots.retain(|slot| !closed.contains(&slot.id));
            }
            debug!("清理已关闭的订阅: {} 个", closed.len());
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_is_fifo_per_subscriber() {
        let bus = Bus::new();
        let mut first = bus.subscribe::<u32>("numbers", 16);
        let mut second = bus.subscribe::<u32>("numbers", 16);

        for n in 1..=5u32 {
            let report = bus.publish("numbers", n);
            assert_eq!(report.delivered, 2);
        }

        for n in 1..=5u32 {
            assert_eq!(*first.recv().await.unwrap(), n);
            assert_eq!(*second.recv().await.unwrap(), n);
        }
    }

    #[tokio::test]
    async fn test_publish_shares_payload_by_reference() {
        let bus = Bus::new();
        let mut first = bus.subscribe::<String>("text", 1);
        let mut second = bus.subscribe::<String>("text", 1);

        bus.publish("text", "shared".to_string());
        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_full_queue_keeps_latest_message() {
        let bus = Bus::new();
        let mut subscription = bus.subscribe::<u32>("numbers", 2);

        assert_eq!(bus.publish("numbers", 1u32).delivered, 1);
        assert_eq!(bus.publish("numbers", 2u32).delivered, 1);
        for n in 3..=6u32 {
            let report = bus.publish("numbers", n);
            assert_eq!(
                report,
                PublishReport {
                    delivered: 0,
                    coalesced: 1,
                    failed: 0
                }
            );
        }

        assert_eq!(*subscription.recv().await.unwrap(), 1);
        assert_eq!(*subscription.recv().await.unwrap(), 2);
        assert_eq!(*subscription.recv().await.unwrap(), 6);
        assert_eq!(subscription.take_coalesced(), 3);
        assert_eq!(subscription.take_coalesced(), 0);
    }

    #[tokio::test]
    async fn test_newer_message_does_not_overtake_overflow() {
        let bus = Bus::new();
        let mut subscription = bus.subscribe::<u32>("numbers", 1);

        bus.publish("numbers", 1u32);
        bus.publish("numbers", 2u32);
        assert_eq!(*subscription.recv().await.unwrap(), 1);

        // 队列已有空位，但溢出槽中还有更早的消息
        let report = bus.publish("numbers", 3u32);
        assert_eq!(report.coalesced, 1);
        assert_eq!(*subscription.recv().await.unwrap(), 3);

        bus.publish("numbers", 4u32);
        assert_eq!(*subscription.recv().await.unwrap(), 4);
        assert_eq!(subscription.take_coalesced(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_but_drains_queue() {
        let bus = Bus::new();
        let mut subscription = bus.subscribe::<u32>("numbers", 4);
        bus.publish("numbers", 1u32);

        subscription.handle().unsubscribe();
        assert_eq!(bus.subscriber_count("numbers"), 0);
        assert_eq!(bus.publish("numbers", 2u32), PublishReport::default());

        assert_eq!(*subscription.recv().await.unwrap(), 1);
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let bus = Bus::new();
        let subscription = bus.subscribe::<u32>("numbers", 4);
        assert_eq!(bus.subscriber_count("numbers"), 1);

        drop(subscription);
        assert_eq!(bus.subscriber_count("numbers"), 0);
    }

    #[tokio::test]
    async fn test_mismatched_messages_are_skipped() {
        let bus = Bus::new();
        let mut subscription = bus.subscribe::<u32>("mixed", 4);

        bus.publish("mixed", "not a number".to_string());
        bus.publish("mixed", 9u32);
        assert_eq!(*subscription.recv().await.unwrap(), 9);
    }
}
