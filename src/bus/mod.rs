//! 进程内消息总线
//!
//! 连接分发器与组件的通信基础设施，提供两种原语：
//! - 点对点请求/响应，每个请求至多一个回复
//! - 一对多发布，每个订阅者拥有独立的 FIFO 队列，队列满时合并为最新一条
//!
//! 消息只在进程内传递，以 `Arc` 共享引用的方式投递，不做任何序列化。

pub mod publish;
pub mod request;

pub use publish::{PublishReport, Subscription, SubscriptionHandle};
pub use request::{HandlerError, HandlerRegistration};

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// 配置变更广播地址
pub const CONFIG_CHANGE_ADDRESS: &str = "config_relay.config.change";

/// 当前配置请求地址
pub const CONFIG_CURRENT_ADDRESS: &str = "config_relay.config.current";

/// 总线上传递的消息载荷
pub type Payload = Arc<dyn Any + Send + Sync>;

/// 消息总线句柄，克隆后共享同一个总线
#[derive(Clone, Default)]
pub struct Bus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
pub(crate) struct BusInner {
    handlers: RwLock<HashMap<String, request::HandlerSlot>>,
    subscribers: RwLock<HashMap<String, Vec<publish::SubscriberSlot>>>,
}

impl Bus {
    /// 创建新的消息总线
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定地址上的活跃订阅数量
    pub fn subscriber_count(&self, address: &str) -> usize {
        read_lock(&self.inner.subscribers)
            .get(address)
            .map(|slots| slots.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// 指定地址上是否注册了请求处理器
    pub fn has_handler(&self, address: &str) -> bool {
        read_lock(&self.inner.handlers).contains_key(address)
    }
}

// 注册表只在短临界区内访问，锁中毒时沿用内部数据
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
