//! 请求/响应原语
//!
//! 每个地址至多一个处理器。处理器在独立任务中运行，返回值即唯一的回复，
//! 处理器 panic 会被转换为 500 错误而不会影响调用方。

use super::{read_lock, write_lock, Bus, BusInner, Payload};
use crate::error::BusError;
use futures::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// 处理总线消息时发生的错误，可以指定返回码和消息
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[{code}] {message}")]
pub struct HandlerError {
    /// 返回码
    pub code: u16,
    /// 错误消息
    pub message: String,
}

impl HandlerError {
    /// 创建新的处理器错误
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

type BoxedHandler =
    Arc<dyn Fn(Payload) -> BoxFuture<'static, Result<Payload, HandlerError>> + Send + Sync>;

pub(crate) struct HandlerSlot {
    id: Uuid,
    handler: BoxedHandler,
}

/// 处理器注册句柄，丢弃或调用 `unregister` 时注销处理器
pub struct HandlerRegistration {
    bus: Weak<BusInner>,
    address: String,
    id: Uuid,
}

impl HandlerRegistration {
    /// 注册的地址
    pub fn address(&self) -> &str {
        &self.address
    }

    /// 注销处理器
    pub fn unregister(&self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut handlers = write_lock(&inner.handlers);
        // 只移除自己注册的处理器，地址可能已被重新注册
        if handlers.get(&self.address).is_some_and(|slot| slot.id == self.id) {
            handlers.remove(&self.address);
            debug!("注销请求处理器: {}", self.address);
        }
    }
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl Bus {
    /// 在地址上注册请求处理器，已有的处理器会被替换
    ///
    /// # 参数
    /// * `address` - 地址
    /// * `handler` - 处理请求并返回回复的异步闭包
    ///
    /// # 返回
    /// * `HandlerRegistration` - 注册句柄
    pub fn register_handler<Req, Resp, F, Fut>(
        &self,
        address: impl Into<String>,
        handler: F,
    ) -> HandlerRegistration
    where
        Req: Any + Send + Sync,
        Resp: Any + Send + Sync,
        F: Fn(Arc<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let address = address.into();
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |payload: Payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request = payload
                    .downcast::<Req>()
                    .map_err(|_| HandlerError::new(400, "请求消息类型不匹配"))?;
                let response = handler(request).await?;
                Ok(Arc::new(response) as Payload)
            })
        });

        let id = Uuid::new_v4();
        let previous = write_lock(&self.inner.handlers)
            .insert(address.clone(), HandlerSlot { id, handler: boxed });
        if previous.is_some() {
            warn!("地址上的请求处理器被替换: {}", address);
        } else {
            debug!("注册请求处理器: {}", address);
        }

        HandlerRegistration {
            bus: Arc::downgrade(&self.inner),
            address,
            id,
        }
    }

    /// 发送请求并等待唯一的回复
    ///
    /// # 参数
    /// * `address` - 地址
    /// * `request` - 请求消息
    /// * `timeout` - 等待回复的超时时间，None 表示一直等待
    ///
    /// # 返回
    /// * `Result<Arc<Resp>, BusError>` - 回复或错误
    pub async fn request<Req, Resp>(
        &self,
        address: &str,
        request: Req,
        timeout: Option<Duration>,
    ) -> Result<Arc<Resp>, BusError>
    where
        Req: Any + Send + Sync,
        Resp: Any + Send + Sync,
    {
        let handler = read_lock(&self.inner.handlers)
            .get(address)
            .map(|slot| Arc::clone(&slot.handler))
            .ok_or_else(|| BusError::NoHandler {
                address: address.to_string(),
            })?;

        let task = tokio::spawn(handler(Arc::new(request) as Payload));

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // 超时后不取消处理器，它的回复会被丢弃
                    return Err(BusError::Timeout {
                        address: address.to_string(),
                        timeout_ms: saturating_millis(limit),
                    });
                }
            },
            None => task.await,
        };

        let reply = match joined {
            Ok(reply) => reply,
            Err(e) if e.is_panic() => {
                error!("消息处理器内部错误: {}", address);
                return Err(BusError::Handler {
                    code: 500,
                    message: "处理器内部错误".to_string(),
                });
            }
            Err(_) => {
                return Err(BusError::ReplyDropped {
                    address: address.to_string(),
                })
            }
        };

        let payload = reply.map_err(|e| BusError::Handler {
            code: e.code,
            message: e.message,
        })?;

        payload
            .downcast::<Resp>()
            .map_err(|_| BusError::TypeMismatch {
                address: address.to_string(),
            })
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
