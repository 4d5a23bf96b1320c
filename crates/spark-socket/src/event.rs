//! # 事件通知
//!
//! ## 角色定位（Why）
//! - 应用层无需轮询健康状态：订阅状态变化、数据到达与异常三类事件即可驱动业务，
//!   服务端额外提供监听状态事件。
//!
//! ## 行为契约（What）
//! - 事件记录构造后不可变，以共享引用交给零个或多个订阅者；
//! - [`Observers::emit`] 先复制订阅者快照再逐个调用，回调内部可以自由订阅、
//!   退订或再次触发引擎操作；
//! - 单个订阅者 panic 会被捕获并记录，其余订阅者照常收到事件。

use std::any::Any;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::codec::Package;
use crate::connection::Connection;
use crate::error::SocketError;
use crate::protocol::ProtocolKind;
use crate::status::SocketStatus;

/// 解码完成的数据事件。
#[derive(Clone)]
pub struct DataReceived {
    protocol: ProtocolKind,
    local: SocketAddr,
    remote: SocketAddr,
    package: Package,
}

impl DataReceived {
    pub fn new(
        protocol: ProtocolKind,
        local: SocketAddr,
        remote: SocketAddr,
        package: Package,
    ) -> Self {
        Self {
            protocol,
            local,
            remote,
            package,
        }
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    /// 按具体类型读取报文。
    pub fn package_as<T: Any>(&self) -> Option<&T> {
        self.package.downcast_ref::<T>()
    }
}

impl core::fmt::Debug for DataReceived {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataReceived")
            .field("protocol", &self.protocol)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// 异步路径上发生的异常，通常只用于日志与排障。
#[derive(Clone, Debug)]
pub struct ExceptionHappened {
    address: Option<SocketAddr>,
    description: Cow<'static, str>,
    cause: Arc<SocketError>,
}

impl ExceptionHappened {
    pub fn new(
        address: Option<SocketAddr>,
        description: impl Into<Cow<'static, str>>,
        cause: SocketError,
    ) -> Self {
        Self {
            address,
            description: description.into(),
            cause: Arc::new(cause),
        }
    }

    /// 发生异常的地址：客户端为远端，服务端监听异常为监听地址。
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn cause(&self) -> &SocketError {
        &self.cause
    }
}

/// 连接状态变化。
#[derive(Clone, Debug)]
pub struct SocketStatusChanged {
    status: SocketStatus,
    connection: Connection,
}

impl SocketStatusChanged {
    pub(crate) fn new(status: SocketStatus, connection: Connection) -> Self {
        Self { status, connection }
    }

    pub fn status(&self) -> SocketStatus {
        self.status
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

/// 服务端监听状态变化。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenStatusChanged {
    endpoint: SocketAddr,
    listening: bool,
}

impl ListenStatusChanged {
    pub(crate) fn new(endpoint: SocketAddr, listening: bool) -> Self {
        Self {
            endpoint,
            listening,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }
}

/// 订阅句柄，用于退订；在进程内全局唯一，可直接交给任意一个事件源退订。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// 某一类事件的订阅者列表。
pub struct Observers<E> {
    slots: RwLock<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        self.slots.write().push((id, Arc::new(callback)));
        id
    }

    /// 退订；返回该句柄是否属于本列表。
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|(slot, _)| *slot != id);
        slots.len() != before
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// 依次通知全部订阅者。
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .slots
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!(
                    event = core::any::type_name::<E>(),
                    "event subscriber panicked; remaining subscribers still notified"
                );
            }
        }
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> core::fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Observers")
            .field("subscribers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let observers = Observers::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        observers.subscribe(|_| panic!("subscriber failure"));
        let counter = Arc::clone(&seen);
        observers.subscribe(move |value| {
            counter.fetch_add(*value as usize, Ordering::SeqCst);
        });

        observers.emit(&3);
        observers.emit(&4);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn unsubscribe_removes_only_that_callback() {
        let observers = Observers::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let first = {
            let hits = Arc::clone(&hits);
            observers.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let hits_second = Arc::clone(&hits);
        observers.subscribe(move |_| {
            hits_second.fetch_add(10, Ordering::SeqCst);
        });

        assert!(observers.unsubscribe(first));
        assert!(!observers.unsubscribe(first));
        observers.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn subscribers_may_subscribe_during_emit() {
        let observers = Arc::new(Observers::<()>::new());
        let inner = Arc::clone(&observers);
        observers.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        observers.emit(&());
        assert_eq!(observers.len(), 2);
    }
}
