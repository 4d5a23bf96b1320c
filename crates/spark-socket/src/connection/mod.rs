//! # 连接状态机
//!
//! ## 角色定位（Why）
//! - [`Connection`] 持有一个套接字（TCP 对端、UDP 本地端点或组播成员）、
//!   四态状态机、独占的编解码器实例与三类事件源，是客户端与服务端共用的叶子组件。
//!
//! ## 行为契约（What）
//! - `create*` 仅允许在空闲态（`Undefined`/`Shutdown`）调用，地址校验先于任何
//!   状态变化与套接字创建；
//! - 拆除通过状态寄存器的比较交换完成，并发的 `destroy`、`dispose` 与 IO 致命
//!   错误中只有一方真正关闭套接字并触发一次 `Shutdown` 事件；`destroy` 返回时
//!   底层套接字已经释放，可以立即在同一本地端口上重新 `create`；
//! - 每次拆除都会 `reset` 编解码器，`dispose` 额外调用一次编解码器的 `dispose`。
//!
//! ## 实现策略（How）
//! - 协议差异集中在 [`Binding`] 与 [`IoHandle`] 两个枚举上，状态机只在建连、
//!   收包解释与发送寻址三处分支；
//! - 每次 `create` 在 io 槽位内递增一次生命周期代号，所有状态迁移都在槽位锁内
//!   完成，迟到的旧一轮建连或读循环因代号不符而放弃，不会落到新一轮上；
//! - 接收循环见 `receive` 子模块，发送路径见 `send` 子模块。
//!
//! ## 风险提示（Trade-offs）
//! - 事件在所有内部锁释放后才派发，订阅者可以在回调里调用 `send`、`destroy`
//!   甚至再次 `create`；
//! - 并发发送不做串行化，同一连接上并发写入的字节顺序由调用方自行保证。

mod receive;
mod send;

pub use send::SendOptions;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::TcpStream;

use crate::codec::Codec;
use crate::config::SocketConfig;
use crate::error::{self, Result, SocketError};
use crate::event::{
    DataReceived, ExceptionHappened, Observers, SocketStatusChanged, SubscriptionId,
};
use crate::protocol::{Binding, ProtocolKind};
use crate::socket::{self, IoHandle, SocketIo};
use crate::status::{SocketStatus, StatusCell};

/// 连接的来源。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionOrigin {
    /// 应用主动拨号或绑定的连接。
    Dialed,
    /// 服务端接受的对端连接。
    Accepted,
}

/// `local`/`remote` 为配置值，重连时原样复用；`bound` 为本轮实际绑定的地址。
#[derive(Clone, Copy, Debug, Default)]
struct Endpoints {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    bound: Option<SocketAddr>,
}

/// io 槽位：当前套接字与生命周期代号。
#[derive(Debug, Default)]
struct IoSlot {
    generation: u64,
    io: Option<SocketIo>,
}

#[derive(Default)]
struct ConnectionEvents {
    data: Observers<DataReceived>,
    exception: Observers<ExceptionHappened>,
    status: Observers<SocketStatusChanged>,
}

pub(crate) struct ConnectionInner {
    protocol: ProtocolKind,
    origin: ConnectionOrigin,
    config: SocketConfig,
    status: StatusCell,
    endpoints: Mutex<Endpoints>,
    io: Mutex<IoSlot>,
    codec: Mutex<Box<dyn Codec>>,
    disposed: AtomicBool,
    events: ConnectionEvents,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(io) = self.io.get_mut().io.take() {
            let _ = io.close();
        }
        if !*self.disposed.get_mut() {
            self.codec.get_mut().dispose();
        }
    }
}

/// 一个受管套接字及其状态机、缓冲与编解码器。
///
/// 句柄可廉价克隆，所有克隆共享同一个底层连接。
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn dialer(
        protocol: ProtocolKind,
        config: SocketConfig,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        codec: Box<dyn Codec>,
    ) -> Self {
        Self::from_parts(
            protocol,
            ConnectionOrigin::Dialed,
            config,
            SocketStatus::Undefined,
            Endpoints {
                local,
                remote,
                bound: None,
            },
            None,
            codec,
        )
    }

    /// 包装服务端接受的 TCP 流；状态直接为 `Established`，不触发事件，
    /// 接收循环由调用方在完成订阅后通过 [`Connection::start_receive`] 启动。
    pub(crate) fn accepted(
        stream: TcpStream,
        remote: SocketAddr,
        config: SocketConfig,
        codec: Box<dyn Codec>,
    ) -> Result<Self> {
        socket::configure_accepted(&stream, &config)?;
        let local = stream
            .local_addr()
            .map_err(|err| SocketError::io(error::ACCEPT, err))?;
        Ok(Self::from_parts(
            ProtocolKind::Tcp,
            ConnectionOrigin::Accepted,
            config,
            SocketStatus::Established,
            Endpoints {
                local: Some(local),
                remote: Some(remote),
                bound: Some(local),
            },
            Some(SocketIo::new(IoHandle::Stream(Arc::new(stream)))),
            codec,
        ))
    }

    fn from_parts(
        protocol: ProtocolKind,
        origin: ConnectionOrigin,
        config: SocketConfig,
        status: SocketStatus,
        endpoints: Endpoints,
        io: Option<SocketIo>,
        codec: Box<dyn Codec>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                protocol,
                origin,
                config,
                status: StatusCell::new(status),
                endpoints: Mutex::new(endpoints),
                io: Mutex::new(IoSlot { generation: 0, io }),
                codec: Mutex::new(codec),
                disposed: AtomicBool::new(false),
                events: ConnectionEvents::default(),
            }),
        }
    }

    fn upgrade(weak: &Weak<ConnectionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.inner.protocol
    }

    pub fn origin(&self) -> ConnectionOrigin {
        self.inner.origin
    }

    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SocketStatus {
        self.inner.status.load()
    }

    /// 本地端点；建立后为实际绑定的地址（含系统分配的端口）。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let endpoints = self.inner.endpoints.lock();
        endpoints.bound.or(endpoints.local)
    }

    /// 配置的远端：TCP 为对端，UDP 为默认发送目标，组播为组地址。
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.lock().remote
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// 两个句柄是否指向同一个连接。
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 以当前保存的端点建立连接，也用于 `Shutdown` 之后的重连。
    ///
    /// # 契约 (What)
    /// - **前置条件**：未释放、由应用创建、处于 `Undefined` 或 `Shutdown`；
    /// - **后置条件**：成功时状态为 `Established` 且接收循环已启动；
    ///   传输失败（绑定、握手超时等）时已完成拆除并返回错误；
    /// - 与并发的 `destroy` 竞争，或建连期间已开始新一轮生命周期时，新套接字被
    ///   关闭并返回 `InvalidState`，不会写入他人的生命周期。
    pub async fn create(&self) -> Result<()> {
        self.ensure_dialer("create")?;
        let endpoints = *self.inner.endpoints.lock();
        let binding = Binding::resolve(self.inner.protocol, endpoints.local, endpoints.remote)?;

        let generation = self.begin_lifecycle()?;
        self.emit_status(SocketStatus::Establishing);

        let handle = match self.open(&binding).await {
            Ok(handle) => handle,
            Err(err) => {
                self.teardown_lifecycle(generation);
                return Err(err);
            }
        };
        let local = self.install(generation, SocketIo::new(handle))?;

        self.inner.endpoints.lock().bound = local;
        tracing::debug!(
            protocol = %self.inner.protocol,
            local = ?local,
            remote = ?endpoints.remote,
            "socket established"
        );
        self.emit_status(SocketStatus::Established);
        self.start_receive();
        Ok(())
    }

    /// 替换远端后建立连接。
    pub async fn create_to(&self, remote: SocketAddr) -> Result<()> {
        self.create_with(None, Some(remote)).await
    }

    /// 替换本地与远端后建立连接；`local` 为 `None` 时由系统选择。
    pub async fn create_with(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<()> {
        self.ensure_dialer("create")?;
        let status = self.status();
        if status.is_active() {
            return Err(SocketError::invalid_state("create", status));
        }
        *self.inner.endpoints.lock() = Endpoints {
            local,
            remote,
            bound: None,
        };
        self.create().await
    }

    /// 关闭套接字并进入 `Shutdown`；可重复调用，也可在事件回调内调用。
    pub fn destroy(&self) {
        self.teardown();
    }

    /// 拆除连接并释放编解码器；之后的 `create` 将被拒绝。
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.teardown();
        self.inner.codec.lock().dispose();
    }

    pub fn on_data_received<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DataReceived) + Send + Sync + 'static,
    {
        self.inner.events.data.subscribe(callback)
    }

    pub fn on_exception<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ExceptionHappened) + Send + Sync + 'static,
    {
        self.inner.events.exception.subscribe(callback)
    }

    pub fn on_status_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SocketStatusChanged) + Send + Sync + 'static,
    {
        self.inner.events.status.subscribe(callback)
    }

    /// 退订任意一类事件；返回是否找到该订阅。
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let events = &self.inner.events;
        events.data.unsubscribe(id)
            || events.exception.unsubscribe(id)
            || events.status.unsubscribe(id)
    }

    fn ensure_dialer(&self, operation: &'static str) -> Result<()> {
        if self.is_disposed() {
            return Err(SocketError::Disposed { operation });
        }
        if self.inner.origin == ConnectionOrigin::Accepted {
            return Err(SocketError::Unsupported {
                protocol: self.inner.protocol,
                operation,
            });
        }
        Ok(())
    }

    /// 进入 `Establishing` 并开启新一轮生命周期，返回其代号。
    fn begin_lifecycle(&self) -> Result<u64> {
        let mut slot = self.inner.io.lock();
        self.inner
            .status
            .begin_establishing()
            .map_err(|active| SocketError::invalid_state("create", active))?;
        slot.generation += 1;
        Ok(slot.generation)
    }

    /// 把建连得到的套接字放入槽位并进入 `Established`，返回实际绑定地址。
    ///
    /// 期间已被拆除或已开始更新的一轮时关闭 `io` 并返回 `InvalidState`。
    fn install(&self, generation: u64, io: SocketIo) -> Result<Option<SocketAddr>> {
        let local = io.local_addr().ok();
        let stale = {
            let mut slot = self.inner.io.lock();
            let outcome = if slot.generation != generation {
                Err(self.status())
            } else {
                self.inner
                    .status
                    .transition(SocketStatus::Establishing, SocketStatus::Established)
            };
            match outcome {
                Ok(()) => {
                    slot.io = Some(io);
                    return Ok(local);
                }
                Err(actual) => actual,
            }
        };
        let _ = io.close();
        Err(SocketError::invalid_state("create", stale))
    }

    async fn open(&self, binding: &Binding) -> Result<IoHandle> {
        let config = &self.inner.config;
        match *binding {
            Binding::Stream { remote, .. } => {
                let stream = socket::open_stream(binding.bind_addr(), remote, config).await?;
                Ok(IoHandle::Stream(Arc::new(stream)))
            }
            Binding::Datagram { .. } | Binding::Multicast { .. } => {
                let socket = socket::open_datagram(binding, config)?;
                Ok(IoHandle::Datagram(Arc::new(socket)))
            }
        }
    }

    /// 执行一次拆除；返回本次调用是否真正关闭了套接字。
    fn teardown(&self) -> bool {
        self.shutdown(None)
    }

    /// 仅当仍处于 `generation` 这一轮生命周期时拆除。
    pub(crate) fn teardown_lifecycle(&self, generation: u64) -> bool {
        self.shutdown(Some(generation))
    }

    fn shutdown(&self, expected: Option<u64>) -> bool {
        let (prior, io) = {
            let mut slot = self.inner.io.lock();
            if expected.is_some_and(|generation| generation != slot.generation) {
                return false;
            }
            let Ok(prior) = self.inner.status.begin_shutdown() else {
                return false;
            };
            (prior, slot.io.take())
        };
        if let Some(io) = io {
            if let Err(err) = io.close() {
                self.report(
                    self.remote_addr(),
                    "failed to close socket",
                    SocketError::io(error::CLOSE, err),
                );
            }
        }
        self.inner.codec.lock().reset();
        tracing::debug!(
            protocol = %self.inner.protocol,
            local = ?self.local_addr(),
            remote = ?self.remote_addr(),
            prior = %prior,
            "socket shut down"
        );
        self.emit_status(SocketStatus::Shutdown);
        true
    }

    fn emit_status(&self, status: SocketStatus) {
        let event = SocketStatusChanged::new(status, self.clone());
        self.inner.events.status.emit(&event);
    }

    pub(crate) fn report(
        &self,
        address: Option<SocketAddr>,
        description: &'static str,
        cause: SocketError,
    ) {
        tracing::debug!(
            protocol = %self.inner.protocol,
            address = ?address,
            code = cause.code(),
            error = %cause,
            "{description}"
        );
        let event = ExceptionHappened::new(address, description, cause);
        self.inner.events.exception.emit(&event);
    }

    /// 当前套接字的句柄及其所属的生命周期代号。
    fn current_io(&self) -> Option<(u64, IoHandle)> {
        let slot = self.inner.io.lock();
        slot.io
            .as_ref()
            .map(|io| (slot.generation, io.handle().clone()))
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("protocol", &self.inner.protocol)
            .field("origin", &self.inner.origin)
            .field("status", &self.status())
            .field("local", &self.local_addr())
            .field("remote", &self.remote_addr())
            .finish()
    }
}
