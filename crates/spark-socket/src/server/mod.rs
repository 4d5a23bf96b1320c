//! # 服务端引擎
//!
//! ## 角色定位（Why）
//! - [`SocketServer`] 持有监听套接字、接受循环与连接表，把每个被接受的 TCP 套接字
//!   包装为 [`Connection`]，并把各连接的事件转发给服务端订阅者。
//!
//! ## 行为契约（What）
//! - `start` 绑定并以配置的 backlog 进入监听，返回实际监听地址；已在监听时直接
//!   返回当前地址；
//! - 接受循环在监听状态为 `Established` 期间持续投递下一次 accept，单次失败只
//!   报告异常；
//! - 连接在接受后立即登记，观察到该连接自身的 `Shutdown` 事件时移除该条目；
//! - `stop` 以比较交换离开 `Established`，释放全部连接、关闭监听并恰好一次
//!   触发监听状态 `false`；通知发出时监听端口已经释放。
//!
//! ## 风险提示（Trade-offs）
//! - 广播发送在快照上逐个执行，单个连接失败被记录后跳过；
//! - 监听套接字只由服务端持有，接受循环在槽位锁内借用它轮询，`stop` 取出并
//!   丢弃即关闭；循环任务随后被中止。

mod registry;

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::codec::CodecFactory;
use crate::config::ServerConfig;
use crate::connection::{Connection, SendOptions};
use crate::error::{self, Result, SocketError};
use crate::event::{
    DataReceived, ExceptionHappened, ListenStatusChanged, Observers, SocketStatusChanged,
    SubscriptionId,
};
use crate::socket;
use crate::status::{SocketStatus, StatusCell};

use self::registry::ConnectionRegistry;

/// 服务端发送方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendMode {
    /// 等待写出完成。
    #[default]
    Blocking,
    /// 编码后交给运行时异步写出，写出失败以异常事件报告。
    Async,
}

#[derive(Default)]
struct ServerEvents {
    listen: Observers<ListenStatusChanged>,
    client_status: Observers<SocketStatusChanged>,
    data: Observers<DataReceived>,
    exception: Observers<ExceptionHappened>,
}

/// 监听槽位：当前监听套接字与启动代号。
#[derive(Debug, Default)]
struct ListenerSlot {
    generation: u64,
    listener: Option<TcpListener>,
}

struct ServerInner {
    config: ServerConfig,
    codec_factory: Arc<dyn CodecFactory>,
    status: StatusCell,
    listen_addr: Mutex<Option<SocketAddr>>,
    listener: Mutex<ListenerSlot>,
    acceptor: Mutex<Option<AbortHandle>>,
    registry: ConnectionRegistry,
    events: ServerEvents,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.get_mut().take() {
            acceptor.abort();
        }
    }
}

/// TCP 服务端。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 统一管理监听、接入与连接表，应用只需订阅事件并调用 `send`；
///
/// ## 逻辑 (How)
/// - 监听状态复用连接的四态寄存器；
/// - 接受循环与连接回调只持有服务端的弱引用，服务端句柄全部释放后循环自动退出；
///
/// ## 契约 (What)
/// - 每个被接受的连接从编解码器工厂获得独立实例；
/// - `get_connection`/`send` 以连接的远端地址为键。
#[derive(Clone)]
pub struct SocketServer {
    inner: Arc<ServerInner>,
}

impl SocketServer {
    /// 以给定配置与编解码器工厂创建服务端；配置非法时返回用法错误。
    pub fn new(config: ServerConfig, codec_factory: Arc<dyn CodecFactory>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                codec_factory,
                status: StatusCell::new(SocketStatus::Undefined),
                listen_addr: Mutex::new(None),
                listener: Mutex::new(ListenerSlot::default()),
                acceptor: Mutex::new(None),
                registry: ConnectionRegistry::new(),
                events: ServerEvents::default(),
            }),
        })
    }

    fn upgrade(weak: &Weak<ServerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// 开始监听并启动接受循环。
    ///
    /// # 契约 (What)
    /// - 需要在 Tokio 运行时内调用；
    /// - 绑定或监听失败时状态回到 `Shutdown`，可以换地址重试；
    /// - 返回实际监听地址，端口为 0 时即系统分配的端口。
    pub fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let runtime = Handle::try_current()
            .map_err(|_| SocketError::RuntimeUnavailable { operation: "start" })?;
        if let Err(active) = self.inner.status.begin_establishing() {
            return match (active, self.listen_addr()) {
                (SocketStatus::Established, Some(current)) => Ok(current),
                _ => Err(SocketError::invalid_state("start", active)),
            };
        }

        let (listener, local) = match self.bind(addr) {
            Ok(bound) => bound,
            Err(err) => {
                let _ = self.inner.status.begin_shutdown();
                return Err(err);
            }
        };
        *self.inner.listen_addr.lock() = Some(local);
        let generation = {
            let mut slot = self.inner.listener.lock();
            slot.generation += 1;
            slot.listener = Some(listener);
            slot.generation
        };
        if let Err(actual) = self
            .inner
            .status
            .transition(SocketStatus::Establishing, SocketStatus::Established)
        {
            self.inner.listener.lock().listener = None;
            return Err(SocketError::invalid_state("start", actual));
        }

        let task = runtime.spawn(accept_loop(Arc::downgrade(&self.inner), generation));
        if let Some(previous) = self.inner.acceptor.lock().replace(task.abort_handle()) {
            previous.abort();
        }
        if self.inner.status.load() != SocketStatus::Established {
            task.abort();
        }

        tracing::info!(listen = %local, backlog = self.inner.config.backlog, "socket server listening");
        self.inner
            .events
            .listen
            .emit(&ListenStatusChanged::new(local, true));
        Ok(local)
    }

    fn bind(&self, addr: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
        let listener = socket::open_listener(addr, self.inner.config.backlog)?;
        let local = listener
            .local_addr()
            .map_err(|err| SocketError::io(error::LISTEN, err))?;
        Ok((listener, local))
    }

    /// 停止监听并释放全部连接；未在监听时为空操作。
    ///
    /// 返回前监听套接字已关闭，端口可以立即被重新绑定。
    pub fn stop(&self) {
        if self
            .inner
            .status
            .transition(SocketStatus::Established, SocketStatus::Shutdown)
            .is_err()
        {
            return;
        }
        self.disconnect_all();
        let listener = self.inner.listener.lock().listener.take();
        drop(listener);
        if let Some(acceptor) = self.inner.acceptor.lock().take() {
            acceptor.abort();
        }
        let endpoint = *self.inner.listen_addr.lock();
        if let Some(endpoint) = endpoint {
            tracing::info!(listen = %endpoint, "socket server stopped");
            self.inner
                .events
                .listen
                .emit(&ListenStatusChanged::new(endpoint, false));
        }
    }

    /// 断开全部连接后停止监听。
    pub fn dispose(&self) {
        self.disconnect_all();
        self.stop();
    }

    pub fn is_listening(&self) -> bool {
        self.inner.status.load() == SocketStatus::Established
    }

    /// 最近一次成功监听的地址。
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.inner.listen_addr.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn get_connections(&self) -> Vec<Connection> {
        self.inner.registry.snapshot()
    }

    pub fn get_connection(&self, remote: SocketAddr) -> Option<Connection> {
        self.inner.registry.get(&remote)
    }

    /// 释放指定远端的连接；返回该连接是否存在。
    pub fn disconnect(&self, remote: SocketAddr) -> bool {
        match self.inner.registry.get(&remote) {
            Some(connection) => {
                connection.dispose();
                self.inner.registry.remove_exact(&remote, &connection);
                true
            }
            None => false,
        }
    }

    /// 释放全部连接。
    pub fn disconnect_all(&self) {
        for connection in self.inner.registry.snapshot() {
            connection.dispose();
            if let Some(remote) = connection.remote_addr() {
                self.inner.registry.remove_exact(&remote, &connection);
            }
        }
    }

    /// 定向或广播发送。
    ///
    /// # 契约 (What)
    /// - `target` 为 `Some` 时只发送给该远端，不在连接表中返回 `NotConnected`，
    ///   发送失败原样返回；
    /// - `target` 为 `None` 时广播给快照中的全部连接，单个连接失败被记录并跳过；
    /// - 返回成功接收本次发送的连接数。
    pub async fn send(
        &self,
        target: Option<SocketAddr>,
        data: &[u8],
        mode: SendMode,
        options: SendOptions<'_>,
    ) -> Result<usize> {
        let status = self.inner.status.load();
        if status != SocketStatus::Established {
            return Err(SocketError::invalid_state("send", status));
        }

        if let Some(remote) = target {
            let connection = self
                .inner
                .registry
                .get(&remote)
                .ok_or(SocketError::NotConnected(remote))?;
            send_one(&connection, data, mode, options).await?;
            return Ok(1);
        }

        let mut delivered = 0;
        for connection in self.inner.registry.snapshot() {
            match send_one(&connection, data, mode, options).await {
                Ok(()) => delivered += 1,
                Err(err) => tracing::warn!(
                    remote = ?connection.remote_addr(),
                    code = err.code(),
                    error = %err,
                    "broadcast skipped a connection"
                ),
            }
        }
        Ok(delivered)
    }

    pub fn on_listen_status_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ListenStatusChanged) + Send + Sync + 'static,
    {
        self.inner.events.listen.subscribe(callback)
    }

    /// 订阅全部连接的状态变化。
    pub fn on_client_status_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SocketStatusChanged) + Send + Sync + 'static,
    {
        self.inner.events.client_status.subscribe(callback)
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

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let events = &self.inner.events;
        events.listen.unsubscribe(id)
            || events.client_status.unsubscribe(id)
            || events.data.unsubscribe(id)
            || events.exception.unsubscribe(id)
    }

    /// 接入一个新连接：订阅、登记、通知，最后启动接收。
    fn admit(&self, stream: TcpStream, remote: SocketAddr) {
        let codec = self.inner.codec_factory.create_codec();
        let connection = match Connection::accepted(
            stream,
            remote,
            self.inner.config.connection.clone(),
            codec,
        ) {
            Ok(connection) => connection,
            Err(err) => {
                self.report(Some(remote), "failed to prepare accepted connection", err);
                return;
            }
        };

        let weak = Arc::downgrade(&self.inner);
        connection.on_status_changed(move |event| {
            let Some(server) = SocketServer::upgrade(&weak) else {
                return;
            };
            if event.status() == SocketStatus::Shutdown {
                if let Some(remote) = event.connection().remote_addr() {
                    server.inner.registry.remove_exact(&remote, event.connection());
                }
            }
            server.inner.events.client_status.emit(event);
        });
        let weak = Arc::downgrade(&self.inner);
        connection.on_data_received(move |event| {
            if let Some(server) = SocketServer::upgrade(&weak) {
                server.inner.events.data.emit(event);
            }
        });
        let weak = Arc::downgrade(&self.inner);
        connection.on_exception(move |event| {
            if let Some(server) = SocketServer::upgrade(&weak) {
                server.inner.events.exception.emit(event);
            }
        });

        self.inner.registry.insert(remote, connection.clone());
        if !self.is_listening() {
            connection.dispose();
            self.inner.registry.remove_exact(&remote, &connection);
            return;
        }

        tracing::debug!(
            listen = ?self.listen_addr(),
            remote = %remote,
            connections = self.inner.registry.len(),
            "accepted connection"
        );
        self.inner
            .events
            .client_status
            .emit(&SocketStatusChanged::new(
                SocketStatus::Established,
                connection.clone(),
            ));
        connection.start_receive();
    }

    fn report(&self, address: Option<SocketAddr>, description: &'static str, cause: SocketError) {
        tracing::debug!(
            address = ?address,
            code = cause.code(),
            error = %cause,
            "{description}"
        );
        let event = ExceptionHappened::new(address, description, cause);
        self.inner.events.exception.emit(&event);
    }
}

impl core::fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SocketServer")
            .field("status", &self.inner.status.load())
            .field("listen", &self.listen_addr())
            .field("connections", &self.inner.registry.len())
            .finish()
    }
}

async fn send_one(
    connection: &Connection,
    data: &[u8],
    mode: SendMode,
    options: SendOptions<'_>,
) -> Result<()> {
    match mode {
        SendMode::Blocking => connection.send(data, options).await.map(|_| ()),
        SendMode::Async => connection.begin_send(data, options),
    }
}

/// 在槽位锁内借用监听套接字轮询一次 accept；已关闭或已换代时返回 `Ready(None)`。
fn poll_accept(
    weak: &Weak<ServerInner>,
    generation: u64,
    cx: &mut Context<'_>,
) -> Poll<Option<io::Result<(TcpStream, SocketAddr)>>> {
    let Some(inner) = weak.upgrade() else {
        return Poll::Ready(None);
    };
    let slot = inner.listener.lock();
    let polled = match slot.listener.as_ref() {
        Some(listener) if slot.generation == generation => listener.poll_accept(cx).map(Some),
        _ => Poll::Ready(None),
    };
    drop(slot);
    polled
}

async fn accept_loop(weak: Weak<ServerInner>, generation: u64) {
    loop {
        let Some(accepted) = poll_fn(|cx| poll_accept(&weak, generation, cx)).await else {
            break;
        };
        let Some(server) = SocketServer::upgrade(&weak) else {
            break;
        };
        if !server.is_listening() {
            break;
        }
        match accepted {
            Ok((stream, remote)) => server.admit(stream, remote),
            Err(err) => server.report(
                server.listen_addr(),
                "accept failed",
                SocketError::io(error::ACCEPT, err),
            ),
        }
    }
}
