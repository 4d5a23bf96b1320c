#![doc = r#"
# spark-socket

## 设计动机（Why）
- **定位**：该 crate 提供传输无关的套接字引擎，统一管理 TCP、UDP 与组播套接字
  的生命周期，驱动异步收发循环，并以可插拔的编解码边界承载应用层协议。
- **架构角色**：客户端通过 [`ClientBuilder`] 创建 [`Connection`]，服务端由
  [`SocketServer`] 接受连接并维护按远端地址索引的连接表；两侧共享同一个连接
  状态机与事件模型。
- **设计理念**：套接字细节与分帧逻辑彻底解耦，引擎只搬运字节，[`Codec`] 负责
  编码、分帧与报文解析。

## 核心契约（What）
- **状态机**：`Undefined → Establishing → Established → Shutdown`，转换以原子
  比较交换完成，每次转换恰好触发一次状态事件；
- **接收**：每个连接同一时刻只有一个未完成的接收，解码严格串行；TCP 零字节读
  与复位类错误触发拆除，其余错误仅报告；
- **发送**：未建立时立即失败；编码失败放弃本次发送且不写出任何字节；
- **错误**：同步路径返回 [`SocketError`]，异步路径通过
  [`ExceptionHappened`] 事件报告，二者共享稳定错误码与 [`ErrorCategory`]。

## 实现策略（How）
- **执行框架**：全部 IO 运行在 Tokio 上；套接字选项（缓冲区、keep-alive、
  地址复用、组播成员、backlog）通过 `socket2` 设置后移交 Tokio；
- **并发表**：服务端连接表基于 `DashMap`，遍历前先取快照；
- **事件**：订阅者列表以 `parking_lot::RwLock` 保护，派发在锁外进行，
  单个订阅者 panic 不影响其他订阅者。

## 风险与考量（Trade-offs）
- **发送顺序**：同一连接上的并发发送不做串行化，字节顺序由调用方保证；
- **接收超时**：接收操作没有超时与取消，唯一的有界等待是 TCP 握手；
- **远端地址**：TCP 数据事件沿用连接配置的远端，而非每次读取时重新查询。
"#]

mod client;
mod codec;
mod config;
mod connection;
mod error;
mod event;
mod protocol;
mod server;
mod socket;
mod status;

pub use client::ClientBuilder;
pub use codec::{
    Codec, CodecError, CodecFactory, DecodeOutput, InboundFrame, Package, PassthroughCodec,
    UserTag,
};
pub use config::{
    DEFAULT_ACCEPT_BACKLOG, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL, ServerConfig,
    SocketConfig, TCP_DATA_BUFFER_SIZE, TCP_SOCKET_RECV_BUFFER_SIZE, TCP_SOCKET_SEND_BUFFER_SIZE,
    UDP_DATA_BUFFER_SIZE, UDP_SOCKET_RECV_BUFFER_SIZE, UDP_SOCKET_SEND_BUFFER_SIZE,
};
pub use connection::{Connection, ConnectionOrigin, SendOptions};
pub use error::{ErrorCategory, OperationKind, Result, SocketError};
pub use event::{
    DataReceived, ExceptionHappened, ListenStatusChanged, Observers, SocketStatusChanged,
    SubscriptionId,
};
pub use protocol::ProtocolKind;
pub use server::{SendMode, SocketServer};
pub use status::SocketStatus;
