//! 套接字构建：选项设置交给 `socket2`，随后移交 Tokio 驱动。

use std::io;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, TcpKeepalive, Type};
use tokio::io::ReadBuf;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::config::SocketConfig;
use crate::error::{self, Result, SocketError};
use crate::protocol::Binding;

/// 连接持有的底层 IO 资源。
///
/// 读循环不持有套接字，只在槽位锁内借用它轮询；发送路径仅在一次写出期间
/// 持有 `Arc` 克隆。因此从槽位取出并 `close` 后，文件描述符在返回前即被释放。
#[derive(Debug)]
pub(crate) struct SocketIo {
    handle: IoHandle,
    reader: Option<AbortHandle>,
}

/// 发送路径使用的轻量句柄。
#[derive(Clone, Debug)]
pub(crate) enum IoHandle {
    Stream(Arc<TcpStream>),
    Datagram(Arc<UdpSocket>),
}

impl SocketIo {
    pub(crate) fn new(handle: IoHandle) -> Self {
        Self {
            handle,
            reader: None,
        }
    }

    pub(crate) fn handle(&self) -> &IoHandle {
        &self.handle
    }

    pub(crate) fn set_reader(&mut self, reader: AbortHandle) {
        if let Some(previous) = self.reader.replace(reader) {
            previous.abort();
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.handle {
            IoHandle::Stream(stream) => stream.local_addr(),
            IoHandle::Datagram(socket) => socket.local_addr(),
        }
    }

    /// 关闭套接字：TCP 先双向半关闭通知对端，再中止读循环；`self` 在返回时
    /// 释放，没有进行中的写出时文件描述符随之关闭。
    pub(crate) fn close(self) -> io::Result<()> {
        let result = match &self.handle {
            IoHandle::Stream(stream) => match SockRef::from(&**stream).shutdown(Shutdown::Both) {
                Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            IoHandle::Datagram(_) => Ok(()),
        };
        if let Some(reader) = self.reader {
            reader.abort();
        }
        result
    }
}

fn configure_err(err: io::Error) -> SocketError {
    SocketError::io(error::CONFIGURE, err)
}

fn apply_buffer_sizes(socket: &SockRef<'_>, config: &SocketConfig) -> Result<()> {
    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(configure_err)?;
    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(configure_err)?;
    Ok(())
}

fn apply_stream_options(stream: &TcpStream, config: &SocketConfig) -> Result<()> {
    stream.set_nodelay(config.nodelay).map_err(configure_err)?;
    let keepalive = TcpKeepalive::new().with_time(config.keepalive_interval);
    SockRef::from(stream)
        .set_tcp_keepalive(&keepalive)
        .map_err(configure_err)
}

/// 创建、绑定并在超时内完成 TCP 握手。
pub(crate) async fn open_stream(
    local: SocketAddr,
    remote: SocketAddr,
    config: &SocketConfig,
) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))
        .map_err(configure_err)?;
    apply_buffer_sizes(&SockRef::from(&socket), config)?;
    socket
        .bind(&SockAddr::from(local))
        .map_err(|err| SocketError::io(error::BIND, err))?;
    socket.set_nonblocking(true).map_err(configure_err)?;

    let std_stream: std::net::TcpStream = socket.into();
    let tcp = TcpSocket::from_std_stream(std_stream);
    let stream = match timeout(config.connect_timeout, tcp.connect(remote)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(SocketError::io(error::CONNECT, err)),
        Err(_) => {
            return Err(SocketError::ConnectTimeout {
                remote,
                timeout: config.connect_timeout,
            });
        }
    };
    apply_stream_options(&stream, config)?;
    Ok(stream)
}

/// 为服务端接受的连接应用缓冲与 TCP 选项。
pub(crate) fn configure_accepted(stream: &TcpStream, config: &SocketConfig) -> Result<()> {
    apply_buffer_sizes(&SockRef::from(stream), config)?;
    apply_stream_options(stream, config)
}

/// 创建并绑定 UDP 套接字；组播在绑定前开启地址复用，绑定后加入组。
pub(crate) fn open_datagram(binding: &Binding, config: &SocketConfig) -> Result<UdpSocket> {
    let bind_addr = binding.bind_addr();
    let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(configure_err)?;
    if matches!(binding, Binding::Multicast { .. }) {
        socket.set_reuse_address(true).map_err(configure_err)?;
    }
    apply_buffer_sizes(&SockRef::from(&socket), config)?;
    socket
        .bind(&SockAddr::from(bind_addr))
        .map_err(|err| SocketError::io(error::BIND, err))?;

    if let Binding::Multicast { local, group } = binding {
        join_group(&socket, *local, *group)?;
    }

    socket.set_nonblocking(true).map_err(configure_err)?;
    UdpSocket::from_std(socket.into()).map_err(configure_err)
}

fn join_group(socket: &Socket, local: SocketAddr, group: SocketAddr) -> Result<()> {
    match group.ip() {
        IpAddr::V4(group_ip) => {
            let interface = match local.ip() {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(&group_ip, &interface)
        }
        IpAddr::V6(group_ip) => socket.join_multicast_v6(&group_ip, 0),
    }
    .map_err(configure_err)
}

/// 绑定监听套接字并进入监听。
///
/// 非 Windows 平台开启地址复用，停止后可立即在同一端口重新监听。
pub(crate) fn open_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(configure_err)?;
    #[cfg(not(windows))]
    socket.set_reuse_address(true).map_err(configure_err)?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|err| SocketError::io(error::BIND, err))?;
    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket
        .listen(backlog)
        .map_err(|err| SocketError::io(error::LISTEN, err))?;
    socket.set_nonblocking(true).map_err(configure_err)?;
    TcpListener::from_std(socket.into()).map_err(configure_err)
}

/// 轮询一次流读取；同一流只能有一个读取方，读方向的唤醒器只保留最近一次。
pub(crate) fn poll_read_stream(
    stream: &TcpStream,
    cx: &mut Context<'_>,
    buf: &mut [u8],
) -> Poll<io::Result<usize>> {
    loop {
        ready!(stream.poll_read_ready(cx))?;
        match stream.try_read(buf) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            other => return Poll::Ready(other),
        }
    }
}

/// 轮询一次数据报读取，返回长度与真实发送方。
pub(crate) fn poll_read_datagram(
    socket: &UdpSocket,
    cx: &mut Context<'_>,
    buf: &mut [u8],
) -> Poll<io::Result<(usize, SocketAddr)>> {
    let mut read_buf = ReadBuf::new(buf);
    let sender = ready!(socket.poll_recv_from(cx, &mut read_buf))?;
    Poll::Ready(Ok((read_buf.filled().len(), sender)))
}

/// 写出全部字节并返回写入总数。
pub(crate) async fn write_stream(stream: &TcpStream, mut buf: &[u8]) -> io::Result<usize> {
    let total = buf.len();
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(written) => buf = &buf[written..],
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}
