//! 发送路径：阻塞/非阻塞 × 流/数据报四种入口共享同一套前置检查与编码逻辑。

use std::borrow::Cow;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Handle;

use super::Connection;
use crate::codec::{CodecError, UserTag};
use crate::error::{self, Result, SocketError, is_send_fatal};
use crate::protocol::ProtocolKind;
use crate::socket::{self, IoHandle};
use crate::status::SocketStatus;

/// 单次发送的编码选项。
///
/// 默认经过编解码器编码且不携带附加参数。
#[derive(Clone, Copy, Debug)]
pub struct SendOptions<'a> {
    /// 为 `false` 时跳过编码，原样写出。
    pub encode: bool,
    /// 传给 [`Codec::encode`](crate::codec::Codec::encode) 的附加参数。
    pub user_tag: Option<&'a UserTag>,
}

impl<'a> SendOptions<'a> {
    pub fn encoded() -> Self {
        Self {
            encode: true,
            user_tag: None,
        }
    }

    pub fn raw() -> Self {
        Self {
            encode: false,
            user_tag: None,
        }
    }

    pub fn with_tag(mut self, user_tag: &'a UserTag) -> Self {
        self.user_tag = Some(user_tag);
        self
    }
}

impl Default for SendOptions<'_> {
    fn default() -> Self {
        Self::encoded()
    }
}

/// 一次写出的去向；流路由记住所属生命周期，致命错误只拆除那一轮。
enum Route {
    Stream(u64, Arc<TcpStream>),
    Datagram(Arc<UdpSocket>, SocketAddr),
}

impl Route {
    fn target(&self, connection: &Connection) -> Option<SocketAddr> {
        match self {
            Route::Stream(..) => connection.remote_addr(),
            Route::Datagram(_, target) => Some(*target),
        }
    }
}

impl Connection {
    /// 阻塞发送：TCP 写往对端，UDP/组播写往配置的默认远端。
    ///
    /// 返回实际写出的字节数（编码后的长度）。
    pub async fn send(&self, data: &[u8], options: SendOptions<'_>) -> Result<usize> {
        let route = self.route("send", None)?;
        let payload = self.encode_payload(data, &options)?;
        self.write(route, &payload).await
    }

    /// 阻塞发送数据报；`target` 为 `None` 时使用默认远端。TCP 连接不支持。
    pub async fn send_to(
        &self,
        data: &[u8],
        target: Option<SocketAddr>,
        options: SendOptions<'_>,
    ) -> Result<usize> {
        self.ensure_datagram("send_to")?;
        let route = self.route("send_to", target)?;
        let payload = self.encode_payload(data, &options)?;
        self.write(route, &payload).await
    }

    /// 非阻塞发送：同步完成检查与编码，写出在当前 Tokio 运行时上异步进行。
    ///
    /// 写出阶段的失败通过异常事件报告，致命错误同样触发拆除。
    pub fn begin_send(&self, data: &[u8], options: SendOptions<'_>) -> Result<()> {
        self.spawn_send("begin_send", data, None, options)
    }

    /// 非阻塞发送数据报；`target` 为 `None` 时使用默认远端。TCP 连接不支持。
    pub fn begin_send_to(
        &self,
        data: &[u8],
        target: Option<SocketAddr>,
        options: SendOptions<'_>,
    ) -> Result<()> {
        self.ensure_datagram("begin_send_to")?;
        self.spawn_send("begin_send_to", data, target, options)
    }

    fn spawn_send(
        &self,
        operation: &'static str,
        data: &[u8],
        target: Option<SocketAddr>,
        options: SendOptions<'_>,
    ) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|_| SocketError::RuntimeUnavailable { operation })?;
        let route = self.route(operation, target)?;
        let payload = Bytes::copy_from_slice(&self.encode_payload(data, &options)?);
        let address = route.target(self);
        let connection = self.clone();
        runtime.spawn(async move {
            if let Err(err) = connection.write(route, &payload).await {
                connection.report(address, "asynchronous send failed", err);
            }
        });
        Ok(())
    }

    fn ensure_datagram(&self, operation: &'static str) -> Result<()> {
        if self.inner.protocol == ProtocolKind::Tcp {
            return Err(SocketError::Unsupported {
                protocol: self.inner.protocol,
                operation,
            });
        }
        Ok(())
    }

    fn route(&self, operation: &'static str, target: Option<SocketAddr>) -> Result<Route> {
        let status = self.status();
        if status != SocketStatus::Established {
            return Err(SocketError::invalid_state(operation, status));
        }
        match self.current_io() {
            Some((generation, IoHandle::Stream(stream))) => Ok(Route::Stream(generation, stream)),
            Some((_, IoHandle::Datagram(socket))) => {
                let target = target
                    .or_else(|| self.remote_addr())
                    .ok_or(SocketError::MissingRemote)?;
                Ok(Route::Datagram(socket, target))
            }
            None => Err(SocketError::invalid_state(operation, self.status())),
        }
    }

    /// 按选项编码；编码失败或 panic 会报告异常并放弃本次发送。
    fn encode_payload<'a>(
        &self,
        data: &'a [u8],
        options: &SendOptions<'_>,
    ) -> Result<Cow<'a, [u8]>> {
        if !options.encode {
            return Ok(Cow::Borrowed(data));
        }
        let outcome = {
            let mut codec = self.inner.codec.lock();
            catch_unwind(AssertUnwindSafe(|| codec.encode(data, options.user_tag)))
        };
        let failure = match outcome {
            Ok(Ok(encoded)) => return Ok(encoded),
            Ok(Err(err)) => err,
            Err(panic) => CodecError::from_panic("encode", panic),
        };
        self.report(
            self.remote_addr(),
            "failed to encode payload",
            SocketError::Encode(failure.clone()),
        );
        Err(SocketError::Encode(failure))
    }

    async fn write(&self, route: Route, payload: &[u8]) -> Result<usize> {
        match route {
            Route::Stream(generation, stream) => {
                match socket::write_stream(&stream, payload).await {
                    Ok(written) => Ok(written),
                    Err(err) => {
                        let fatal = is_send_fatal(&err);
                        let err = SocketError::io(error::SEND, err);
                        if fatal {
                            self.teardown_lifecycle(generation);
                        }
                        Err(err)
                    }
                }
            }
            Route::Datagram(socket, target) => socket
                .send_to(payload, target)
                .await
                .map_err(|err| SocketError::io(error::SEND, err)),
        }
    }
}
