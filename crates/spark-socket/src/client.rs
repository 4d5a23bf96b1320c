//! 客户端连接构造器。
//!
//! 三个预设分别给出 TCP、UDP 与组播的默认缓冲配置，未指定编解码器时使用
//! [`PassthroughCodec`]。

use std::net::SocketAddr;
use std::sync::Arc;

use crate::codec::{CodecFactory, PassthroughCodec};
use crate::config::SocketConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::ProtocolKind;

/// 构造应用主动创建的 [`Connection`]。
///
/// # 契约 (What)
/// - `build` 只校验配置并组装连接，不创建套接字；地址组合的校验推迟到
///   `create`，保证校验失败时状态保持 `Undefined`；
/// - 每次 `build` 从工厂取得一个新的编解码器实例。
#[derive(Clone)]
pub struct ClientBuilder {
    protocol: ProtocolKind,
    config: SocketConfig,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    codec_factory: Option<Arc<dyn CodecFactory>>,
}

impl ClientBuilder {
    pub fn new(protocol: ProtocolKind) -> Self {
        let config = match protocol {
            ProtocolKind::Tcp => SocketConfig::tcp(),
            ProtocolKind::Udp | ProtocolKind::Multicast => SocketConfig::udp(),
        };
        Self {
            protocol,
            config,
            local: None,
            remote: None,
            codec_factory: None,
        }
    }

    pub fn tcp() -> Self {
        Self::new(ProtocolKind::Tcp)
    }

    pub fn udp() -> Self {
        Self::new(ProtocolKind::Udp)
    }

    pub fn multicast() -> Self {
        Self::new(ProtocolKind::Multicast)
    }

    pub fn with_config(mut self, config: SocketConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    /// TCP 的对端、UDP 的默认发送目标或组播的组地址。
    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_codec_factory(mut self, factory: Arc<dyn CodecFactory>) -> Self {
        self.codec_factory = Some(factory);
        self
    }

    /// 以闭包形式提供编解码器工厂。
    pub fn with_codec<F>(self, factory: F) -> Self
    where
        F: CodecFactory + 'static,
    {
        self.with_codec_factory(Arc::new(factory))
    }

    pub fn build(&self) -> Result<Connection> {
        self.config.validate()?;
        let codec = match &self.codec_factory {
            Some(factory) => factory.create_codec(),
            None => Box::new(PassthroughCodec),
        };
        Ok(Connection::dialer(
            self.protocol,
            self.config.clone(),
            self.local,
            self.remote,
            codec,
        ))
    }
}

impl core::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("protocol", &self.protocol)
            .field("config", &self.config)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("custom_codec", &self.codec_factory.is_some())
            .finish()
    }
}
