//! # 编解码边界
//!
//! ## 核心意图（Why）
//! - 套接字引擎只搬运字节，分帧、粘包处理与应用层报文解析全部交给外部实现的
//!   [`Codec`]，引擎与协议互不感知。
//!
//! ## 行为契约（What）
//! - 每个连接在创建时通过 [`CodecFactory`] 获得独占的编解码器实例；
//! - `decode` 对同一连接严格串行调用（接收循环同一时刻只有一次未完成的读），
//!   因此有状态的流重组无需自行加锁；
//! - 连接每次拆除调用一次 `reset`，最终释放时调用一次 `dispose`；
//! - `encode` 返回 `Err` 视为“未编码”，本次发送放弃且不写出任何字节。
//!
//! ## 风险提示（Trade-offs）
//! - `decode` 期间引擎持有编解码器锁，产出的报文先缓存在 [`DecodeOutput`] 中，
//!   待锁释放后再派发给订阅者，订阅者因此可以在回调里安全地再次发送。

use std::any::Any;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::event::DataReceived;
use crate::protocol::ProtocolKind;

/// 解码产出的应用层报文，类型在运行时擦除。
pub type Package = Arc<dyn Any + Send + Sync>;

/// 发送时随数据传给编码器的附加参数。
pub type UserTag = dyn Any + Send + Sync;

/// 编解码器报告的失败。
///
/// 底层原因以 `Arc` 共享，克隆后的错误（例如同时返回给调用方与写入异常事件）
/// 保留完整的 `source` 链。
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct CodecError {
    message: Cow<'static, str>,
    #[source]
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl CodecError {
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<Cow<'static, str>>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 将编解码器内部的 panic 转换为错误。
    pub(crate) fn from_panic(stage: &'static str, payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_owned()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "<non-string panic payload>".to_owned()
        };
        Self::new(format!("codec panicked during {stage}: {detail}"))
    }
}

/// 一次接收完成后交给解码器的数据切片及其地址信息。
#[derive(Clone, Copy, Debug)]
pub struct InboundFrame<'a> {
    pub protocol: ProtocolKind,
    pub payload: &'a [u8],
    /// TCP 为连接配置的固定远端；UDP/组播为该报文的真实发送方。
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

/// 解码器的“发布报文”回调。
///
/// 单次 `decode` 可以调用零次或多次，支持一包多帧与半包等待。
#[derive(Debug)]
pub struct DecodeOutput {
    protocol: ProtocolKind,
    remote: SocketAddr,
    local: SocketAddr,
    events: Vec<DataReceived>,
}

impl DecodeOutput {
    pub(crate) fn for_frame(frame: &InboundFrame<'_>) -> Self {
        Self {
            protocol: frame.protocol,
            remote: frame.remote,
            local: frame.local,
            events: Vec::new(),
        }
    }

    /// 以当前帧的协议与地址发布一个报文。
    pub fn emit<P>(&mut self, package: P)
    where
        P: Any + Send + Sync,
    {
        let event = DataReceived::new(self.protocol, self.local, self.remote, Arc::new(package));
        self.events.push(event);
    }

    /// 发布完整自定义的数据事件。
    pub fn publish(&mut self, event: DataReceived) {
        self.events.push(event);
    }

    /// 已发布的报文数量。
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn into_events(self) -> Vec<DataReceived> {
        self.events
    }
}

/// 可插拔的编解码单元。
pub trait Codec: Send {
    /// 编码待发送数据。借用返回表示原样发送，拥有返回表示编码后的新缓冲。
    fn encode<'a>(
        &mut self,
        src: &'a [u8],
        user_tag: Option<&UserTag>,
    ) -> Result<Cow<'a, [u8]>, CodecError>;

    /// 解码一次接收得到的数据，通过 `out` 发布零个或多个报文。
    fn decode(&mut self, frame: &InboundFrame<'_>, out: &mut DecodeOutput)
    -> Result<(), CodecError>;

    /// 连接拆除时调用，例如清空粘包缓存。
    fn reset(&mut self) {}

    /// 连接最终释放时调用。
    fn dispose(&mut self) {}
}

/// 为每个连接创建独立编解码器实例的工厂。
pub trait CodecFactory: Send + Sync {
    fn create_codec(&self) -> Box<dyn Codec>;
}

impl<F> CodecFactory for F
where
    F: Fn() -> Box<dyn Codec> + Send + Sync,
{
    fn create_codec(&self) -> Box<dyn Codec> {
        self()
    }
}

/// 不做任何分帧的透传编解码器。
///
/// 编码原样返回输入；每次接收发布一个 [`Bytes`] 报文。
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughCodec;

impl PassthroughCodec {
    /// 以工厂形式提供，便于直接交给服务端或客户端构造器。
    pub fn factory() -> Arc<dyn CodecFactory> {
        Arc::new(|| Box::new(PassthroughCodec) as Box<dyn Codec>)
    }
}

impl Codec for PassthroughCodec {
    fn encode<'a>(
        &mut self,
        src: &'a [u8],
        _user_tag: Option<&UserTag>,
    ) -> Result<Cow<'a, [u8]>, CodecError> {
        Ok(Cow::Borrowed(src))
    }

    fn decode(
        &mut self,
        frame: &InboundFrame<'_>,
        out: &mut DecodeOutput,
    ) -> Result<(), CodecError> {
        out.emit(Bytes::copy_from_slice(frame.payload));
        Ok(())
    }
}
