use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::protocol::ProtocolKind;
use crate::status::SocketStatus;

/// 引擎统一的结果别名。
pub type Result<T, E = SocketError> = std::result::Result<T, E>;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.socket.bind_failed",
    message: "socket bind",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.socket.connect_failed",
    message: "tcp connect",
};
pub(crate) const LISTEN: OperationKind = OperationKind {
    code: "spark.socket.listen_failed",
    message: "tcp listen",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.socket.accept_failed",
    message: "tcp accept",
};
pub(crate) const RECEIVE: OperationKind = OperationKind {
    code: "spark.socket.receive_failed",
    message: "socket receive",
};
pub(crate) const SEND: OperationKind = OperationKind {
    code: "spark.socket.send_failed",
    message: "socket send",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.socket.configure_failed",
    message: "socket configure",
};
pub(crate) const CLOSE: OperationKind = OperationKind {
    code: "spark.socket.close_failed",
    message: "socket close",
};

/// 错误分类，对应调用方的处置方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 参数或调用时机错误，同步返回给调用方，不会被吞掉。
    Usage,
    /// 建连、绑定等传输失败，同步返回且已触发拆除。
    Transport,
    /// 收发过程中的 IO 失败。
    Io,
    /// 编解码器失败，仅影响当前这一次收发。
    Codec,
}

/// 套接字引擎错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把用法错误、传输错误、异步 IO 错误与编解码错误收敛到一个
///   `thiserror` 枚举，调用方既可 `?` 传播，也可按 [`ErrorCategory`] 分流；
/// - **契约 (What)**：每个变体都有稳定的 [`SocketError::code`]；IO 变体携带
///   [`OperationKind`] 标明失败发生在哪个阶段；
/// - **风险 (Trade-offs)**：`InvalidArgument` 以 `Cow<'static, str>` 存放文案，
///   静态文本零分配，动态拼接时才分配。
#[derive(Debug, Error)]
pub enum SocketError {
    /// 参数不合法。
    #[error("invalid argument: {0}")]
    InvalidArgument(Cow<'static, str>),

    /// 在不允许的状态下调用了操作，例如未建立即发送、重复创建。
    #[error("`{operation}` is not allowed while the socket is {status}")]
    InvalidState {
        operation: &'static str,
        status: SocketStatus,
    },

    /// 连接已被释放。
    #[error("`{operation}` called on a disposed connection")]
    Disposed { operation: &'static str },

    /// 组播本地端口与组端口不一致。
    #[error("multicast local port {local} must equal group port {group}")]
    MulticastPortMismatch { local: u16, group: u16 },

    /// 当前协议不支持该操作。
    #[error("{protocol} connection does not support `{operation}`")]
    Unsupported {
        protocol: ProtocolKind,
        operation: &'static str,
    },

    /// 数据报发送既没有显式目标，也没有默认远端。
    #[error("datagram send requires a target or a configured remote endpoint")]
    MissingRemote,

    /// 服务端定向发送时目标不在连接表中。
    #[error("peer {0} is not connected")]
    NotConnected(SocketAddr),

    /// 非阻塞发送需要 Tokio 运行时。
    #[error("no tokio runtime is available for `{operation}`")]
    RuntimeUnavailable { operation: &'static str },

    /// TCP 握手超时。
    #[error("tcp connect to {remote} timed out after {timeout:?}")]
    ConnectTimeout { remote: SocketAddr, timeout: Duration },

    /// 底层 IO 失败。
    #[error("{}: {source}", .kind.message)]
    Io {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },

    /// 编码器拒绝编码，本次发送被放弃。
    #[error("codec failed to encode payload")]
    Encode(#[source] CodecError),

    /// 解码器处理收到的数据失败。
    #[error("codec failed to decode payload")]
    Decode(#[source] CodecError),
}

impl SocketError {
    pub(crate) fn io(kind: OperationKind, source: io::Error) -> Self {
        SocketError::Io { kind, source }
    }

    pub(crate) fn invalid_state(operation: &'static str, status: SocketStatus) -> Self {
        SocketError::InvalidState { operation, status }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SocketError::InvalidArgument(_) => "spark.socket.invalid_argument",
            SocketError::InvalidState { .. } => "spark.socket.invalid_state",
            SocketError::Disposed { .. } => "spark.socket.disposed",
            SocketError::MulticastPortMismatch { .. } => "spark.socket.multicast_port_mismatch",
            SocketError::Unsupported { .. } => "spark.socket.unsupported",
            SocketError::MissingRemote => "spark.socket.missing_remote",
            SocketError::NotConnected(_) => "spark.socket.not_connected",
            SocketError::RuntimeUnavailable { .. } => "spark.socket.runtime_unavailable",
            SocketError::ConnectTimeout { .. } => "spark.socket.connect_timeout",
            SocketError::Io { kind, .. } => kind.code,
            SocketError::Encode(_) => "spark.socket.encode_failed",
            SocketError::Decode(_) => "spark.socket.decode_failed",
        }
    }

    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            SocketError::InvalidArgument(_)
            | SocketError::InvalidState { .. }
            | SocketError::Disposed { .. }
            | SocketError::MulticastPortMismatch { .. }
            | SocketError::Unsupported { .. }
            | SocketError::MissingRemote
            | SocketError::NotConnected(_)
            | SocketError::RuntimeUnavailable { .. } => ErrorCategory::Usage,
            SocketError::ConnectTimeout { .. } => ErrorCategory::Transport,
            SocketError::Io { kind, .. } => match *kind {
                BIND | CONNECT | LISTEN | CONFIGURE => ErrorCategory::Transport,
                _ => ErrorCategory::Io,
            },
            SocketError::Encode(_) | SocketError::Decode(_) => ErrorCategory::Codec,
        }
    }

    /// 若为 IO 错误，返回其 `io::ErrorKind`。
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            SocketError::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

/// 接收路径上意味着连接已不可用的错误：复位、中止、拒绝。
pub(crate) fn is_receive_fatal(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
    )
}

/// TCP 发送路径上的致命错误，在接收路径集合之上补充断管与未连接。
pub(crate) fn is_send_fatal(error: &io::Error) -> bool {
    is_receive_fatal(error)
        || matches!(
            error.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_operation_code() {
        let err = SocketError::io(CONNECT, io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(err.code(), "spark.socket.connect_failed");
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused));
        assert!(err.to_string().starts_with("tcp connect:"));
    }

    #[test]
    fn receive_errors_are_io_category() {
        let err = SocketError::io(RECEIVE, io::Error::other("boom"));
        assert_eq!(err.category(), ErrorCategory::Io);
    }

    #[test]
    fn usage_errors_are_classified() {
        let err = SocketError::invalid_state("send", SocketStatus::Establishing);
        assert_eq!(err.category(), ErrorCategory::Usage);
        assert_eq!(
            err.to_string(),
            "`send` is not allowed while the socket is establishing"
        );
    }

    #[test]
    fn fatal_sets_differ_between_paths() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        let pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        let would_block = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(is_receive_fatal(&reset));
        assert!(!is_receive_fatal(&pipe));
        assert!(is_send_fatal(&pipe));
        assert!(!is_send_fatal(&would_block));
    }
}
