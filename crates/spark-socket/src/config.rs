//! 连接与监听配置。
//!
//! 数值默认值沿用引擎一贯的预设：TCP 64 KiB 三件套，UDP 64 KiB 数据区配
//! 128 KiB 套接字缓冲，keep-alive 10 秒，建连超时 5 秒，监听 backlog 200。
//! 两个结构体都可以从 TOML 等格式部分覆盖，时长字段以毫秒表示。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SocketError};

pub const TCP_DATA_BUFFER_SIZE: usize = 64 * 1024;
pub const TCP_SOCKET_RECV_BUFFER_SIZE: usize = 64 * 1024;
pub const TCP_SOCKET_SEND_BUFFER_SIZE: usize = 64 * 1024;

pub const UDP_DATA_BUFFER_SIZE: usize = 64 * 1024;
pub const UDP_SOCKET_RECV_BUFFER_SIZE: usize = 128 * 1024;
pub const UDP_SOCKET_SEND_BUFFER_SIZE: usize = 128 * 1024;

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ACCEPT_BACKLOG: u32 = 200;

/// 单个连接的缓冲与超时配置，构造后不可变。
///
/// # 契约 (What)
/// - `data_buffer_size`：接收循环使用的固定缓冲大小，决定单次收包上限；
/// - `recv_buffer_size`/`send_buffer_size`：写入 `SO_RCVBUF`/`SO_SNDBUF`；
/// - `keepalive_interval`：TCP keep-alive 空闲时长，UDP 忽略；
/// - `connect_timeout`：TCP 握手的唯一有界等待；
/// - `nodelay`：是否关闭 Nagle。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub data_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    #[serde(rename = "keepalive_interval_ms", with = "duration_ms")]
    pub keepalive_interval: Duration,
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl SocketConfig {
    /// TCP 预设。
    pub fn tcp() -> Self {
        Self {
            data_buffer_size: TCP_DATA_BUFFER_SIZE,
            recv_buffer_size: TCP_SOCKET_RECV_BUFFER_SIZE,
            send_buffer_size: TCP_SOCKET_SEND_BUFFER_SIZE,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
        }
    }

    /// UDP 与组播预设。
    pub fn udp() -> Self {
        Self {
            data_buffer_size: UDP_DATA_BUFFER_SIZE,
            recv_buffer_size: UDP_SOCKET_RECV_BUFFER_SIZE,
            send_buffer_size: UDP_SOCKET_SEND_BUFFER_SIZE,
            ..Self::tcp()
        }
    }

    pub fn with_data_buffer_size(mut self, size: usize) -> Self {
        self.data_buffer_size = size;
        self
    }

    pub fn with_socket_buffer_sizes(mut self, recv: usize, send: usize) -> Self {
        self.recv_buffer_size = recv;
        self.send_buffer_size = send;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    /// 校验数值合法性；零缓冲或零超时视为用法错误。
    pub fn validate(&self) -> Result<()> {
        if self.data_buffer_size == 0 {
            return Err(SocketError::InvalidArgument(
                "data_buffer_size must be greater than zero".into(),
            ));
        }
        if self.recv_buffer_size == 0 || self.send_buffer_size == 0 {
            return Err(SocketError::InvalidArgument(
                "socket buffer sizes must be greater than zero".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(SocketError::InvalidArgument(
                "connect_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self::tcp()
    }
}

/// TCP 服务端配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `listen` 的积压队列长度。
    pub backlog: u32,
    /// 每个被接受连接使用的配置。
    pub connection: SocketConfig,
}

impl ServerConfig {
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_connection(mut self, connection: SocketConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.backlog == 0 {
            return Err(SocketError::InvalidArgument(
                "backlog must be greater than zero".into(),
            ));
        }
        self.connection.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_ACCEPT_BACKLOG,
            connection: SocketConfig::tcp(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_match_engine_defaults() {
        let tcp = SocketConfig::tcp();
        assert_eq!(tcp.data_buffer_size, 64 * 1024);
        assert_eq!(tcp.keepalive_interval, Duration::from_secs(10));
        assert_eq!(tcp.connect_timeout, Duration::from_secs(5));

        let udp = SocketConfig::udp();
        assert_eq!(udp.recv_buffer_size, 128 * 1024);
        assert_eq!(udp.send_buffer_size, 128 * 1024);
        assert_eq!(ServerConfig::default().backlog, 200);
    }

    #[test]
    fn toml_overrides_subset_of_fields() {
        let config: ServerConfig = toml::from_str(
            r#"
            backlog = 16

            [connection]
            data_buffer_size = 4096
            connect_timeout_ms = 250
            "#,
        )
        .expect("parse server config");

        assert_eq!(config.backlog, 16);
        assert_eq!(config.connection.data_buffer_size, 4096);
        assert_eq!(config.connection.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.connection.recv_buffer_size, TCP_SOCKET_RECV_BUFFER_SIZE);
        config.validate().expect("overridden config stays valid");
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = SocketConfig::tcp()
            .with_data_buffer_size(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, SocketError::InvalidArgument(_)));

        let err = ServerConfig::default().with_backlog(0).validate().unwrap_err();
        assert!(matches!(err, SocketError::InvalidArgument(_)));
    }

    #[test]
    fn serializes_durations_as_millis() {
        let text = toml::to_string(&SocketConfig::tcp()).expect("serialize");
        assert!(text.contains("connect_timeout_ms = 5000"));
        assert!(text.contains("keepalive_interval_ms = 10000"));
    }
}
