use core::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SocketError};

/// 连接所使用的传输协议。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// 面向连接的字节流。
    Tcp,
    /// 无连接数据报。
    Udp,
    /// 加入组播组的 UDP 数据报。
    Multicast,
}

impl ProtocolKind {
    /// 是否为数据报语义（UDP 与组播）。
    pub fn is_datagram(self) -> bool {
        !matches!(self, ProtocolKind::Tcp)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProtocolKind::Tcp => "tcp",
            ProtocolKind::Udp => "udp",
            ProtocolKind::Multicast => "multicast",
        };
        f.write_str(label)
    }
}

/// 一次 `create` 所需的、已按协议校验过的地址组合。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“哪种协议需要哪些地址”集中在一处判定，连接状态机只在建连、
///   收包解释与发送寻址三处按变体分支。
///
/// ## 契约 (What)
/// - `Stream`：远端必填，本地缺省时由系统选择任意地址与临时端口；
/// - `Datagram`：远端可选，仅绑定本地；
/// - `Multicast`：本地与组地址均必填，且端口必须一致；
/// - [`Binding::resolve`] 是纯函数，校验失败时不会创建任何套接字。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Binding {
    Stream {
        local: Option<SocketAddr>,
        remote: SocketAddr,
    },
    Datagram {
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    },
    Multicast {
        local: SocketAddr,
        group: SocketAddr,
    },
}

impl Binding {
    pub(crate) fn resolve(
        protocol: ProtocolKind,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<Self> {
        match protocol {
            ProtocolKind::Tcp => {
                let remote = remote.ok_or(SocketError::InvalidArgument(
                    "tcp connection requires a remote endpoint".into(),
                ))?;
                Ok(Binding::Stream { local, remote })
            }
            ProtocolKind::Udp => Ok(Binding::Datagram { local, remote }),
            ProtocolKind::Multicast => {
                let group = remote.ok_or(SocketError::InvalidArgument(
                    "multicast requires a group endpoint".into(),
                ))?;
                let local = local.ok_or(SocketError::InvalidArgument(
                    "multicast requires a local endpoint".into(),
                ))?;
                if local.port() != group.port() {
                    return Err(SocketError::MulticastPortMismatch {
                        local: local.port(),
                        group: group.port(),
                    });
                }
                if !group.ip().is_multicast() {
                    return Err(SocketError::InvalidArgument(
                        format!("{} is not a multicast group address", group.ip()).into(),
                    ));
                }
                Ok(Binding::Multicast { local, group })
            }
        }
    }

    /// 实际用于 `bind` 的本地地址，缺省时与对端地址族对齐。
    pub(crate) fn bind_addr(&self) -> SocketAddr {
        match *self {
            Binding::Stream { local, remote } => local.unwrap_or_else(|| unspecified_for(remote)),
            Binding::Datagram { local, remote } => local.unwrap_or_else(|| match remote {
                Some(remote) => unspecified_for(remote),
                None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            }),
            Binding::Multicast { local, .. } => local,
        }
    }
}

/// 与 `peer` 同地址族的通配地址，端口为 0。
pub(crate) fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(text: &str) -> SocketAddr {
        text.parse().expect("valid socket address")
    }

    #[test]
    fn tcp_requires_remote() {
        let err = Binding::resolve(ProtocolKind::Tcp, None, None).unwrap_err();
        assert!(matches!(err, SocketError::InvalidArgument(_)));
    }

    #[test]
    fn tcp_without_local_binds_matching_family() {
        let binding = Binding::resolve(ProtocolKind::Tcp, None, Some(addr("[::1]:9000")))
            .expect("tcp binding");
        assert_eq!(binding.bind_addr(), addr("[::]:0"));
    }

    #[test]
    fn udp_remote_is_optional() {
        let binding = Binding::resolve(ProtocolKind::Udp, Some(addr("127.0.0.1:0")), None)
            .expect("udp binding");
        assert_eq!(binding.bind_addr(), addr("127.0.0.1:0"));
    }

    #[test]
    fn multicast_rejects_port_mismatch() {
        let err = Binding::resolve(
            ProtocolKind::Multicast,
            Some(addr("0.0.0.0:6000")),
            Some(addr("224.2.2.2:6666")),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SocketError::MulticastPortMismatch {
                local: 6000,
                group: 6666
            }
        ));
    }

    #[test]
    fn multicast_requires_group_address() {
        let err = Binding::resolve(
            ProtocolKind::Multicast,
            Some(addr("0.0.0.0:6666")),
            Some(addr("10.0.0.1:6666")),
        )
        .unwrap_err();
        assert!(matches!(err, SocketError::InvalidArgument(_)));
    }
}
