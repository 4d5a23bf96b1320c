//! # ConnectionRegistry：服务端连接表
//!
//! ## 核心意图（Why）
//! - 以 `DashMap` 提供按远端地址索引的并发连接表，接受循环、各连接的状态回调与
//!   广播发送可以同时插入、移除与遍历。
//!
//! ## 行为契约（What）
//! - 键为远端地址且唯一，同一地址的新连接覆盖旧条目；
//! - [`ConnectionRegistry::remove_exact`] 只移除与给定句柄为同一连接的条目，
//!   旧连接迟到的 `Shutdown` 不会误删覆盖后的新连接；
//! - 遍历一律先复制快照，调用方在快照上执行发送或释放。
//!
//! ## 风险提示（Trade-offs）
//! - 持有 `DashMap` guard 时释放连接会在状态回调中再次进入同一分片，
//!   因此本模块从不在 guard 存活期间调用连接方法。

use std::net::SocketAddr;

use dashmap::DashMap;

use crate::connection::Connection;

#[derive(Debug, Default)]
pub(crate) struct ConnectionRegistry {
    connections: DashMap<SocketAddr, Connection>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 插入或覆盖；返回被覆盖的旧连接。
    pub(crate) fn insert(&self, remote: SocketAddr, connection: Connection) -> Option<Connection> {
        self.connections.insert(remote, connection)
    }

    pub(crate) fn get(&self, remote: &SocketAddr) -> Option<Connection> {
        self.connections.get(remote).map(|entry| entry.value().clone())
    }

    pub(crate) fn remove_exact(&self, remote: &SocketAddr, connection: &Connection) -> bool {
        self.connections
            .remove_if(remote, |_, current| current.ptr_eq(connection))
            .is_some()
    }

    pub(crate) fn snapshot(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PassthroughCodec;
    use crate::config::SocketConfig;
    use crate::protocol::ProtocolKind;

    fn connection() -> Connection {
        Connection::dialer(
            ProtocolKind::Udp,
            SocketConfig::udp(),
            None,
            None,
            Box::new(PassthroughCodec),
        )
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn stale_entry_does_not_evict_replacement() {
        let registry = ConnectionRegistry::new();
        let old = connection();
        let new = connection();

        registry.insert(addr(4000), old.clone());
        let replaced = registry.insert(addr(4000), new.clone()).expect("old entry");
        assert!(replaced.ptr_eq(&old));

        assert!(!registry.remove_exact(&addr(4000), &old));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_exact(&addr(4000), &new));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn snapshot_is_detached_from_registry() {
        let registry = ConnectionRegistry::new();
        for port in 4000..4005 {
            registry.insert(addr(port), connection());
        }
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 5);

        let first = registry.get(&addr(4000)).expect("entry");
        assert!(snapshot.iter().any(|candidate| candidate.ptr_eq(&first)));
        assert!(registry.remove_exact(&addr(4000), &first));
        assert_eq!(snapshot.len(), 5);
        assert_eq!(registry.len(), 4);
        assert!(registry.get(&addr(4000)).is_none());
    }
}
