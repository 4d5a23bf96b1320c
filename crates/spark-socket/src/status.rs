use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// 套接字生命周期状态。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为连接与监听器提供统一的四态状态机，使建连、销毁与 IO 失败在多线程下
///   以原子寄存器而非锁进行协调。
///
/// ## 契约 (What)
/// - 单个生命周期内只允许前进：`Undefined → Establishing → Established → Shutdown`；
/// - `Shutdown` 在本生命周期内是吸收态，只有新的 `create` 才能开启下一轮；
/// - 任何状态都不会回退到 `Undefined`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SocketStatus {
    /// 初始状态，尚未创建套接字。
    Undefined = 0,
    /// 正在构建、绑定或握手。
    Establishing = 1,
    /// 套接字可收发。
    Established = 2,
    /// 套接字已关闭。
    Shutdown = 3,
}

impl SocketStatus {
    /// 是否处于持有套接字资源的阶段（`Establishing` 或 `Established`）。
    pub fn is_active(self) -> bool {
        matches!(self, SocketStatus::Establishing | SocketStatus::Established)
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SocketStatus::Undefined,
            1 => SocketStatus::Establishing,
            2 => SocketStatus::Established,
            _ => SocketStatus::Shutdown,
        }
    }
}

impl fmt::Display for SocketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SocketStatus::Undefined => "undefined",
            SocketStatus::Establishing => "establishing",
            SocketStatus::Established => "established",
            SocketStatus::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

/// 基于 `AtomicU8` 的状态寄存器。
///
/// 所有转换均为比较交换，调用方据返回的旧值决定是否执行副作用，
/// 从而保证并发的 `create`/`destroy`/错误拆除中只有一方真正关闭套接字。
#[derive(Debug)]
pub(crate) struct StatusCell {
    raw: AtomicU8,
}

impl StatusCell {
    pub(crate) fn new(initial: SocketStatus) -> Self {
        Self {
            raw: AtomicU8::new(initial as u8),
        }
    }

    pub(crate) fn load(&self) -> SocketStatus {
        SocketStatus::from_raw(self.raw.load(Ordering::Acquire))
    }

    /// 仅当当前值等于 `current` 时写入 `next`；失败时返回实际观测到的状态。
    pub(crate) fn transition(
        &self,
        current: SocketStatus,
        next: SocketStatus,
    ) -> Result<(), SocketStatus> {
        self.raw
            .compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(SocketStatus::from_raw)
    }

    /// 从空闲态（`Undefined` 或 `Shutdown`）进入 `Establishing`。
    ///
    /// 成功时返回被替换的空闲态；若当前已处于 `Establishing`/`Established`，
    /// 返回该活动状态且不做任何修改。
    pub(crate) fn begin_establishing(&self) -> Result<SocketStatus, SocketStatus> {
        let mut observed = self.load();
        loop {
            if observed.is_active() {
                return Err(observed);
            }
            match self.transition(observed, SocketStatus::Establishing) {
                Ok(()) => return Ok(observed),
                Err(actual) => observed = actual,
            }
        }
    }

    /// 从活动态（`Establishing` 或 `Established`）进入 `Shutdown`。
    ///
    /// 成功时返回被替换的活动态，调用方据此执行唯一一次关闭；
    /// 空闲态（`Undefined`/`Shutdown`）保持不变并原样返回。
    pub(crate) fn begin_shutdown(&self) -> Result<SocketStatus, SocketStatus> {
        let mut observed = self.load();
        loop {
            if !observed.is_active() {
                return Err(observed);
            }
            match self.transition(observed, SocketStatus::Shutdown) {
                Ok(()) => return Ok(observed),
                Err(actual) => observed = actual,
            }
        }
    }
}
