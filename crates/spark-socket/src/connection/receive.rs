//! 接收循环。
//!
//! 每个连接只有一个读取任务，任务内部严格“读完成 → 处理 → 再读”，
//! 因此同一连接上永远只有一个未完成的接收，解码也天然串行。
//! 任务只持有连接的弱引用与所属生命周期代号，每次轮询都在 io 槽位锁内借用
//! 套接字；槽位被拆除清空或换代后，下一次轮询即结束循环，任务本身从不延长
//! 套接字的寿命。

use std::future::poll_fn;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::task::Poll;

use super::{Connection, ConnectionInner};
use crate::codec::{CodecError, DecodeOutput, InboundFrame};
use crate::error::{self, SocketError, is_receive_fatal};
use crate::protocol::unspecified_for;
use crate::socket::{self, IoHandle};
use crate::status::SocketStatus;

impl Connection {
    /// 启动接收循环。
    ///
    /// 若套接字在启动前已被拆除，新任务会被立即中止。TCP 的远端在此处一次性
    /// 解析并交给读循环，缺失时报告 `MissingRemote` 并拆除本轮生命周期。
    pub(crate) fn start_receive(&self) {
        let Some((generation, handle)) = self.current_io() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let buffer_size = self.inner.config.data_buffer_size;
        let task = match handle {
            IoHandle::Stream(_) => {
                let Some(remote) = self.remote_addr() else {
                    self.report(None, "stream has no remote endpoint", SocketError::MissingRemote);
                    self.teardown_lifecycle(generation);
                    return;
                };
                tokio::spawn(stream_loop(weak, generation, remote, buffer_size))
            }
            IoHandle::Datagram(_) => tokio::spawn(datagram_loop(weak, generation, buffer_size)),
        };

        let mut slot = self.inner.io.lock();
        let current = slot.generation == generation;
        match slot.io.as_mut() {
            Some(io) if current => io.set_reader(task.abort_handle()),
            _ => task.abort(),
        }
    }

    /// 把一次接收交给编解码器，并在释放编解码器锁之后派发产出的报文。
    fn dispatch(&self, payload: &[u8], remote: SocketAddr) {
        let local = self
            .local_addr()
            .unwrap_or_else(|| unspecified_for(remote));
        let frame = InboundFrame {
            protocol: self.inner.protocol,
            payload,
            remote,
            local,
        };
        let mut out = DecodeOutput::for_frame(&frame);
        let outcome = {
            let mut codec = self.inner.codec.lock();
            catch_unwind(AssertUnwindSafe(|| codec.decode(&frame, &mut out)))
        };

        for event in out.into_events() {
            self.inner.events.data.emit(&event);
        }

        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(panic) => CodecError::from_panic("decode", panic),
        };
        self.report(Some(remote), "failed to decode payload", SocketError::Decode(failure));
    }
}

/// 在 io 槽位锁内借用当前套接字轮询一次。
///
/// 连接已释放、槽位已清空或已换代时返回 `Ready(None)`；`poll` 对不匹配的
/// 句柄类型返回 `None`，同样视为结束。
fn poll_current<T>(
    weak: &Weak<ConnectionInner>,
    generation: u64,
    poll: impl FnOnce(&IoHandle) -> Option<Poll<T>>,
) -> Poll<Option<T>> {
    let Some(inner) = weak.upgrade() else {
        return Poll::Ready(None);
    };
    let slot = inner.io.lock();
    let polled = match slot.io.as_ref() {
        Some(io) if slot.generation == generation => poll(io.handle()),
        _ => None,
    };
    drop(slot);
    match polled {
        Some(Poll::Ready(value)) => Poll::Ready(Some(value)),
        Some(Poll::Pending) => Poll::Pending,
        None => Poll::Ready(None),
    }
}

async fn stream_loop(
    weak: Weak<ConnectionInner>,
    generation: u64,
    remote: SocketAddr,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let polled = poll_fn(|cx| {
            poll_current(&weak, generation, |handle| match handle {
                IoHandle::Stream(stream) => {
                    Some(socket::poll_read_stream(stream, cx, &mut buffer))
                }
                IoHandle::Datagram(_) => None,
            })
        })
        .await;
        let Some(result) = polled else {
            break;
        };
        let Some(connection) = Connection::upgrade(&weak) else {
            break;
        };
        if connection.status() != SocketStatus::Established {
            break;
        }
        // TCP 数据事件使用连接配置的固定远端。
        match result {
            Ok(0) => {
                tracing::debug!(remote = %remote, "remote closed the stream");
                connection.teardown_lifecycle(generation);
                break;
            }
            Ok(read) => connection.dispatch(&buffer[..read], remote),
            Err(err) => {
                let fatal = is_receive_fatal(&err);
                connection.report(
                    Some(remote),
                    "stream receive failed",
                    SocketError::io(error::RECEIVE, err),
                );
                if fatal {
                    connection.teardown_lifecycle(generation);
                    break;
                }
            }
        }
    }
}

async fn datagram_loop(weak: Weak<ConnectionInner>, generation: u64, buffer_size: usize) {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let polled = poll_fn(|cx| {
            poll_current(&weak, generation, |handle| match handle {
                IoHandle::Datagram(socket) => {
                    Some(socket::poll_read_datagram(socket, cx, &mut buffer))
                }
                IoHandle::Stream(_) => None,
            })
        })
        .await;
        let Some(result) = polled else {
            break;
        };
        let Some(connection) = Connection::upgrade(&weak) else {
            break;
        };
        if connection.status() != SocketStatus::Established {
            break;
        }
        match result {
            Ok((0, _)) => {}
            Ok((read, sender)) => connection.dispatch(&buffer[..read], sender),
            Err(err) => connection.report(
                connection.remote_addr(),
                "datagram receive failed",
                SocketError::io(error::RECEIVE, err),
            ),
        }
    }
}
