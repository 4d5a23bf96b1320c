//! 集成测试共享的探针编解码器与有界等待工具。
#![allow(dead_code)]

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use spark_socket::{
    Codec, CodecError, CodecFactory, Connection, DataReceived, DecodeOutput, InboundFrame,
    SocketStatus, UserTag,
};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(5);

/// 解码器遇到该负载时返回错误。
pub const POISON: &[u8] = b"poison";

pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

pub fn any_local() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

/// 轮询直到条件成立，超时则 panic。
pub async fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let polled = timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// 在有界时间内取下一条消息。
pub async fn next<T>(rx: &mut UnboundedReceiver<T>, what: &str) -> T {
    match timeout(WAIT, rx.recv()).await {
        Ok(Some(item)) => item,
        Ok(None) => panic!("channel closed while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// 等待指定状态出现，跳过中间状态。
pub async fn wait_status(rx: &mut UnboundedReceiver<SocketStatus>, expected: SocketStatus) {
    loop {
        if next(rx, "status change").await == expected {
            return;
        }
    }
}

pub fn status_channel(connection: &Connection) -> UnboundedReceiver<SocketStatus> {
    let (tx, rx) = unbounded_channel();
    connection.on_status_changed(move |event| {
        let _ = tx.send(event.status());
    });
    rx
}

pub fn data_channel(connection: &Connection) -> UnboundedReceiver<DataReceived> {
    let (tx, rx) = unbounded_channel();
    connection.on_data_received(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

pub fn payload_of(event: &DataReceived) -> Bytes {
    event
        .package_as::<Bytes>()
        .cloned()
        .expect("probe codec publishes Bytes packages")
}

/// 探针统计，由同一工厂产出的全部编解码器共享。
#[derive(Debug, Default)]
pub struct CodecProbe {
    pub decodes: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub resets: AtomicUsize,
    pub disposes: AtomicUsize,
    in_decode: AtomicBool,
}

/// 透传编解码器，附带统计与故障注入。
pub struct ProbeCodec {
    probe: Arc<CodecProbe>,
    fail_encode: bool,
    decode_delay: Option<Duration>,
}

impl ProbeCodec {
    pub fn new(probe: Arc<CodecProbe>) -> Self {
        Self {
            probe,
            fail_encode: false,
            decode_delay: None,
        }
    }

    pub fn failing_encode(mut self, fail: bool) -> Self {
        self.fail_encode = fail;
        self
    }

    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    pub fn factory(probe: Arc<CodecProbe>) -> Arc<dyn CodecFactory> {
        Arc::new(move || Box::new(ProbeCodec::new(Arc::clone(&probe))) as Box<dyn Codec>)
    }
}

impl Codec for ProbeCodec {
    fn encode<'a>(
        &mut self,
        src: &'a [u8],
        _user_tag: Option<&UserTag>,
    ) -> Result<Cow<'a, [u8]>, CodecError> {
        if self.fail_encode {
            return Err(CodecError::new("probe codec refuses to encode"));
        }
        Ok(Cow::Borrowed(src))
    }

    fn decode(
        &mut self,
        frame: &InboundFrame<'_>,
        out: &mut DecodeOutput,
    ) -> Result<(), CodecError> {
        if self.probe.in_decode.swap(true, Ordering::SeqCst) {
            self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.probe.decodes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.decode_delay {
            std::thread::sleep(delay);
        }
        let result = if frame.payload == POISON {
            Err(CodecError::new("poisoned payload"))
        } else {
            out.emit(Bytes::copy_from_slice(frame.payload));
            Ok(())
        };
        self.probe.in_decode.store(false, Ordering::SeqCst);
        result
    }

    fn reset(&mut self) {
        self.probe.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn dispose(&mut self) {
        self.probe.disposes.fetch_add(1, Ordering::SeqCst);
    }
}
