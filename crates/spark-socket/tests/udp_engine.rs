//! UDP 与组播路径的回环测试。

mod support;

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use spark_socket::{
    ClientBuilder, Connection, ProtocolKind, SendOptions, SocketError, SocketStatus,
};
use support::{
    CodecProbe, POISON, ProbeCodec, data_channel, loopback, next, payload_of,
};
use tokio::sync::mpsc::unbounded_channel;

/// 取一个当前空闲的端口；探测套接字随即释放。
fn free_port(ip: [u8; 4]) -> SocketAddr {
    let probe = UdpSocket::bind(SocketAddr::from((ip, 0))).expect("reserve port");
    probe.local_addr().expect("reserved addr")
}

async fn bound_udp(probe: &Arc<CodecProbe>, remote: Option<SocketAddr>) -> Connection {
    let mut builder = ClientBuilder::udp()
        .with_local(loopback())
        .with_codec_factory(ProbeCodec::factory(Arc::clone(probe)));
    if let Some(remote) = remote {
        builder = builder.with_remote(remote);
    }
    let connection = builder.build().expect("build udp");
    connection.create().await.expect("bind udp");
    connection
}

#[tokio::test(flavor = "multi_thread")]
async fn datagram_reports_actual_sender() {
    let probe = Arc::new(CodecProbe::default());
    let a = bound_udp(&probe, None).await;
    let b = bound_udp(&probe, None).await;
    let mut b_data = data_channel(&b);

    let b_addr = b.local_addr().expect("b bound");
    let written = a
        .send_to(b"hello", Some(b_addr), SendOptions::default())
        .await
        .expect("send to b");
    assert_eq!(written, 5);

    let event = next(&mut b_data, "datagram at b").await;
    assert_eq!(event.protocol(), ProtocolKind::Udp);
    assert_eq!(event.remote(), a.local_addr().expect("a bound"));
    assert_eq!(event.local(), b_addr);
    assert_eq!(payload_of(&event).as_ref(), b"hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn default_remote_and_async_send_deliver() {
    let probe = Arc::new(CodecProbe::default());
    let b = bound_udp(&probe, None).await;
    let mut b_data = data_channel(&b);
    let b_addr = b.local_addr().expect("b bound");
    let a = bound_udp(&probe, Some(b_addr)).await;

    a.send(b"first", SendOptions::default())
        .await
        .expect("send to default remote");
    assert_eq!(payload_of(&next(&mut b_data, "first").await).as_ref(), b"first");

    a.begin_send_to(b"second", None, SendOptions::raw())
        .expect("schedule async send");
    assert_eq!(payload_of(&next(&mut b_data, "second").await).as_ref(), b"second");

    a.begin_send(b"third", SendOptions::default())
        .expect("schedule async send");
    assert_eq!(payload_of(&next(&mut b_data, "third").await).as_ref(), b"third");
}

#[tokio::test(flavor = "multi_thread")]
async fn datagram_without_any_target_is_rejected() {
    let probe = Arc::new(CodecProbe::default());
    let a = bound_udp(&probe, None).await;

    let err = a.send(b"lost", SendOptions::default()).await.unwrap_err();
    assert!(matches!(err, SocketError::MissingRemote));
    let err = a.begin_send_to(b"lost", None, SendOptions::default()).unwrap_err();
    assert_eq!(err.code(), "spark.socket.missing_remote");
    assert_eq!(a.status(), SocketStatus::Established);
}

#[tokio::test(flavor = "multi_thread")]
async fn multicast_port_mismatch_fails_before_socket_creation() {
    let connection = ClientBuilder::multicast()
        .with_local("0.0.0.0:6000".parse().expect("local"))
        .with_remote("224.2.2.2:6666".parse().expect("group"))
        .build()
        .expect("build multicast");
    let transitions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&transitions);
    connection.on_status_changed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let err = connection.create().await.unwrap_err();
    assert!(matches!(
        err,
        SocketError::MulticastPortMismatch {
            local: 6000,
            group: 6666
        }
    ));
    assert_eq!(connection.status(), SocketStatus::Undefined);
    assert_eq!(connection.local_addr(), Some("0.0.0.0:6000".parse().expect("local")));
    assert_eq!(transitions.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn decode_error_is_reported_and_receiving_continues() {
    let probe = Arc::new(CodecProbe::default());
    let a = bound_udp(&probe, None).await;
    let b = bound_udp(&probe, None).await;
    let mut b_data = data_channel(&b);
    let (exception_tx, mut exceptions) = unbounded_channel();
    b.on_exception(move |event| {
        let _ = exception_tx.send((event.address(), event.cause().code()));
    });

    let b_addr = b.local_addr().expect("b bound");
    a.send_to(POISON, Some(b_addr), SendOptions::default())
        .await
        .expect("send poison");
    let (address, code) = next(&mut exceptions, "decode failure").await;
    assert_eq!(address, a.local_addr());
    assert_eq!(code, "spark.socket.decode_failed");

    a.send_to(b"after", Some(b_addr), SendOptions::default())
        .await
        .expect("send after poison");
    assert_eq!(payload_of(&next(&mut b_data, "after").await).as_ref(), b"after");
    assert_eq!(b.status(), SocketStatus::Established);
}

#[tokio::test(flavor = "multi_thread")]
async fn destroy_resets_codec_and_allows_rebind() {
    let probe = Arc::new(CodecProbe::default());
    let a = bound_udp(&probe, None).await;
    let first = a.local_addr().expect("bound");

    a.destroy();
    assert_eq!(a.status(), SocketStatus::Shutdown);
    assert_eq!(probe.resets.load(Ordering::SeqCst), 1);
    let err = a.send_to(b"x", Some(first), SendOptions::default()).await.unwrap_err();
    assert!(matches!(err, SocketError::InvalidState { .. }));

    a.create().await.expect("rebind");
    assert_eq!(a.status(), SocketStatus::Established);
    a.dispose();
    assert_eq!(probe.disposes.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn destroy_releases_fixed_port_before_returning() {
    let local = free_port([127, 0, 0, 1]);
    let probe = Arc::new(CodecProbe::default());
    let connection = ClientBuilder::udp()
        .with_local(local)
        .with_codec_factory(ProbeCodec::factory(Arc::clone(&probe)))
        .build()
        .expect("build udp");

    for round in 0..3 {
        connection
            .create()
            .await
            .unwrap_or_else(|err| panic!("create in round {round}: {err}"));
        assert_eq!(connection.local_addr(), Some(local));
        connection.destroy();

        let rebound = UdpSocket::bind(local)
            .unwrap_or_else(|err| panic!("port still held after destroy in round {round}: {err}"));
        drop(rebound);
    }

    connection.create().await.expect("create after release");
    assert_eq!(connection.status(), SocketStatus::Established);
    connection.dispose();
    UdpSocket::bind(local).expect("port released by dispose");
    assert_eq!(probe.resets.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn multicast_members_share_port_and_see_real_sender() {
    let port = free_port([0, 0, 0, 0]).port();
    let local = SocketAddr::from(([0, 0, 0, 0], port));
    let group = SocketAddr::from(([239, 255, 42, 99], port));
    let probe = Arc::new(CodecProbe::default());
    let member = || {
        ClientBuilder::multicast()
            .with_local(local)
            .with_remote(group)
            .with_codec_factory(ProbeCodec::factory(Arc::clone(&probe)))
            .build()
            .expect("build multicast")
    };

    let sender = member();
    let listener = member();
    sender.create().await.expect("first member joins");
    listener.create().await.expect("second member reuses the port");
    assert_eq!(listener.protocol(), ProtocolKind::Multicast);
    assert_eq!(listener.remote_addr(), Some(group));
    let mut inbox = data_channel(&listener);

    sender
        .send(b"to-group", SendOptions::default())
        .await
        .expect("send to group");

    let event = next(&mut inbox, "group datagram").await;
    assert_eq!(event.protocol(), ProtocolKind::Multicast);
    assert_eq!(event.remote().port(), port);
    assert!(!event.remote().ip().is_multicast());
    assert_eq!(payload_of(&event).as_ref(), b"to-group");

    sender.dispose();
    listener.dispose();
}
