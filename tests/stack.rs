use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use icelink::config::Settings;
use icelink::dns::StaticResolver;
use icelink::error::Reason;
use icelink::ice::{
    IceControl, IceSession, IceSessionObserver, IceSessionOptions, IceSessionState, IceSocket,
    IceSocketObserver, IceSocketOptions, IceSocketState, KeepAliveOptions, RemoteParty,
};
use icelink::rudp::{RudpTransport, RudpTransportObserver, RudpTransportState};

struct QuietSocket;

impl IceSocketObserver for QuietSocket {
    fn on_state_changed(&self, _: &Arc<IceSocket>, _: IceSocketState) {}
    fn on_candidates_changed(&self, _: &Arc<IceSocket>) {}
}

struct QuietTransport;

impl RudpTransportObserver for QuietTransport {
    fn on_state_changed(&self, _: &Arc<RudpTransport>, _: RudpTransportState) {}
    fn on_channel_waiting(&self, _: &Arc<RudpTransport>) {}
}

struct QuietSession;

impl IceSessionObserver for QuietSession {
    fn on_state_changed(&self, _: &Arc<IceSession>, _: IceSessionState) {}
    fn on_data(&self, _: &Arc<IceSession>, _: &[u8]) {}
}

fn init_logging() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init();
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn loopback_socket(settings: &Arc<Settings>) -> Arc<IceSocket> {
    IceSocket::create(
        settings.clone(),
        Arc::new(StaticResolver(Vec::new())),
        IceSocketOptions {
            component_id: 1,
            bind_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            ..Default::default()
        },
        Arc::new(QuietSocket),
    )
}

fn nominated(session: &Arc<IceSession>) -> bool {
    matches!(
        session.state().0,
        IceSessionState::Nominated | IceSessionState::Completed
    )
}

/// two loopback peers: host candidates only, checks in both
/// directions, controlling side nominates, then a reliable channel
/// carries bytes in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connectivity_then_reliable_delivery() {
    init_logging();
    let settings = Arc::new(Settings::default());

    let socket_a = loopback_socket(&settings);
    let socket_b = loopback_socket(&settings);
    wait_until("socket a ready", || {
        socket_a.state().0 == IceSocketState::Ready
    })
    .await;
    wait_until("socket b ready", || {
        socket_b.state().0 == IceSocketState::Ready
    })
    .await;

    let transport_a = RudpTransport::create(settings.clone(), Arc::new(QuietTransport));
    let transport_b = RudpTransport::create(settings.clone(), Arc::new(QuietTransport));

    let session_a = socket_a.create_session(
        IceSessionOptions {
            control: IceControl::Controlling,
            local_username_frag: "frag-a".into(),
            local_password: "password-a".into(),
            remote: None,
            keep_alive: None,
        },
        transport_a.session_observer(),
    );
    transport_a.attach(&session_a);

    let session_b = socket_b.create_session(
        IceSessionOptions {
            control: IceControl::Controlled,
            local_username_frag: "frag-b".into(),
            local_password: "password-b".into(),
            remote: None,
            keep_alive: None,
        },
        transport_b.session_observer(),
    );
    transport_b.attach(&session_b);

    // the outer signalling layer would exchange these.
    session_a.set_remote(RemoteParty {
        username_frag: "frag-b".into(),
        password: "password-b".into(),
        candidates: socket_b.local_candidates(),
    });
    session_b.set_remote(RemoteParty {
        username_frag: "frag-a".into(),
        password: "password-a".into(),
        candidates: socket_a.local_candidates(),
    });

    wait_until("session a nominated", || nominated(&session_a)).await;
    wait_until("session b nominated", || nominated(&session_b)).await;

    // open a reliable channel a -> b.
    let (channel_a, streams_a) = transport_a.open_channel().expect("channel allocates");
    wait_until("channel connects", || {
        channel_a.state() == icelink::rudp::RudpChannelState::Connected
    })
    .await;

    let accepted = transport_b.accept_channel().expect("remote open surfaced");
    let (_channel_b, streams_b) = accepted;
    streams_b.receive.notify_ready_to_read();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    streams_a.send.write(&payload);

    let mut delivered = Vec::new();
    wait_until("payload delivered in order", || {
        let mut buf = [0u8; 4096];
        loop {
            let n = streams_b.receive.read(&mut buf);
            if n == 0 {
                break;
            }

            delivered.extend_from_slice(&buf[..n]);
        }

        delivered.len() >= payload.len()
    })
    .await;

    assert_eq!(delivered, payload);

    session_a.shutdown();
    session_b.shutdown();
    socket_a.shutdown();
    socket_b.shutdown();
}

/// resume in time keeps the nominated pair; overstaying the allowance
/// fails the session with the distinct backgrounding code.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backgrounding_allowance_is_enforced() {
    init_logging();
    let settings = Arc::new(Settings::default());

    let socket_a = loopback_socket(&settings);
    let socket_b = loopback_socket(&settings);
    wait_until("sockets ready", || {
        socket_a.state().0 == IceSocketState::Ready && socket_b.state().0 == IceSocketState::Ready
    })
    .await;

    let keep_alive = KeepAliveOptions {
        keep_alive: Duration::from_secs(15),
        expect_traffic_within: Duration::from_secs(60),
        aliveness_timeout: Duration::from_secs(2),
        backgrounding_timeout: Duration::from_millis(200),
    };

    let session_a = socket_a.create_session(
        IceSessionOptions {
            control: IceControl::Controlling,
            local_username_frag: "bg-a".into(),
            local_password: "password-a".into(),
            remote: None,
            keep_alive: Some(keep_alive.clone()),
        },
        Arc::new(QuietSession),
    );

    let session_b = socket_b.create_session(
        IceSessionOptions {
            control: IceControl::Controlled,
            local_username_frag: "bg-b".into(),
            local_password: "password-b".into(),
            remote: None,
            keep_alive: None,
        },
        Arc::new(QuietSession),
    );

    session_a.set_remote(RemoteParty {
        username_frag: "bg-b".into(),
        password: "password-b".into(),
        candidates: socket_b.local_candidates(),
    });
    session_b.set_remote(RemoteParty {
        username_frag: "bg-a".into(),
        password: "password-a".into(),
        candidates: socket_a.local_candidates(),
    });

    wait_until("nominated", || nominated(&session_a)).await;

    // a short absence is forgiven: an aliveness check runs and the
    // session stays on its nominated pair.
    session_a.going_to_background();
    tokio::time::sleep(Duration::from_millis(50)).await;
    session_a.returning_from_background();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(nominated(&session_a));

    // overstaying the allowance is fatal, with the distinct code.
    session_a.going_to_background();
    tokio::time::sleep(Duration::from_millis(400)).await;
    session_a.returning_from_background();

    wait_until("session failed", || {
        session_a.state().0 == IceSessionState::Shutdown
    })
    .await;
    assert_eq!(session_a.state().1, Some(Reason::BackgroundingTimeout));

    session_b.shutdown();
    socket_a.shutdown();
    socket_b.shutdown();
}
