use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;

use codec::attribute::XorMappedAddress;
use codec::{Attributes, Kind, MessageReader, MessageWriter, Method};

use icelink::config::Settings;
use icelink::discovery::{DiscoveryObserver, StunDiscovery, StunDiscoveryOptions};
use icelink::dns::{SrvRecord, StaticResolver};
use icelink::requester::StunRequesterManager;

/// a minimal binding-only STUN server on loopback.
async fn spawn_stun_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };

            let mut attributes = Attributes::default();
            let Ok(message) = MessageReader::decode(&buf[..n], &mut attributes) else {
                continue;
            };

            if message.method != Method::Binding(Kind::Request) {
                continue;
            }

            let mut reply = bytes::BytesMut::with_capacity(64);
            let mut writer =
                MessageWriter::extend(Method::Binding(Kind::Response), &message, &mut reply);
            writer.append::<XorMappedAddress>(from);
            writer.flush(None).unwrap();

            let _ = socket.send_to(&reply, from).await;
        }
    });

    address
}

/// routes discovery sends over a real UDP socket and feeds replies
/// back through the requester manager.
struct UdpDriver {
    socket: Arc<UdpSocket>,
    mapped: Mutex<Vec<Option<SocketAddr>>>,
}

impl DiscoveryObserver for UdpDriver {
    fn on_send(&self, _: &Arc<StunDiscovery>, destination: SocketAddr, packet: &[u8]) {
        let socket = self.socket.clone();
        let packet = packet.to_vec();
        tokio::spawn(async move {
            let _ = socket.send_to(&packet, destination).await;
        });
    }

    fn on_completed(&self, _: &Arc<StunDiscovery>, mapped: Option<SocketAddr>) {
        self.mapped.lock().push(mapped);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovery_learns_the_mapped_address() {
    let server = spawn_stun_server().await;

    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let local = socket.local_addr().unwrap();

    let driver = Arc::new(UdpDriver {
        socket: socket.clone(),
        mapped: Mutex::new(Vec::new()),
    });

    let _discovery = StunDiscovery::create(
        Arc::new(Settings::default()),
        Arc::new(StaticResolver(Vec::new())),
        StunDiscoveryOptions {
            srv_result: Some(vec![SrvRecord {
                priority: 0,
                weight: 0,
                port: server.port(),
                target: "localhost".into(),
                ips: vec![server.ip()],
            }]),
            ..Default::default()
        },
        driver.clone(),
    );

    // pump replies from the socket into the requester manager.
    let pump_socket = socket.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, from)) = pump_socket.recv_from(&mut buf).await else {
                return;
            };

            StunRequesterManager::singleton().handle_packet(from, &buf[..n]);
        }
    });

    // the mapped address seen by a loopback server is the socket's
    // own address.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(first) = driver.mapped.lock().first() {
            assert_eq!(*first, Some(local));
            break;
        }

        assert!(
            tokio::time::Instant::now() < deadline,
            "discovery never completed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
