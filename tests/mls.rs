use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rsa::{RsaPrivateKey, RsaPublicKey};

use icelink::config::Settings;
use icelink::mls::{KeyingType, MlsChannel, MlsObserver, MlsOptions, MlsState};
use icelink::stream::{StreamReader, StreamReaderObserver, StreamWriter, TransportStream};

struct QuietChannel;

impl MlsObserver for QuietChannel {
    fn on_state_changed(&self, _: &Arc<MlsChannel>, _: MlsState) {}
}

/// forwards one encoded stream into the peer's inbound writer while
/// recording the algorithm indices that crossed the wire.
struct Pipe {
    into: StreamWriter,
    reader: StreamReader,
    parse: Mutex<Vec<u8>>,
    indices: Arc<Mutex<Vec<u32>>>,
}

impl StreamReaderObserver for Pipe {
    fn on_reader_ready(&self) {
        let mut chunk = [0u8; 65536];
        loop {
            let n = self.reader.read(&mut chunk);
            if n == 0 {
                break;
            }

            // snoop frame indices for the rotation assertion.
            {
                let mut parse = self.parse.lock();
                parse.extend_from_slice(&chunk[..n]);
                loop {
                    if parse.len() < 8 {
                        break;
                    }

                    let index = u32::from_be_bytes(parse[..4].try_into().unwrap());
                    let size = u32::from_be_bytes(parse[4..8].try_into().unwrap()) as usize;
                    let frame_len = 8 + size + if index == 0 { 0 } else { 20 };
                    if parse.len() < frame_len {
                        break;
                    }

                    if index != 0 {
                        let mut indices = self.indices.lock();
                        if indices.last() != Some(&index) {
                            indices.push(index);
                        }
                    }

                    parse.drain(..frame_len);
                }
            }

            self.into.write(&chunk[..n]);
        }
    }
}

fn connect(pipes: &mut Vec<icelink::subscriptions::Subscription>, from: &StreamReader, into: StreamWriter) -> Arc<Mutex<Vec<u32>>> {
    let indices = Arc::new(Mutex::new(Vec::new()));
    let pipe = Arc::new(Pipe {
        into,
        reader: from.clone(),
        parse: Mutex::new(Vec::new()),
        indices: indices.clone(),
    });

    pipes.push(from.subscribe(pipe));
    from.notify_ready_to_read();
    indices
}

struct Endpoint {
    channel: Arc<MlsChannel>,
    /// application plaintext in.
    send: StreamWriter,
    /// application plaintext out.
    receive: StreamReader,
    /// wire side.
    encoded_out: StreamReader,
    encoded_in: StreamWriter,
}

fn endpoint(settings: &Settings, context: &str) -> Endpoint {
    let (encoded_in, receive_encoded) = TransportStream::create();
    let (receive_decoded, receive) = TransportStream::create();
    let (send, send_decoded) = TransportStream::create();
    let (send_encoded, encoded_out) = TransportStream::create();

    let channel = MlsChannel::create(
        settings,
        MlsOptions {
            local_context_id: context.into(),
            keying: KeyingType::Passphrase,
        },
        receive_encoded,
        receive_decoded,
        send_decoded,
        send_encoded,
        Arc::new(QuietChannel),
    );

    Endpoint {
        channel,
        send,
        receive,
        encoded_out,
        encoded_in,
    }
}

fn drain(reader: &StreamReader) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = reader.read(&mut buf);
        if n == 0 {
            break;
        }

        out.extend_from_slice(&buf[..n]);
    }

    out
}

#[tokio::test(start_paused = true)]
async fn rotation_produces_increasing_indices_and_lossless_delivery() {
    let mut settings = Settings::default();
    settings.mls_rotation_interval_secs = 30;

    let a = endpoint(&settings, "context-a");
    let b = endpoint(&settings, "context-b");

    let mut pipes = Vec::new();
    let a_to_b = connect(&mut pipes, &a.encoded_out, b.encoded_in.clone());
    let _b_to_a = connect(&mut pipes, &b.encoded_out, a.encoded_in.clone());

    a.receive.notify_ready_to_read();
    b.receive.notify_ready_to_read();

    // 512-bit keys keep the test fast; strength is irrelevant here.
    let mut rng = rand::thread_rng();
    let key_a = RsaPrivateKey::new(&mut rng, 512).unwrap();
    let key_b = RsaPrivateKey::new(&mut rng, 512).unwrap();

    a.channel.set_remote_verify_key(RsaPublicKey::from(&key_b));
    b.channel.set_remote_verify_key(RsaPublicKey::from(&key_a));
    a.channel.set_passphrase("open sesame");
    b.channel.set_passphrase("open sesame");

    assert!(a.channel.needs_local_signing_key());
    a.channel.set_local_signing_key(key_a);
    b.channel.set_local_signing_key(key_b);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.channel.state().0, MlsState::Connected);
    assert_eq!(b.channel.state().0, MlsState::Connected);
    assert_eq!(a.channel.remote_context_id().as_deref(), Some("context-b"));

    // one kilobyte per second for ninety seconds across a 30s
    // rotation interval.
    let payload = vec![0x42u8; 1024];
    let mut received = Vec::new();
    for _ in 0..90 {
        a.send.write(&payload);
        tokio::time::sleep(Duration::from_secs(1)).await;
        received.extend_from_slice(&drain(&b.receive));
    }

    received.extend_from_slice(&drain(&b.receive));
    assert_eq!(received.len(), 90 * 1024);
    assert!(received.iter().all(|b| *b == 0x42));

    // exactly three indices, strictly increasing.
    let indices = a_to_b.lock().clone();
    assert_eq!(indices, vec![1, 2, 3]);

    assert_eq!(b.channel.discarded_frames(), 0);
}

#[tokio::test(start_paused = true)]
async fn tampered_frames_are_dropped_and_counted() {
    let settings = Settings::default();

    let a = endpoint(&settings, "alpha");
    let b = endpoint(&settings, "beta");

    let mut pipes = Vec::new();
    let _a_to_b = connect(&mut pipes, &a.encoded_out, b.encoded_in.clone());
    let _b_to_a = connect(&mut pipes, &b.encoded_out, a.encoded_in.clone());
    b.receive.notify_ready_to_read();

    let mut rng = rand::thread_rng();
    let key_a = RsaPrivateKey::new(&mut rng, 512).unwrap();
    let key_b = RsaPrivateKey::new(&mut rng, 512).unwrap();

    a.channel.set_remote_verify_key(RsaPublicKey::from(&key_b));
    b.channel.set_remote_verify_key(RsaPublicKey::from(&key_a));
    a.channel.set_passphrase("swordfish");
    b.channel.set_passphrase("swordfish");
    a.channel.set_local_signing_key(key_a);
    b.channel.set_local_signing_key(key_b);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.channel.state().0, MlsState::Connected);

    // a forged frame: plausible header, garbage mac.
    let mut forged = Vec::new();
    forged.extend_from_slice(&1u32.to_be_bytes());
    forged.extend_from_slice(&4u32.to_be_bytes());
    forged.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    forged.extend_from_slice(&[0u8; 20]);
    b.encoded_in.write(&forged);

    a.send.write(b"legitimate");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(drain(&b.receive), b"legitimate");
    assert_eq!(b.channel.discarded_frames(), 1);
}
