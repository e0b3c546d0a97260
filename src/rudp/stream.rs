use bytes::BytesMut;
use parking_lot::Mutex;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::Settings;
use crate::error::Reason;
use crate::stream::{StreamReader, StreamReaderObserver, StreamWriter};
use crate::subscriptions::Subscription;

use super::RudpError;
use super::packet::{MAX_PAYLOAD, RudpFlags, RudpPacket, decode_vector, encode_vector};

/// burst batons never accumulate past this.
const MAX_BATONS: u32 = 8;

/// burst size ceiling.
const MAX_PACKETS_PER_BURST: u32 = 16;

/// slack added to the RTT estimate before a forced ACK.
const ENSURE_ACK_SLACK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RudpStreamState {
    Connected,
    ShuttingDown,
    Shutdown,
}

pub trait RudpStreamObserver: Send + Sync {
    fn on_state_changed(&self, stream: &Arc<RudpChannelStream>, state: RudpStreamState);

    /// put one encoded packet on the wire; false when the transport
    /// could not take it right now (loss semantics apply).
    fn on_send_packet(&self, stream: &Arc<RudpChannelStream>, packet: &[u8]) -> bool;
}

pub struct RudpStreamOptions {
    /// channel number stamped on outbound packets.
    pub sending_channel: u16,
    /// channel number expected on inbound packets.
    pub receiving_channel: u16,
    pub next_sequence_to_send: u64,
    pub next_sequence_expecting: u64,
    pub min_rtt: Duration,
}

struct BufferedPacket {
    payload: Vec<u8>,
    sent_at: Instant,
    ps: bool,
    /// cumulative parity of everything sent up to and including this
    /// packet.
    xored_parity_to_now: bool,
    holds_baton: bool,
    flagged_failed: bool,
    resend: bool,
}

struct Inner {
    state: RudpStreamState,
    reason: Option<Reason>,
    receive_stream: Option<StreamWriter>,
    send_stream: Option<StreamReader>,
    _send_sub: Option<Subscription>,

    // send side.
    next_sequence: u64,
    xored_parity_to_now: bool,
    sending: BTreeMap<u64, BufferedPacket>,
    available_batons: u32,
    packets_per_burst: u32,
    addback_period: Duration,
    addback_at: Option<Instant>,
    ensure_ack_at: Option<Instant>,
    clean_since: Instant,
    rtt: Duration,

    // receive side (remote sequence space).
    gsnr: u64,
    gsnfr: u64,
    gsnr_parity: bool,
    xored_parity_to_gsnfr: bool,
    received: BTreeMap<u64, (Vec<u8>, bool)>,
    received_bytes: usize,
    dropped_receive: u64,
    duplicate_flag: bool,
    ecn_flag: bool,
    ack_needed: bool,
}

/// A reliable ordered byte stream over any lossy datagram path.
///
/// The send side reads application bytes from its send transport
/// stream, cuts them into sequenced packets, and paces bursts with a
/// baton scheme: a burst costs a baton, ACK progress returns batons,
/// and congestion events slow the rate batons are minted at.  The
/// receive side reorders packets and feeds the contiguous prefix into
/// the receive transport stream.
pub struct RudpChannelStream {
    sending_channel: u16,
    receiving_channel: u16,
    min_rtt: Duration,
    addback_initial: Duration,
    addback_max: Duration,
    clean_period: Duration,
    max_receive_bytes: usize,
    observer: Arc<dyn RudpStreamObserver>,
    inner: Mutex<Inner>,
}

/// application wrote into the send stream.
struct SendStreamBridge(Weak<RudpChannelStream>);

impl StreamReaderObserver for SendStreamBridge {
    fn on_reader_ready(&self) {
        if let Some(stream) = self.0.upgrade() {
            stream.send_now();
        }
    }
}

impl RudpChannelStream {
    pub fn create(
        settings: &Settings,
        options: RudpStreamOptions,
        observer: Arc<dyn RudpStreamObserver>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let stream = Arc::new(Self {
            sending_channel: options.sending_channel,
            receiving_channel: options.receiving_channel,
            min_rtt: options.min_rtt,
            addback_initial: settings.rudp_addback_initial(),
            addback_max: settings.rudp_addback_max(),
            clean_period: settings.rudp_clean_period(),
            max_receive_bytes: settings.rudp_max_receive_bytes,
            observer,
            inner: Mutex::new(Inner {
                state: RudpStreamState::Connected,
                reason: None,
                receive_stream: None,
                send_stream: None,
                _send_sub: None,
                next_sequence: options.next_sequence_to_send,
                xored_parity_to_now: false,
                sending: BTreeMap::new(),
                available_batons: 1,
                packets_per_burst: 3,
                addback_period: settings.rudp_addback_initial(),
                addback_at: None,
                ensure_ack_at: None,
                clean_since: now,
                rtt: options.min_rtt,
                gsnr: options.next_sequence_expecting.saturating_sub(1),
                gsnfr: options.next_sequence_expecting.saturating_sub(1),
                gsnr_parity: false,
                xored_parity_to_gsnfr: false,
                received: BTreeMap::new(),
                received_bytes: 0,
                dropped_receive: 0,
                duplicate_flag: false,
                ecn_flag: false,
                ack_needed: false,
            }),
        });

        stream.drive();
        stream
    }

    pub fn state(&self) -> (RudpStreamState, Option<Reason>) {
        let inner = self.inner.lock();
        (inner.state, inner.reason)
    }

    pub fn sending_channel(&self) -> u16 {
        self.sending_channel
    }

    pub fn receiving_channel(&self) -> u16 {
        self.receiving_channel
    }

    /// greatest remote sequence fully received, for diagnostics.
    pub fn contiguous_sequence(&self) -> u64 {
        self.inner.lock().gsnfr
    }

    /// packets shed because the reorder buffer was full.
    pub fn dropped_receive_packets(&self) -> u64 {
        self.inner.lock().dropped_receive
    }

    /// attach the application-facing streams: `receive` is written
    /// with in-order delivered bytes, `send` is drained for outbound
    /// data.
    pub fn set_streams(self: &Arc<Self>, receive: StreamWriter, send: StreamReader) {
        send.notify_ready_to_read();
        let sub = send.subscribe(Arc::new(SendStreamBridge(Arc::downgrade(self))));

        {
            let mut inner = self.inner.lock();
            inner.receive_stream = Some(receive);
            inner.send_stream = Some(send);
            inner._send_sub = Some(sub);
        }

        self.send_now();
    }

    /// the transport can take more packets again.
    pub fn notify_socket_write_ready(self: &Arc<Self>) {
        self.send_now();
    }

    /// decode an inbound frame against the stream's sequence context
    /// and process it.
    pub fn handle_packet_bytes(self: &Arc<Self>, bytes: &[u8], ecn: bool) -> Result<(), RudpError> {
        let (expected_sequence, expected_ack) = {
            let inner = self.inner.lock();
            (inner.gsnr + 1, inner.next_sequence.saturating_sub(1))
        };

        let packet = RudpPacket::decode(bytes, expected_sequence, expected_ack)?;
        if packet.channel != self.receiving_channel {
            return Err(RudpError::IllegalPacket);
        }

        self.handle_packet(packet, ecn);
        Ok(())
    }

    /// process a decoded packet.  An ACK that fails validation is
    /// dropped without touching the connection.
    pub fn handle_packet(self: &Arc<Self>, packet: RudpPacket, ecn: bool) {
        if self.inner.lock().state == RudpStreamState::Shutdown {
            return;
        }

        // every packet carries the remote party's view of our
        // sequences; apply it first.
        if let Err(RudpError::IllegalAck) = self.handle_ack(&packet) {
            log::debug!("illegal ack dropped: channel={:#06x}", self.sending_channel);
            return;
        }

        if !packet.is_ack_only() {
            self.receive_data(packet, ecn);
        }

        // progress may have freed batons or flagged resends.
        self.send_now();
        self.flush_ack();
    }

    /// wind down; with `once_all_sent` the stream lingers until every
    /// buffered byte is delivered and acknowledged.
    pub fn shutdown(self: &Arc<Self>, once_all_sent: bool) {
        let finished = {
            let mut inner = self.inner.lock();
            if inner.state == RudpStreamState::Shutdown {
                return;
            }

            if once_all_sent && (!inner.sending.is_empty() || has_pending(&inner)) {
                inner.state = RudpStreamState::ShuttingDown;
                false
            } else {
                true
            }
        };

        if finished {
            self.finish(None);
        } else {
            self.observer
                .on_state_changed(self, RudpStreamState::ShuttingDown);
        }
    }

    fn finish(self: &Arc<Self>, reason: Option<Reason>) {
        {
            let mut inner = self.inner.lock();
            if inner.state == RudpStreamState::Shutdown {
                return;
            }

            inner.state = RudpStreamState::Shutdown;
            inner.reason = reason;
            inner.sending.clear();
            inner.received.clear();
            inner._send_sub = None;
            inner.send_stream = None;
            inner.receive_stream = None;
        }

        self.observer.on_state_changed(self, RudpStreamState::Shutdown);
    }

    fn drive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let Some(stream) = weak.upgrade() else { return };
                if stream.inner.lock().state == RudpStreamState::Shutdown {
                    return;
                }

                stream.tick();
            }
        });
    }

    fn tick(self: &Arc<Self>) {
        let now = Instant::now();
        let mut finish = false;

        {
            let mut inner = self.inner.lock();

            // mint a baton on the add-back schedule while data wants
            // to move.
            if (has_pending(&inner) || !inner.sending.is_empty())
                && inner.available_batons < MAX_BATONS
            {
                match inner.addback_at {
                    None => inner.addback_at = Some(now + inner.addback_period),
                    Some(at) if now >= at => {
                        inner.available_batons += 1;
                        inner.addback_at = Some(now + inner.addback_period);
                    }
                    _ => {}
                }
            } else {
                inner.addback_at = None;
            }

            // data outstanding with no baton to chase it: force the
            // question.
            if let Some(at) = inner.ensure_ack_at
                && now >= at
            {
                inner.ensure_ack_at = None;
                if !inner.sending.is_empty() {
                    for packet in inner.sending.values_mut() {
                        packet.flagged_failed = true;
                        packet.resend = true;
                    }

                    congestion_event(&mut inner, self.addback_max);
                    log::debug!(
                        "rudp ensure-data-arrived expired, resending window: channel={:#06x}",
                        self.sending_channel
                    );
                }
            }

            // growth after a clean stretch.
            if now.duration_since(inner.clean_since) >= self.clean_period {
                inner.clean_since = now;
                inner.packets_per_burst = (inner.packets_per_burst + 1).min(MAX_PACKETS_PER_BURST);
                inner.addback_period = (inner.addback_period / 2).max(self.addback_initial);
            }

            if inner.state == RudpStreamState::ShuttingDown
                && inner.sending.is_empty()
                && !has_pending(&inner)
            {
                finish = true;
            }
        }

        if finish {
            self.finish(None);
            return;
        }

        self.send_now();
        self.flush_ack();
    }

    /// transmit as much as batons and pending data allow.
    fn send_now(self: &Arc<Self>) {
        loop {
            let burst = {
                let mut inner = self.inner.lock();
                if inner.state == RudpStreamState::Shutdown {
                    return;
                }

                let resend_waiting = inner.sending.values().any(|p| p.resend);
                if inner.available_batons == 0 || (!resend_waiting && !has_pending(&inner)) {
                    // out of batons with data outstanding: make sure
                    // an answer is forced eventually.
                    if !inner.sending.is_empty() && inner.ensure_ack_at.is_none() {
                        let rtt = inner.rtt.max(self.min_rtt);
                        inner.ensure_ack_at = Some(Instant::now() + rtt * 2 + ENSURE_ACK_SLACK);
                    }

                    return;
                }

                inner.available_batons -= 1;
                self.build_burst(&mut inner)
            };

            if burst.is_empty() {
                return;
            }

            for bytes in burst {
                self.observer.on_send_packet(self, &bytes);
            }
        }
    }

    /// assemble one burst of resends and fresh packets under the
    /// burst budget; marks the baton holder.
    fn build_burst(&self, inner: &mut Inner) -> Vec<BytesMut> {
        let now = Instant::now();
        let mut frames = Vec::new();
        let budget = inner.packets_per_burst as usize;

        // resends first.
        let resend_seqs: Vec<u64> = inner
            .sending
            .iter()
            .filter(|(_, p)| p.resend)
            .map(|(seq, _)| *seq)
            .take(budget)
            .collect();

        for seq in resend_seqs.iter() {
            let ack = ack_state(inner);
            if let Some(packet) = inner.sending.get_mut(seq) {
                packet.resend = false;
                packet.sent_at = now;

                let frame = encode_frame(
                    self.sending_channel,
                    *seq,
                    packet.ps,
                    &packet.payload,
                    &ack,
                );

                frames.push(frame);
            }
        }

        // fresh data fills the rest of the budget.
        let mut first_new = None;
        while frames.len() < budget {
            let Some(payload) = read_pending(inner) else {
                break;
            };

            let sequence = inner.next_sequence;
            inner.next_sequence += 1;

            let ps = parity(&payload);
            inner.xored_parity_to_now ^= ps;

            let ack = ack_state(inner);
            let frame = encode_frame(self.sending_channel, sequence, ps, &payload, &ack);

            inner.sending.insert(
                sequence,
                BufferedPacket {
                    payload,
                    sent_at: now,
                    ps,
                    xored_parity_to_now: inner.xored_parity_to_now,
                    holds_baton: false,
                    flagged_failed: false,
                    resend: false,
                },
            );

            first_new.get_or_insert(sequence);
            frames.push(frame);
        }

        // the burst's baton travels with its first packet.
        let holder = first_new.or_else(|| resend_seqs.first().copied());
        if let Some(holder) = holder {
            if let Some(packet) = inner.sending.get_mut(&holder) {
                packet.holds_baton = true;
            }
        } else {
            // nothing was sendable after all; the baton returns.
            inner.available_batons += 1;
        }

        if !frames.is_empty() {
            inner.ack_needed = false;
            inner.duplicate_flag = false;
            inner.ecn_flag = false;
        }

        frames
    }

    /// apply the ACK fields a packet carried about our send window.
    fn handle_ack(self: &Arc<Self>, packet: &RudpPacket) -> Result<(), RudpError> {
        let mut inner = self.inner.lock();

        // an ACK cannot reference sequences we never used.
        if packet.gsnr >= inner.next_sequence && !inner.sending.is_empty() {
            return Err(RudpError::IllegalAck);
        }

        if inner.sending.is_empty() {
            return Ok(());
        }

        let mut congestion = packet.flags.dp || packet.flags.ec;
        let now = Instant::now();

        // parity cross-check over the fully received prefix.
        if let Some(reference) = inner.sending.get(&packet.gsnfr)
            && reference.xored_parity_to_now != packet.flags.xp
        {
            log::debug!(
                "rudp ack parity mismatch: channel={:#06x}",
                self.sending_channel
            );
            congestion = true;
        }

        // everything up to GSNFR arrived.
        let acked: Vec<u64> = inner
            .sending
            .range(..=packet.gsnfr)
            .map(|(seq, _)| *seq)
            .collect();

        let mut freed = 0;
        for seq in acked {
            if let Some(done) = inner.sending.remove(&seq) {
                if done.holds_baton {
                    freed += 1;
                }

                let sample = now.duration_since(done.sent_at);
                inner.rtt = (inner.rtt * 7 + sample) / 8;
            }
        }

        // the vector refines the GSNFR..=GSNR window.
        let states = decode_vector(&packet.vector);
        for (offset, received) in states.iter().enumerate() {
            let seq = packet.gsnfr + 1 + offset as u64;
            if seq > packet.gsnr {
                break;
            }

            if *received {
                if let Some(done) = inner.sending.remove(&seq) {
                    if done.holds_baton {
                        freed += 1;
                    }
                }
            } else if let Some(missing) = inner.sending.get_mut(&seq)
                && !missing.flagged_failed
            {
                missing.flagged_failed = true;
                missing.resend = true;
                congestion = true;
            }
        }

        // anything below GSNR the vector did not vouch for is lost.
        let suspects: Vec<u64> = inner
            .sending
            .range(..=packet.gsnr)
            .filter(|(_, p)| !p.flagged_failed)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in suspects {
            if let Some(missing) = inner.sending.get_mut(&seq) {
                missing.flagged_failed = true;
                missing.resend = true;
                congestion = true;
            }
        }

        inner.available_batons = (inner.available_batons + freed).min(MAX_BATONS);
        if inner.sending.is_empty() {
            inner.ensure_ack_at = None;
        }

        if congestion {
            congestion_event(&mut inner, self.addback_max);
        }

        Ok(())
    }

    /// receive-side processing of a data packet.
    fn receive_data(self: &Arc<Self>, packet: RudpPacket, ecn: bool) {
        let deliveries = {
            let mut inner = self.inner.lock();
            if ecn {
                inner.ecn_flag = true;
            }

            if packet.sequence <= inner.gsnfr || inner.received.contains_key(&packet.sequence) {
                inner.duplicate_flag = true;
                inner.ack_needed = true;
                return;
            }

            // the reorder buffer is bounded; the sender learns about
            // the shed packets through the stalled ACK.
            if inner.received_bytes + packet.payload.len() > self.max_receive_bytes {
                inner.dropped_receive += 1;
                return;
            }

            if packet.sequence > inner.gsnr {
                inner.gsnr = packet.sequence;
                inner.gsnr_parity = packet.flags.ps;
            }

            inner.received_bytes += packet.payload.len();
            inner
                .received
                .insert(packet.sequence, (packet.payload, packet.flags.ps));

            // hand the contiguous prefix to the application.
            let mut deliveries = Vec::new();
            while let Some((payload, ps)) = {
                let key = inner.gsnfr + 1;
                inner.received.remove(&key)
            } {
                inner.gsnfr += 1;
                inner.received_bytes -= payload.len();
                inner.xored_parity_to_gsnfr ^= ps;
                deliveries.push(payload);
            }

            inner.ack_needed = true;
            match inner.receive_stream.clone() {
                Some(writer) => {
                    deliveries
                        .into_iter()
                        .map(|payload| (writer.clone(), payload))
                        .collect::<Vec<_>>()
                }
                None => Vec::new(),
            }
        };

        for (writer, payload) in deliveries {
            writer.write(&payload);
        }
    }

    /// emit a pure ACK when one is owed and no data frame carried it.
    fn flush_ack(self: &Arc<Self>) {
        let frame = {
            let mut inner = self.inner.lock();
            if !inner.ack_needed || inner.state == RudpStreamState::Shutdown {
                None
            } else {
                inner.ack_needed = false;
                let ack = ack_state(&inner);
                inner.duplicate_flag = false;
                inner.ecn_flag = false;

                let sequence = inner.next_sequence.saturating_sub(1);
                Some(encode_frame(self.sending_channel, sequence, false, &[], &ack))
            }
        };

        if let Some(frame) = frame {
            self.observer.on_send_packet(self, &frame);
        }
    }
}

struct AckState {
    gsnr: u64,
    gsnfr: u64,
    pg: bool,
    xp: bool,
    dp: bool,
    ec: bool,
    vector: Vec<u8>,
}

fn ack_state(inner: &Inner) -> AckState {
    let mut states = Vec::new();
    let mut seq = inner.gsnfr + 1;
    while seq <= inner.gsnr && states.len() < 1000 {
        states.push(inner.received.contains_key(&seq));
        seq += 1;
    }

    AckState {
        gsnr: inner.gsnr,
        gsnfr: inner.gsnfr,
        pg: inner.gsnr_parity,
        xp: inner.xored_parity_to_gsnfr,
        dp: inner.duplicate_flag,
        ec: inner.ecn_flag,
        vector: encode_vector(&states),
    }
}

fn encode_frame(channel: u16, sequence: u64, ps: bool, payload: &[u8], ack: &AckState) -> BytesMut {
    let packet = RudpPacket {
        channel,
        sequence,
        gsnr: ack.gsnr,
        gsnfr: ack.gsnfr,
        flags: RudpFlags {
            ps,
            pg: ack.pg,
            xp: ack.xp,
            dp: ack.dp,
            ec: ack.ec,
        },
        vector: ack.vector.clone(),
        payload: payload.to_vec(),
    };

    let mut buf = BytesMut::with_capacity(payload.len() + 32);
    packet.encode(&mut buf);
    buf
}

fn has_pending(inner: &Inner) -> bool {
    inner
        .send_stream
        .as_ref()
        .map(|s| s.total_size_available() > 0)
        .unwrap_or(false)
}

fn read_pending(inner: &mut Inner) -> Option<Vec<u8>> {
    let reader = inner.send_stream.as_ref()?;
    let mut buf = vec![0u8; MAX_PAYLOAD];
    let n = reader.read(&mut buf);
    if n == 0 {
        return None;
    }

    buf.truncate(n);
    Some(buf)
}

fn parity(payload: &[u8]) -> bool {
    payload.iter().fold(0u32, |acc, b| acc + b.count_ones()) % 2 == 1
}

fn congestion_event(inner: &mut Inner, addback_max: Duration) {
    inner.packets_per_burst = (inner.packets_per_burst / 2).max(1);
    inner.addback_period = (inner.addback_period * 2).min(addback_max);
    inner.clean_since = Instant::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::TransportStream;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// a lossy in-memory wire into a peer stream.
    struct Wire {
        peer: PlMutex<Option<Arc<RudpChannelStream>>>,
        drop_next: AtomicBool,
        sent: PlMutex<Vec<Vec<u8>>>,
    }

    impl Wire {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                peer: PlMutex::new(None),
                drop_next: AtomicBool::new(false),
                sent: PlMutex::new(Vec::new()),
            })
        }
    }

    impl RudpStreamObserver for Wire {
        fn on_state_changed(&self, _: &Arc<RudpChannelStream>, _: RudpStreamState) {}

        fn on_send_packet(&self, _: &Arc<RudpChannelStream>, packet: &[u8]) -> bool {
            self.sent.lock().push(packet.to_vec());
            if self.drop_next.swap(false, Ordering::SeqCst) {
                return true;
            }

            if let Some(peer) = self.peer.lock().clone() {
                let _ = peer.handle_packet_bytes(packet, false);
            }

            true
        }
    }

    fn pair() -> (
        Arc<RudpChannelStream>,
        Arc<RudpChannelStream>,
        Arc<Wire>,
        Arc<Wire>,
        crate::stream::StreamWriter,
        crate::stream::StreamReader,
        crate::stream::StreamWriter,
        crate::stream::StreamReader,
    ) {
        let settings = Settings::default();
        let wire_a = Wire::new();
        let wire_b = Wire::new();

        let a = RudpChannelStream::create(
            &settings,
            RudpStreamOptions {
                sending_channel: 0x6000,
                receiving_channel: 0x6001,
                next_sequence_to_send: 10,
                next_sequence_expecting: 100,
                min_rtt: Duration::from_millis(50),
            },
            wire_a.clone(),
        );

        let b = RudpChannelStream::create(
            &settings,
            RudpStreamOptions {
                sending_channel: 0x6001,
                receiving_channel: 0x6000,
                next_sequence_to_send: 100,
                next_sequence_expecting: 10,
                min_rtt: Duration::from_millis(50),
            },
            wire_b.clone(),
        );

        *wire_a.peer.lock() = Some(b.clone());
        *wire_b.peer.lock() = Some(a.clone());

        // a's application streams.
        let (a_send_writer, a_send_reader) = TransportStream::create();
        let (a_recv_writer, a_recv_reader) = TransportStream::create();
        a.set_streams(a_recv_writer, a_send_reader);

        // b's application streams.
        let (b_send_writer, b_send_reader) = TransportStream::create();
        let (b_recv_writer, b_recv_reader) = TransportStream::create();
        b.set_streams(b_recv_writer, b_send_reader);

        (
            a,
            b,
            wire_a,
            wire_b,
            a_send_writer,
            a_recv_reader,
            b_send_writer,
            b_recv_reader,
        )
    }

    fn drain(reader: &crate::stream::StreamReader) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
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
    async fn bytes_flow_in_order(){
        let (_a, _b, _wa, _wb, a_send, _a_recv, _b_send, b_recv) = pair();

        a_send.write(b"hello ");
        a_send.write(b"reliable ");
        a_send.write(b"world");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(drain(&b_recv), b"hello reliable world");
    }

    #[tokio::test(start_paused = true)]
    async fn lost_packet_is_retransmitted_in_order() {
        let (a, _b, wire_a, _wb, a_send, _a_recv, _b_send, b_recv) = pair();

        // the first frame of the next burst vanishes on the wire.
        wire_a.drop_next.store(true, Ordering::SeqCst);

        let payload = vec![0x5Au8; 10_000];
        a_send.write(&payload);

        tokio::time::sleep(Duration::from_secs(30)).await;

        let delivered = drain(&b_recv);
        assert_eq!(delivered.len(), payload.len());
        assert_eq!(delivered, payload);
        assert_eq!(a.state().0, RudpStreamState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn both_directions_carry_data() {
        let (_a, _b, _wa, _wb, a_send, a_recv, b_send, b_recv) = pair();

        a_send.write(b"ping");
        b_send.write(b"pong");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(drain(&b_recv), b"ping");
        assert_eq!(drain(&a_recv), b"pong");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_the_window_to_flush() {
        let (a, _b, _wa, _wb, a_send, _a_recv, _b_send, b_recv) = pair();

        a_send.write(b"last words");
        a.shutdown(true);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(drain(&b_recv), b"last words");
        assert_eq!(a.state().0, RudpStreamState::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn illegal_ack_is_dropped_quietly() {
        let (a, _b, _wa, _wb, a_send, _a_recv, _b_send, _b_recv) = pair();

        a_send.write(b"data");
        tokio::time::sleep(Duration::from_millis(100)).await;

        // an ack for a sequence far beyond anything sent.
        let bogus = RudpPacket {
            channel: 0x6001,
            sequence: 100,
            gsnr: 5000,
            gsnfr: 5000,
            flags: RudpFlags::default(),
            vector: Vec::new(),
            payload: Vec::new(),
        };

        a.handle_packet(bogus, false);
        assert_eq!(a.state().0, RudpStreamState::Connected);
    }
}
