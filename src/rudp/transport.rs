use bytes::BytesMut;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::AHashMap;

use codec::attribute::{ChannelNumber, Data};
use codec::{Attributes, Kind, MessageReader, MessageWriter, Method, RfcVariant};

use crate::backoff::BackOffPattern;
use crate::config::Settings;
use crate::ice::{IceSession, IceSessionObserver, IceSessionState};
use crate::requester::{
    RequestAttr, RequesterObserver, StunRequest, StunRequester, StunRequesterOptions,
};
use crate::stream::{StreamReader, StreamWriter, TransportStream};

use super::stream::{
    RudpChannelStream, RudpStreamObserver, RudpStreamOptions, RudpStreamState,
};

/// reliable channel numbers live above the TURN data-channel range so
/// the two framings can never collide on the wire.
pub const RUDP_CHANNEL_RANGE: std::ops::RangeInclusive<u16> = 0x6000..=0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RudpTransportState {
    Ready,
    ShuttingDown,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RudpChannelState {
    Connecting,
    Connected,
    Shutdown,
}

pub trait RudpTransportObserver: Send + Sync {
    fn on_state_changed(&self, transport: &Arc<RudpTransport>, state: RudpTransportState);

    /// the remote party opened a channel; take it with
    /// [`RudpTransport::accept_channel`].
    fn on_channel_waiting(&self, transport: &Arc<RudpTransport>);
}

/// parameters exchanged by the channel-open handshake.
#[derive(Debug, Serialize, Deserialize)]
struct ConnectionInfo {
    /// the sender's receiving channel number.
    channel: u16,
    /// the sender's first data sequence number.
    next_sequence: u64,
    min_rtt_ms: u64,
}

/// One reliable channel with its application-facing stream endpoints.
pub struct RudpChannel {
    local_channel: u16,
    inner: Mutex<ChannelInner>,
}

struct ChannelInner {
    state: RudpChannelState,
    remote_channel: Option<u16>,
    stream: Option<Arc<RudpChannelStream>>,
    /// rudp-facing endpoints parked until the handshake resolves.
    recv_writer: Option<StreamWriter>,
    send_reader: Option<StreamReader>,
    next_sequence: u64,
    _open_requester: Option<Arc<StunRequester>>,
}

impl RudpChannel {
    pub fn local_channel_number(&self) -> u16 {
        self.local_channel
    }

    pub fn state(&self) -> RudpChannelState {
        self.inner.lock().state
    }

    pub fn remote_channel_number(&self) -> Option<u16> {
        self.inner.lock().remote_channel
    }

    pub fn stream(&self) -> Option<Arc<RudpChannelStream>> {
        self.inner.lock().stream.clone()
    }

    pub fn shutdown(&self, once_all_sent: bool) {
        let stream = {
            let mut inner = self.inner.lock();
            inner.state = RudpChannelState::Shutdown;
            inner.stream.clone()
        };

        if let Some(stream) = stream {
            stream.shutdown(once_all_sent);
        }
    }
}

/// endpoints handed to the channel opener: write outbound bytes into
/// `send`, read delivered bytes from `receive`.
pub struct ChannelStreams {
    pub send: StreamWriter,
    pub receive: StreamReader,
}

struct TransportState {
    lifecycle: RudpTransportState,
    session: Option<Weak<IceSession>>,
    channels: AHashMap<u16, Arc<RudpChannel>>,
    waiting: VecDeque<(Arc<RudpChannel>, ChannelStreams)>,
    next_channel: u16,
}

/// Multiplexes reliable channels over one ICE session.
///
/// Outbound opens run a STUN-shaped handshake that exchanges channel
/// numbers and initial sequences; data packets then travel under the
/// agreed channel numbers, which sit above the TURN range.
pub struct RudpTransport {
    settings: Arc<Settings>,
    observer: Arc<dyn RudpTransportObserver>,
    state: Mutex<TransportState>,
}

struct SessionBridge(Weak<RudpTransport>);

impl IceSessionObserver for SessionBridge {
    fn on_state_changed(&self, _: &Arc<IceSession>, state: IceSessionState) {
        if state == IceSessionState::Shutdown
            && let Some(transport) = self.0.upgrade()
        {
            transport.shutdown();
        }
    }

    fn on_data(&self, _: &Arc<IceSession>, bytes: &[u8]) {
        if let Some(transport) = self.0.upgrade() {
            transport.handle_session_data(bytes);
        }
    }
}

/// channel streams put their packets on the session.
struct ChannelWire {
    transport: Weak<RudpTransport>,
    local_channel: u16,
}

impl RudpStreamObserver for ChannelWire {
    fn on_state_changed(&self, _: &Arc<RudpChannelStream>, state: RudpStreamState) {
        if state == RudpStreamState::Shutdown
            && let Some(transport) = self.transport.upgrade()
        {
            let channel = {
                let state = transport.state.lock();
                state.channels.get(&self.local_channel).cloned()
            };

            if let Some(channel) = channel {
                channel.inner.lock().state = RudpChannelState::Shutdown;
            }
        }
    }

    fn on_send_packet(&self, _: &Arc<RudpChannelStream>, packet: &[u8]) -> bool {
        self.transport
            .upgrade()
            .map(|t| t.send_over_session(packet))
            .unwrap_or(false)
    }
}

/// open-handshake requester events.
struct OpenBridge {
    transport: Weak<RudpTransport>,
    local_channel: u16,
}

impl RequesterObserver for OpenBridge {
    fn on_send(&self, _: &Arc<StunRequester>, _: SocketAddr, packet: &[u8]) {
        if let Some(transport) = self.transport.upgrade() {
            transport.send_over_session(packet);
        }
    }

    fn on_response(
        &self,
        _: &Arc<StunRequester>,
        _: SocketAddr,
        message: &MessageReader<'_, '_>,
    ) {
        if let Some(transport) = self.transport.upgrade() {
            transport.on_open_response(self.local_channel, message);
        }
    }

    fn on_timed_out(&self, _: &Arc<StunRequester>) {
        if let Some(transport) = self.transport.upgrade() {
            transport.on_open_failed(self.local_channel);
        }
    }
}

impl RudpTransport {
    pub fn create(
        settings: Arc<Settings>,
        observer: Arc<dyn RudpTransportObserver>,
    ) -> Arc<Self> {
        let start = *RUDP_CHANNEL_RANGE.start()
            + (rand::thread_rng().r#gen::<u16>()
                % (*RUDP_CHANNEL_RANGE.end() - *RUDP_CHANNEL_RANGE.start()));

        Arc::new(Self {
            settings,
            observer,
            state: Mutex::new(TransportState {
                lifecycle: RudpTransportState::Ready,
                session: None,
                channels: AHashMap::new(),
                waiting: VecDeque::new(),
                next_channel: start,
            }),
        })
    }

    /// the observer adapter to hand to `IceSocket::create_session`.
    pub fn session_observer(self: &Arc<Self>) -> Arc<dyn IceSessionObserver> {
        Arc::new(SessionBridge(Arc::downgrade(self)))
    }

    /// bind the transport to the session it listens on.
    pub fn attach(self: &Arc<Self>, session: &Arc<IceSession>) {
        self.state.lock().session = Some(Arc::downgrade(session));
    }

    pub fn state(&self) -> RudpTransportState {
        self.state.lock().lifecycle
    }

    /// open a reliable channel towards the remote party.
    pub fn open_channel(self: &Arc<Self>) -> Option<(Arc<RudpChannel>, ChannelStreams)> {
        let local_channel = self.allocate_channel()?;
        let next_sequence = initial_sequence();

        let (send_writer, send_reader) = TransportStream::create();
        let (recv_writer, recv_reader) = TransportStream::create();

        let channel = Arc::new(RudpChannel {
            local_channel,
            inner: Mutex::new(ChannelInner {
                state: RudpChannelState::Connecting,
                remote_channel: None,
                stream: None,
                recv_writer: Some(recv_writer),
                send_reader: Some(send_reader),
                next_sequence,
                _open_requester: None,
            }),
        });

        self.state
            .lock()
            .channels
            .insert(local_channel, channel.clone());

        let info = ConnectionInfo {
            channel: local_channel,
            next_sequence,
            min_rtt_ms: 50,
        };

        let request = StunRequest::new(Method::ReliableChannelOpen(Kind::Request))
            .attribute(RequestAttr::ChannelNumber(local_channel))
            .attribute(RequestAttr::Data(
                serde_json::to_vec(&info).expect("connection info encodes"),
            ));

        // the destination address is nominal; the bridge routes over
        // the session.
        let requester = match StunRequester::create(
            &self.settings,
            StunRequesterOptions {
                server: "0.0.0.0:0".parse().expect("placeholder address"),
                request,
                variant: RfcVariant::Rfc5389,
                pattern: Some(open_pattern()),
            },
            Arc::new(OpenBridge {
                transport: Arc::downgrade(self),
                local_channel,
            }),
        ) {
            Ok(requester) => requester,
            Err(err) => {
                log::warn!("rudp channel open rejected: err={}", err);
                self.state.lock().channels.remove(&local_channel);
                return None;
            }
        };

        channel.inner.lock()._open_requester = Some(requester);

        log::debug!("rudp channel opening: local={:#06x}", local_channel);
        Some((
            channel,
            ChannelStreams {
                send: send_writer,
                receive: recv_reader,
            },
        ))
    }

    /// take the next remotely opened channel.
    pub fn accept_channel(&self) -> Option<(Arc<RudpChannel>, ChannelStreams)> {
        self.state.lock().waiting.pop_front()
    }

    pub fn shutdown(self: &Arc<Self>) {
        let channels = {
            let mut state = self.state.lock();
            if state.lifecycle == RudpTransportState::Shutdown {
                return;
            }

            state.lifecycle = RudpTransportState::Shutdown;
            state.waiting.clear();
            state.channels.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };

        for channel in channels {
            channel.shutdown(false);
        }

        self.observer
            .on_state_changed(self, RudpTransportState::Shutdown);
    }

    /// everything the session delivers lands here.
    pub fn handle_session_data(self: &Arc<Self>, bytes: &[u8]) {
        if bytes.len() < 4 {
            return;
        }

        // reliable channel numbers never look like a STUN header.
        if bytes[0] >> 6 == 0 {
            self.handle_stun(bytes);
            return;
        }

        let number = u16::from_be_bytes([bytes[0], bytes[1]]);
        let stream = {
            let state = self.state.lock();
            state
                .channels
                .get(&number)
                .and_then(|c| c.inner.lock().stream.clone())
        };

        match stream {
            Some(stream) => {
                if let Err(err) = stream.handle_packet_bytes(bytes, false) {
                    log::debug!("rudp packet rejected: channel={:#06x}, err={:?}", number, err);
                }
            }
            None => {
                log::debug!("rudp packet for unknown channel: channel={:#06x}", number);
            }
        }
    }

    fn handle_stun(self: &Arc<Self>, bytes: &[u8]) {
        let mut attributes = Attributes::default();
        let Ok(message) = MessageReader::decode(bytes, &mut attributes) else {
            return;
        };

        match message.method {
            Method::ReliableChannelOpen(Kind::Request) => self.handle_open_request(&message),
            _ => {
                crate::requester::StunRequesterManager::singleton()
                    .handle_message("0.0.0.0:0".parse().expect("placeholder address"), &message);
            }
        }
    }

    /// remote side opened a channel: allocate ours, wire the stream,
    /// answer with our parameters.
    fn handle_open_request(self: &Arc<Self>, message: &MessageReader<'_, '_>) {
        let Some(info) = message
            .get::<Data>()
            .and_then(|data| serde_json::from_slice::<ConnectionInfo>(data).ok())
        else {
            return;
        };

        let remote_channel = message.get::<ChannelNumber>().unwrap_or(info.channel);
        let Some(local_channel) = self.allocate_channel() else {
            return;
        };

        let next_sequence = initial_sequence();

        // answer with our side of the handshake; nothing is
        // registered until the reply is known to serialize, so a
        // retransmitted open starts over cleanly.
        let reply_info = ConnectionInfo {
            channel: local_channel,
            next_sequence,
            min_rtt_ms: info.min_rtt_ms,
        };

        let mut buf = BytesMut::with_capacity(128);
        let mut writer =
            MessageWriter::extend(Method::ReliableChannelOpen(Kind::Response), message, &mut buf);
        writer.append::<ChannelNumber>(local_channel);
        let reply_info_bytes = serde_json::to_vec(&reply_info).expect("connection info encodes");
        writer.append::<Data>(&reply_info_bytes);
        if let Err(err) = writer.flush(None) {
            log::warn!("rudp open response rejected: err={}", err);
            return;
        }

        let (send_writer, send_reader) = TransportStream::create();
        let (recv_writer, recv_reader) = TransportStream::create();

        let stream = RudpChannelStream::create(
            &self.settings,
            RudpStreamOptions {
                sending_channel: remote_channel,
                receiving_channel: local_channel,
                next_sequence_to_send: next_sequence,
                next_sequence_expecting: info.next_sequence,
                min_rtt: Duration::from_millis(info.min_rtt_ms.max(10)),
            },
            Arc::new(ChannelWire {
                transport: Arc::downgrade(self),
                local_channel,
            }),
        );

        stream.set_streams(recv_writer, send_reader);

        let channel = Arc::new(RudpChannel {
            local_channel,
            inner: Mutex::new(ChannelInner {
                state: RudpChannelState::Connected,
                remote_channel: Some(remote_channel),
                stream: Some(stream),
                recv_writer: None,
                send_reader: None,
                next_sequence,
                _open_requester: None,
            }),
        });

        {
            let mut state = self.state.lock();
            state.channels.insert(local_channel, channel.clone());
            state.waiting.push_back((
                channel,
                ChannelStreams {
                    send: send_writer,
                    receive: recv_reader,
                },
            ));
        }

        self.send_over_session(&buf);

        log::debug!(
            "rudp channel accepted: local={:#06x}, remote={:#06x}",
            local_channel,
            remote_channel
        );

        self.observer.on_channel_waiting(self);
    }

    fn on_open_response(self: &Arc<Self>, local_channel: u16, message: &MessageReader<'_, '_>) {
        if message.method != Method::ReliableChannelOpen(Kind::Response) {
            self.on_open_failed(local_channel);
            return;
        }

        let Some(info) = message
            .get::<Data>()
            .and_then(|data| serde_json::from_slice::<ConnectionInfo>(data).ok())
        else {
            self.on_open_failed(local_channel);
            return;
        };

        let remote_channel = message.get::<ChannelNumber>().unwrap_or(info.channel);
        let channel = {
            let state = self.state.lock();
            state.channels.get(&local_channel).cloned()
        };

        let Some(channel) = channel else {
            return;
        };

        let (stream, recv_writer, send_reader) = {
            let mut inner = channel.inner.lock();
            let (Some(recv_writer), Some(send_reader)) =
                (inner.recv_writer.take(), inner.send_reader.take())
            else {
                return;
            };

            let stream = RudpChannelStream::create(
                &self.settings,
                RudpStreamOptions {
                    sending_channel: remote_channel,
                    receiving_channel: local_channel,
                    next_sequence_to_send: inner.next_sequence,
                    next_sequence_expecting: info.next_sequence,
                    min_rtt: Duration::from_millis(info.min_rtt_ms.max(10)),
                },
                Arc::new(ChannelWire {
                    transport: Arc::downgrade(self),
                    local_channel,
                }),
            );

            inner.remote_channel = Some(remote_channel);
            inner.stream = Some(stream.clone());
            inner.state = RudpChannelState::Connected;
            inner._open_requester = None;
            (stream, recv_writer, send_reader)
        };

        stream.set_streams(recv_writer, send_reader);
        log::debug!(
            "rudp channel connected: local={:#06x}, remote={:#06x}",
            local_channel,
            remote_channel
        );
    }

    fn on_open_failed(self: &Arc<Self>, local_channel: u16) {
        log::debug!("rudp channel open failed: local={:#06x}", local_channel);

        let channel = {
            let mut state = self.state.lock();
            state.channels.remove(&local_channel)
        };

        if let Some(channel) = channel {
            channel.inner.lock().state = RudpChannelState::Shutdown;
        }
    }

    fn allocate_channel(&self) -> Option<u16> {
        let mut state = self.state.lock();
        if state.lifecycle != RudpTransportState::Ready {
            return None;
        }

        let span = *RUDP_CHANNEL_RANGE.end() - *RUDP_CHANNEL_RANGE.start() + 1;
        for _ in 0..span {
            let candidate = state.next_channel;
            state.next_channel = if candidate == *RUDP_CHANNEL_RANGE.end() {
                *RUDP_CHANNEL_RANGE.start()
            } else {
                candidate + 1
            };

            if !state.channels.contains_key(&candidate) {
                return Some(candidate);
            }
        }

        None
    }

    fn send_over_session(&self, bytes: &[u8]) -> bool {
        let session = {
            let state = self.state.lock();
            state.session.as_ref().and_then(|s| s.upgrade())
        };

        match session {
            Some(session) => session.send_packet(bytes),
            None => false,
        }
    }
}

fn initial_sequence() -> u64 {
    // keep clear of zero and leave the full 48-bit space ahead.
    (rand::thread_rng().r#gen::<u32>() as u64).max(1)
}

/// opens answer quickly over an established session.
fn open_pattern() -> BackOffPattern {
    BackOffPattern {
        max_attempts: 5,
        attempt_timeouts: vec![Duration::from_millis(500)],
        attempt_multiplier: 2.0,
        max_attempt_timeout: Duration::from_secs(4),
        retry_after: vec![Duration::ZERO],
        retry_multiplier: 1.0,
        max_retry_after: Duration::ZERO,
    }
}
