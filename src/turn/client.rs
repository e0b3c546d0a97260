use bytes::BytesMut;
use parking_lot::Mutex;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use ahash::AHashSet;

use codec::attribute::{
    AlternateServer, Data, ErrKind, ErrorCode, Lifetime, MobilityTicket, Transport,
    XorMappedAddress, XorPeerAddress, XorRelayedAddress,
};
use codec::{Attributes, ChannelData, Kind, MessageReader, MessageWriter, Method, RfcVariant};

use crate::backoff::BackOffPattern;
use crate::config::{ForcedTransport, Settings};
use crate::dns::{SrvRecord, SrvResolver};
use crate::error::Reason;
use crate::requester::{
    RequestAttr, RequesterObserver, StunRequest, StunRequester, StunRequesterOptions,
};
use crate::uri::parse_server_uri;

use super::allocation::{Channels, Permissions};

pub const TURN_DEFAULT_PORT: u16 = 3478;

/// delay between starting consecutive server probes, so a healthy
/// first server wins before the rest even fire.
const PROBE_STAGGER: Duration = Duration::from_millis(500);

/// inbound packets that match nothing before the client gives up on
/// the link entirely.
const MAX_UNKNOWN_PACKETS: u32 = 50;

/// consecutive permission installation failures tolerated.
const MAX_PERMISSION_FAILURES: u32 = 8;

/// outbound frames the tcp write ring may hold before sends to the
/// relay turn lossy.
const TCP_RING_FRAMES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Pending,
    Ready,
    ShuttingDown,
    Shutdown,
}

/// Events from a [`TurnClient`].
pub trait TurnObserver: Send + Sync {
    fn on_state_changed(&self, client: &Arc<TurnClient>, state: TurnState);

    /// relayed data arrived from `peer`.
    fn on_received(&self, client: &Arc<TurnClient>, peer: SocketAddr, bytes: &[u8]);

    /// transmit `packet` to the server over the caller's UDP socket.
    /// The client owns no UDP socket of its own so it can share
    /// whatever socket its candidates live on.
    fn on_send(&self, client: &Arc<TurnClient>, destination: SocketAddr, packet: &[u8]) -> bool;

    /// the tcp write ring drained below its low-water mark after
    /// sends were dropped.
    fn on_write_ready(&self, _client: &Arc<TurnClient>) {}
}

pub struct TurnOptions {
    /// `turn:` URIs or bare `host[:port]` references.
    pub servers: Vec<String>,
    /// pre-resolved SRV answers per transport.
    pub srv_udp: Option<Vec<SrvRecord>>,
    pub srv_tcp: Option<Vec<SrvRecord>>,
    pub username: String,
    pub password: String,
    /// allocation lifetime to request, seconds.
    pub lifetime: Option<u32>,
    pub pattern: Option<BackOffPattern>,
}

/// the refresh schedule is short and aggressive: a relay that stops
/// answering refreshes is a relay about to drop the allocation.
pub fn refresh_pattern() -> BackOffPattern {
    BackOffPattern {
        max_attempts: 3,
        attempt_timeouts: vec![Duration::from_millis(500)],
        attempt_multiplier: 2.0,
        max_attempt_timeout: Duration::from_secs(2),
        retry_after: vec![Duration::ZERO],
        retry_multiplier: 1.0,
        max_retry_after: Duration::ZERO,
    }
}

/// bounded lossy pipe into a tcp connection's writer task.
#[derive(Clone)]
pub(crate) struct TcpLink {
    tx: mpsc::Sender<Vec<u8>>,
    blocked: Arc<AtomicBool>,
}

impl TcpLink {
    /// queue a frame; false means the ring was full and the frame was
    /// dropped (UDP-equivalent loss semantics).
    fn send(&self, bytes: Vec<u8>) -> bool {
        match self.tx.try_send(bytes) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.blocked.store(true, Ordering::SeqCst);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Clone)]
enum Via {
    Udp,
    Tcp(TcpLink),
}

struct Probe {
    server: SocketAddr,
    transport: Transport,
    start_at: Instant,
    started: bool,
    failed: bool,
    requester: Option<Arc<StunRequester>>,
    link: Option<TcpLink>,
}

struct ActiveServer {
    server: SocketAddr,
    transport: Transport,
    link: Option<TcpLink>,
    relayed: SocketAddr,
    reflexive: Option<SocketAddr>,
    lifetime: u32,
    refresh_at: Instant,
    refresh_in_flight: bool,
    mobility_ticket: Option<Vec<u8>>,
    realm: Option<String>,
    nonce: Option<String>,
    permissions: Permissions,
    channels: Channels,
    /// keeps auxiliary requesters alive until they resolve.
    aux: Vec<Arc<StunRequester>>,
    permission_failures: u32,
}

struct ClientState {
    lifecycle: TurnState,
    reason: Option<Reason>,
    probes: Vec<Probe>,
    active: Option<ActiveServer>,
    contacted: AHashSet<IpAddr>,
    redirected: bool,
    unknown_count: u32,
}

/// A TURN relay client.
///
/// Probes the configured servers (staggered, both transports unless a
/// setting forces one), keeps the winning allocation refreshed,
/// installs permissions for every peer it talks to, upgrades busy
/// peers to channel bindings, and relays inbound data back to its
/// observer.
pub struct TurnClient {
    settings: Arc<Settings>,
    username: String,
    password: String,
    requested_lifetime: Option<u32>,
    pattern: Option<BackOffPattern>,
    observer: Arc<dyn TurnObserver>,
    state: Mutex<ClientState>,
}

struct RequestBridge {
    client: Weak<TurnClient>,
    via: Via,
    role: Role,
}

#[derive(Clone)]
enum Role {
    Allocate { probe: usize },
    Refresh,
    Permission { ips: Vec<IpAddr> },
    ChannelBind { peer: SocketAddr },
}

impl RequesterObserver for RequestBridge {
    fn on_send(&self, _: &Arc<StunRequester>, destination: SocketAddr, packet: &[u8]) {
        if let Some(client) = self.client.upgrade() {
            client.transmit(&self.via, destination, packet);
        }
    }

    fn on_response(
        &self,
        requester: &Arc<StunRequester>,
        _from: SocketAddr,
        message: &MessageReader<'_, '_>,
    ) {
        let Some(client) = self.client.upgrade() else {
            return;
        };

        match &self.role {
            Role::Allocate { probe } => client.on_allocate_response(*probe, requester, message),
            Role::Refresh => client.on_refresh_response(requester, message),
            Role::Permission { ips } => client.on_permission_response(ips, requester, message),
            Role::ChannelBind { peer } => client.on_bind_response(*peer, requester, message),
        }
    }

    fn on_timed_out(&self, requester: &Arc<StunRequester>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };

        match &self.role {
            Role::Allocate { probe } => {
                // a stream transport that stops answering is its own
                // failure class.
                let reason = match self.via {
                    Via::Tcp(_) => Reason::ReliableServerNotResponding,
                    Via::Udp => Reason::RequestTimeout,
                };

                client.on_probe_failed(*probe, reason)
            }
            Role::Refresh => client.fail(Reason::RefreshTimeout),
            Role::Permission { .. } => client.on_permission_failed(requester, false),
            Role::ChannelBind { peer } => client.on_bind_failed(*peer, requester),
        }
    }
}

impl TurnClient {
    pub fn create(
        settings: Arc<Settings>,
        resolver: Arc<dyn SrvResolver>,
        options: TurnOptions,
        observer: Arc<dyn TurnObserver>,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            settings,
            username: options.username.clone(),
            password: options.password.clone(),
            requested_lifetime: options.lifetime,
            pattern: options.pattern.clone(),
            observer,
            state: Mutex::new(ClientState {
                lifecycle: TurnState::Pending,
                reason: None,
                probes: Vec::new(),
                active: None,
                contacted: AHashSet::new(),
                redirected: false,
                unknown_count: 0,
            }),
        });

        // resolve servers off to the side, then hand the probe list to
        // the driver.
        let weak = Arc::downgrade(&client);
        tokio::spawn(async move {
            let force = {
                let Some(client) = weak.upgrade() else { return };
                client.settings.force_turn_transport
            };

            let mut probes = Vec::new();
            let now = Instant::now();

            let udp = match options.srv_udp {
                Some(records) => records,
                None if force != Some(ForcedTransport::Tcp) => {
                    resolve_turn(&resolver, &options.servers, "_udp").await
                }
                None => Vec::new(),
            };

            let tcp = match options.srv_tcp {
                Some(records) => records,
                None if force != Some(ForcedTransport::Udp) => {
                    resolve_turn(&resolver, &options.servers, "_tcp").await
                }
                None => Vec::new(),
            };

            let mut index = 0usize;
            let mut push = |server: SocketAddr, transport: Transport| {
                probes.push(Probe {
                    server,
                    transport,
                    start_at: now + PROBE_STAGGER * index as u32,
                    started: false,
                    failed: false,
                    requester: None,
                    link: None,
                });

                index += 1;
            };

            if force != Some(ForcedTransport::Tcp) {
                for record in udp.iter() {
                    for ip in record.ips.iter() {
                        push(SocketAddr::new(*ip, record.port), Transport::UDP);
                    }
                }
            }

            if force != Some(ForcedTransport::Udp) {
                for record in tcp.iter() {
                    for ip in record.ips.iter() {
                        push(SocketAddr::new(*ip, record.port), Transport::TCP);
                    }
                }
            }

            let Some(client) = weak.upgrade() else { return };
            if probes.is_empty() {
                client.fail(Reason::DnsLookupFailure);
                return;
            }

            client.state.lock().probes = probes;
            client.drive();
        });

        client
    }

    pub fn state(&self) -> (TurnState, Option<Reason>) {
        let state = self.state.lock();
        (state.lifecycle, state.reason)
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().lifecycle == TurnState::Ready
    }

    /// the relayed transport address, once allocated.
    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.state.lock().active.as_ref().map(|a| a.relayed)
    }

    /// the server-reflexive address the relay observed, once known.
    pub fn reflexive_address(&self) -> Option<SocketAddr> {
        self.state.lock().active.as_ref().and_then(|a| a.reflexive)
    }

    pub fn active_server(&self) -> Option<SocketAddr> {
        self.state.lock().active.as_ref().map(|a| a.server)
    }

    /// whether `from` is a server this client is talking to.
    pub fn recognizes_server(&self, from: SocketAddr) -> bool {
        let state = self.state.lock();
        state.active.as_ref().map(|a| a.server) == Some(from)
            || state.probes.iter().any(|p| p.server == from)
    }

    /// send application data to `peer` through the relay.
    ///
    /// Lossy by design: returns false when the data was dropped
    /// (no allocation, egress ACL, or a full tcp ring).
    pub fn send_to(self: &Arc<Self>, peer: SocketAddr, bytes: &[u8]) -> bool {
        let acl = &self.settings.only_allow_turn_peers;
        if !acl.is_empty() && !acl.contains(&peer.ip()) {
            log::debug!("turn egress denied by acl: peer={:?}", peer);
            return false;
        }

        enum Out {
            Channel(u16, Via),
            Indication(Via),
            Parked,
        }

        let out = {
            let mut state = self.state.lock();
            if state.lifecycle != TurnState::Ready {
                return false;
            }

            let Some(active) = state.active.as_mut() else {
                return false;
            };

            active.channels.note_traffic(peer);

            if let Some(number) = active.channels.bound_number(&peer) {
                Out::Channel(number, active.via())
            } else if active.permissions.is_installed(&peer.ip()) {
                Out::Indication(active.via())
            } else {
                active.permissions.park(peer, bytes.to_vec());
                Out::Parked
            }
        };

        match out {
            Out::Channel(number, via) => {
                let mut buf = BytesMut::with_capacity(bytes.len() + 4);
                ChannelData {
                    number,
                    bytes,
                }
                .encode(&mut buf);

                self.transmit_to_active(&via, &buf)
            }
            Out::Indication(via) => match self.send_indication(peer, bytes) {
                Ok(buf) => self.transmit_to_active(&via, &buf),
                Err(err) => {
                    log::warn!("turn send indication rejected: peer={:?}, err={}", peer, err);
                    false
                }
            },
            Out::Parked => {
                // data waits for the permission; get one installing.
                self.maintain();
                true
            }
        }
    }

    /// process a packet that arrived from the relay server; consumed
    /// iff this client recognizes it.
    pub fn handle_packet(self: &Arc<Self>, from: SocketAddr, bytes: &[u8]) -> bool {
        if !self.recognizes_server(from) || bytes.len() < 4 {
            return false;
        }

        // channel data framing.
        if matches!(bytes[0] >> 6, 1 | 2) {
            let Ok(data) = ChannelData::decode(bytes) else {
                self.count_unknown();
                return true;
            };

            let peer = {
                let state = self.state.lock();
                state
                    .active
                    .as_ref()
                    .and_then(|a| a.channels.peer_of(data.number()))
            };

            match peer {
                Some(peer) => self.observer.on_received(self, peer, data.as_bytes()),
                None => self.count_unknown(),
            }

            return true;
        }

        let mut attributes = Attributes::default();
        let Ok(message) = MessageReader::decode(bytes, &mut attributes) else {
            self.count_unknown();
            return true;
        };

        if message.method == Method::DataIndication {
            match (message.get::<XorPeerAddress>(), message.get::<Data>()) {
                (Some(peer), Some(data)) => self.observer.on_received(self, peer, data),
                _ => self.count_unknown(),
            }

            return true;
        }

        if !crate::requester::StunRequesterManager::singleton().handle_message(from, &message) {
            self.count_unknown();
        }

        true
    }

    /// user-initiated clean teardown.
    pub fn shutdown(self: &Arc<Self>) {
        let (deallocate, probes) = {
            let mut state = self.state.lock();
            if matches!(
                state.lifecycle,
                TurnState::ShuttingDown | TurnState::Shutdown
            ) {
                return;
            }

            state.lifecycle = TurnState::ShuttingDown;
            let deallocate = state.active.as_ref().map(|a| (a.via(), a.realm.clone(), a.nonce.clone()));
            let probes: Vec<_> = state
                .probes
                .iter_mut()
                .filter_map(|p| p.requester.take())
                .collect();

            (deallocate, probes)
        };

        self.observer.on_state_changed(self, TurnState::ShuttingDown);

        for requester in probes {
            requester.cancel();
        }

        // best effort lifetime-zero refresh so the relay frees the
        // allocation immediately.
        if let Some((via, realm, nonce)) = deallocate {
            let mut request = StunRequest::new(Method::Refresh(Kind::Request))
                .credentials(&self.username, &self.password)
                .attribute(RequestAttr::Lifetime(0));
            request.realm = realm;
            request.nonce = nonce;

            let token: [u8; 12] = rand::random();
            match request.to_packet(&token, RfcVariant::Rfc5766Turn) {
                Ok(packet) => {
                    if let Some(server) = self.active_server() {
                        self.transmit(&via, server, &packet);
                    }
                }
                Err(err) => {
                    log::warn!("turn deallocation skipped: err={}", err);
                }
            }
        }

        self.finish(None);
    }

    fn fail(self: &Arc<Self>, reason: Reason) {
        {
            let state = self.state.lock();
            if matches!(state.lifecycle, TurnState::Shutdown) {
                return;
            }
        }

        log::warn!("turn client failed: reason={}", reason);
        self.finish(Some(reason));
    }

    fn finish(self: &Arc<Self>, reason: Option<Reason>) {
        let cancelled = {
            let mut state = self.state.lock();
            if state.lifecycle == TurnState::Shutdown {
                return;
            }

            state.lifecycle = TurnState::Shutdown;
            state.reason = reason;

            let mut cancelled: Vec<Arc<StunRequester>> = Vec::new();
            for probe in state.probes.iter_mut() {
                if let Some(requester) = probe.requester.take() {
                    cancelled.push(requester);
                }
            }

            if let Some(active) = state.active.as_mut() {
                cancelled.append(&mut active.aux);
                active.permissions.clear();
                active.channels.clear();
            }

            state.active = None;
            state.probes.clear();
            cancelled
        };

        for requester in cancelled {
            requester.cancel();
        }

        self.observer.on_state_changed(self, TurnState::Shutdown);
    }

    /// spawn the maintenance driver; re-armed cheaply, exits with the
    /// client.
    fn drive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let Some(client) = weak.upgrade() else {
                    return;
                };

                if client.state.lock().lifecycle == TurnState::Shutdown {
                    return;
                }

                client.maintain();
            }
        });
    }

    /// one maintenance pass: probe activation, refresh scheduling,
    /// permission and channel upkeep.
    fn maintain(self: &Arc<Self>) {
        let now = Instant::now();

        // probe activation.
        let to_start = {
            let mut state = self.state.lock();
            if state.lifecycle != TurnState::Pending {
                Vec::new()
            } else {
                let mut to_start = Vec::new();
                for (index, probe) in state.probes.iter_mut().enumerate() {
                    if !probe.started && !probe.failed && now >= probe.start_at {
                        probe.started = true;
                        to_start.push((index, probe.server, probe.transport));
                    }
                }

                to_start
            }
        };

        for (index, server, transport) in to_start {
            self.start_probe(index, server, transport);
        }

        // allocation upkeep.
        let refresh = {
            let mut state = self.state.lock();
            if state.lifecycle != TurnState::Ready {
                None
            } else if let Some(active) = state.active.as_mut() {
                if !active.refresh_in_flight && now >= active.refresh_at {
                    active.refresh_in_flight = true;
                    Some((active.via(), active.server, active.realm.clone(), active.nonce.clone(), active.mobility_ticket.clone()))
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some((via, server, realm, nonce, ticket)) = refresh {
            self.start_refresh(via, server, realm, nonce, ticket);
        }

        self.maintain_permissions();
        self.maintain_channels();
    }

    fn start_probe(self: &Arc<Self>, index: usize, server: SocketAddr, transport: Transport) {
        log::debug!(
            "turn probe starting: server={:?}, transport={:?}",
            server,
            transport
        );

        self.state.lock().contacted.insert(server.ip());

        match transport {
            Transport::UDP => self.start_allocate(index, server, Via::Udp),
            Transport::TCP => {
                let weak = Arc::downgrade(self);
                tokio::spawn(async move {
                    let link = connect_tcp(weak.clone(), server).await;
                    let Some(client) = weak.upgrade() else { return };

                    match link {
                        Err(err) => {
                            log::debug!(
                                "turn tcp connect failed: server={:?}, err={}",
                                server,
                                err
                            );
                            client.on_probe_failed(index, Reason::UnexpectedSocketFailure);
                        }
                        Ok(link) => {
                            if let Some(probe) = client.state.lock().probes.get_mut(index) {
                                probe.link = Some(link.clone());
                            }

                            client.start_allocate(index, server, Via::Tcp(link));
                        }
                    }
                });
            }
        }
    }

    fn start_allocate(self: &Arc<Self>, index: usize, server: SocketAddr, via: Via) {
        let mut request = StunRequest::new(Method::Allocate(Kind::Request))
            .credentials(&self.username, &self.password)
            .attribute(RequestAttr::RequestedTransport(Transport::UDP));

        if let Some(lifetime) = self.requested_lifetime {
            request = request.attribute(RequestAttr::Lifetime(lifetime));
        }

        let requester = match StunRequester::create(
            &self.settings,
            StunRequesterOptions {
                server,
                request,
                variant: RfcVariant::Rfc5766Turn,
                pattern: self.pattern.clone(),
            },
            Arc::new(RequestBridge {
                client: Arc::downgrade(self),
                via,
                role: Role::Allocate { probe: index },
            }),
        ) {
            Ok(requester) => requester,
            Err(err) => {
                log::warn!("turn allocate request rejected: err={}", err);
                self.on_probe_failed(index, Reason::IllegalUsage);
                return;
            }
        };

        let mut state = self.state.lock();
        if state.lifecycle != TurnState::Pending {
            drop(state);
            requester.cancel();
            return;
        }

        if let Some(probe) = state.probes.get_mut(index) {
            probe.requester = Some(requester);
        }
    }

    fn on_allocate_response(
        self: &Arc<Self>,
        index: usize,
        requester: &Arc<StunRequester>,
        message: &MessageReader<'_, '_>,
    ) {
        if message.method == Method::Allocate(Kind::Error) {
            // a redirect is worth following exactly once, and never
            // back to a server already contacted.
            if let Some(error) = message.get::<ErrorCode>()
                && error.is(ErrKind::TryAlternate)
            {
                if message.get_all::<AlternateServer>().count() > 1 {
                    self.fail(Reason::RedirectOnMultipleAlternateIps);
                    return;
                }

                if let Some(alternate) = message.get::<AlternateServer>() {
                    let accept = {
                        let mut state = self.state.lock();
                        if state.redirected || state.contacted.contains(&alternate.ip()) {
                            false
                        } else {
                            state.redirected = true;
                            true
                        }
                    };

                    if !accept {
                        self.on_probe_failed(index, Reason::RedirectToSameIp);
                        return;
                    }

                    let transport = {
                        let state = self.state.lock();
                        state
                            .probes
                            .get(index)
                            .map(|p| p.transport)
                            .unwrap_or(Transport::UDP)
                    };

                    log::debug!("turn redirect accepted: alternate={:?}", alternate);
                    let new_index = {
                        let mut state = self.state.lock();
                        state.probes.push(Probe {
                            server: alternate,
                            transport,
                            start_at: Instant::now(),
                            started: true,
                            failed: false,
                            requester: None,
                            link: None,
                        });

                        state.probes.len() - 1
                    };

                    self.start_probe(new_index, alternate, transport);
                    return;
                }
            }

            self.on_probe_failed(index, Reason::TooManyErrors);
            return;
        }

        let Some(relayed) = message.get::<XorRelayedAddress>() else {
            self.on_probe_failed(index, Reason::TooManyErrors);
            return;
        };

        let lifetime = message.get::<Lifetime>().unwrap_or(600);
        let reflexive = message.get::<XorMappedAddress>();
        let ticket = message.get::<MobilityTicket>().map(|t| t.to_vec());

        // the 401 dance stashed realm and nonce inside the request;
        // keep them for every follow-up transaction.
        let snapshot = requester.request();

        let (became_active, cancelled) = {
            let mut state = self.state.lock();
            if state.lifecycle != TurnState::Pending || state.active.is_some() {
                (false, Vec::new())
            } else {
                let (transport, link) = state
                    .probes
                    .get_mut(index)
                    .map(|p| (p.transport, p.link.take()))
                    .unwrap_or((Transport::UDP, None));

                let mut cancelled = Vec::new();
                for (i, probe) in state.probes.iter_mut().enumerate() {
                    if i != index
                        && let Some(requester) = probe.requester.take()
                    {
                        cancelled.push(requester);
                    }
                }

                state.active = Some(ActiveServer {
                    server: requester.server(),
                    transport,
                    link,
                    relayed,
                    reflexive,
                    lifetime,
                    refresh_at: Instant::now() + refresh_after(lifetime),
                    refresh_in_flight: false,
                    mobility_ticket: ticket,
                    realm: snapshot.realm.clone(),
                    nonce: snapshot.nonce.clone(),
                    permissions: Permissions::default(),
                    channels: Channels::default(),
                    aux: Vec::new(),
                    permission_failures: 0,
                });

                state.lifecycle = TurnState::Ready;
                state.probes.clear();
                (true, cancelled)
            }
        };

        for other in cancelled {
            other.cancel();
        }

        if became_active {
            log::info!(
                "turn allocation ready: server={:?}, relayed={:?}, lifetime={}",
                requester.server(),
                relayed,
                lifetime
            );

            self.observer.on_state_changed(self, TurnState::Ready);
        }
    }

    fn on_probe_failed(self: &Arc<Self>, index: usize, reason: Reason) {
        let all_failed = {
            let mut state = self.state.lock();
            if state.lifecycle != TurnState::Pending {
                return;
            }

            if let Some(probe) = state.probes.get_mut(index) {
                probe.failed = true;
                probe.requester = None;
            }

            !state.probes.is_empty() && state.probes.iter().all(|p| p.failed)
        };

        if all_failed {
            self.fail(reason);
        }
    }

    fn start_refresh(
        self: &Arc<Self>,
        via: Via,
        server: SocketAddr,
        realm: Option<String>,
        nonce: Option<String>,
        ticket: Option<Vec<u8>>,
    ) {
        log::debug!("turn refresh: server={:?}", server);

        let mut request = StunRequest::new(Method::Refresh(Kind::Request))
            .credentials(&self.username, &self.password);
        request.realm = realm;
        request.nonce = nonce;

        if let Some(lifetime) = self.requested_lifetime {
            request = request.attribute(RequestAttr::Lifetime(lifetime));
        }

        if let Some(ticket) = ticket {
            request = request.attribute(RequestAttr::MobilityTicket(ticket));
        }

        let requester = match StunRequester::create(
            &self.settings,
            StunRequesterOptions {
                server,
                request,
                variant: RfcVariant::Rfc5766Turn,
                pattern: Some(refresh_pattern()),
            },
            Arc::new(RequestBridge {
                client: Arc::downgrade(self),
                via,
                role: Role::Refresh,
            }),
        ) {
            Ok(requester) => requester,
            Err(err) => {
                log::warn!("turn refresh request rejected: err={}", err);
                if let Some(active) = self.state.lock().active.as_mut() {
                    // try again on the next maintenance pass.
                    active.refresh_in_flight = false;
                }

                return;
            }
        };

        if let Some(active) = self.state.lock().active.as_mut() {
            active.aux.push(requester);
        }
    }

    fn on_refresh_response(
        self: &Arc<Self>,
        requester: &Arc<StunRequester>,
        message: &MessageReader<'_, '_>,
    ) {
        if message.method == Method::Refresh(Kind::Error) {
            // refresh rejected outright: the allocation is gone.
            self.fail(Reason::RefreshTimeout);
            return;
        }

        let lifetime = message.get::<Lifetime>();
        let ticket = message.get::<MobilityTicket>().map(|t| t.to_vec());
        let snapshot = requester.request();

        let mut state = self.state.lock();
        if let Some(active) = state.active.as_mut() {
            if let Some(lifetime) = lifetime {
                active.lifetime = lifetime;
            }

            if ticket.is_some() {
                active.mobility_ticket = ticket;
            }

            if snapshot.realm.is_some() {
                active.realm = snapshot.realm;
                active.nonce = snapshot.nonce;
            }

            active.refresh_in_flight = false;
            active.refresh_at = Instant::now() + refresh_after(active.lifetime);
            active.aux.retain(|r| !Arc::ptr_eq(r, requester));

            log::debug!(
                "turn allocation refreshed: lifetime={}, next={:?}",
                active.lifetime,
                active.refresh_at
            );
        }
    }

    fn maintain_permissions(self: &Arc<Self>) {
        let start = {
            let mut state = self.state.lock();
            if state.lifecycle != TurnState::Ready {
                return;
            }

            let Some(active) = state.active.as_mut() else {
                return;
            };

            if !active.permissions.needs_refresh(Instant::now()) {
                return;
            }

            let ips = active.permissions.refresh_set();
            if ips.is_empty() {
                return;
            }

            active.permissions.set_in_flight(true);
            (
                active.via(),
                active.server,
                active.realm.clone(),
                active.nonce.clone(),
                ips,
            )
        };

        let (via, server, realm, nonce, ips) = start;

        log::debug!("turn create permission: peers={:?}", ips);

        let mut request = StunRequest::new(Method::CreatePermission(Kind::Request))
            .credentials(&self.username, &self.password);
        request.realm = realm;
        request.nonce = nonce;

        for ip in ips.iter() {
            request = request.attribute(RequestAttr::XorPeerAddress(SocketAddr::new(*ip, 0)));
        }

        let requester = match StunRequester::create(
            &self.settings,
            StunRequesterOptions {
                server,
                request,
                variant: RfcVariant::Rfc5766Turn,
                pattern: Some(refresh_pattern()),
            },
            Arc::new(RequestBridge {
                client: Arc::downgrade(self),
                via,
                role: Role::Permission { ips },
            }),
        ) {
            Ok(requester) => requester,
            Err(err) => {
                log::warn!("turn permission request rejected: err={}", err);
                if let Some(active) = self.state.lock().active.as_mut() {
                    active.permissions.set_in_flight(false);
                }

                return;
            }
        };

        if let Some(active) = self.state.lock().active.as_mut() {
            active.aux.push(requester);
        }
    }

    fn on_permission_response(
        self: &Arc<Self>,
        ips: &[IpAddr],
        requester: &Arc<StunRequester>,
        message: &MessageReader<'_, '_>,
    ) {
        if message.method == Method::CreatePermission(Kind::Error) {
            let capacity = message
                .get::<ErrorCode>()
                .map(|e| e.is(ErrKind::InsufficientCapacity))
                .unwrap_or(false);

            self.on_permission_failed(requester, capacity);
            return;
        }

        let (released, via) = {
            let mut state = self.state.lock();
            match state.active.as_mut() {
                Some(active) => {
                    active.permission_failures = 0;
                    active.aux.retain(|r| !Arc::ptr_eq(r, requester));
                    let released = active.permissions.installed_now(ips, Instant::now());
                    (released, active.via())
                }
                None => return,
            }
        };

        // parked data is clear to go now.
        for (peer, bytes) in released {
            match self.send_indication(peer, &bytes) {
                Ok(buf) => {
                    self.transmit_to_active(&via, &buf);
                }
                Err(err) => {
                    log::warn!("turn send indication rejected: peer={:?}, err={}", peer, err);
                }
            }
        }
    }

    fn on_permission_failed(self: &Arc<Self>, requester: &Arc<StunRequester>, capacity: bool) {
        let too_many = {
            let mut state = self.state.lock();
            match state.active.as_mut() {
                Some(active) => {
                    active.aux.retain(|r| !Arc::ptr_eq(r, requester));
                    active.permissions.set_in_flight(false);
                    if capacity {
                        // the server told us the batch was too big.
                        active.permissions.shrink_capacity();
                    } else {
                        active.permission_failures += 1;
                    }

                    active.permission_failures >= MAX_PERMISSION_FAILURES
                }
                None => false,
            }
        };

        if too_many {
            self.fail(Reason::TooManyErrors);
        }
    }

    fn maintain_channels(self: &Arc<Self>) {
        let batch = {
            let mut state = self.state.lock();
            if state.lifecycle != TurnState::Ready {
                return;
            }

            let Some(active) = state.active.as_mut() else {
                return;
            };

            let now = Instant::now();
            let mut work = Vec::new();

            for peer in active.channels.due_for_binding() {
                if let Some(number) = active.channels.allocate_number() {
                    active.channels.bind_started(peer, number);
                    work.push((peer, number));
                }
            }

            for (peer, number) in active.channels.due_for_refresh(now) {
                active.channels.refresh_started(peer);
                work.push((peer, number));
            }

            if work.is_empty() {
                return;
            }

            (
                active.via(),
                active.server,
                active.realm.clone(),
                active.nonce.clone(),
                work,
            )
        };

        let (via, server, realm, nonce, work) = batch;

        for (peer, number) in work {
            log::debug!("turn channel bind: peer={:?}, number={:#06x}", peer, number);

            let mut request = StunRequest::new(Method::ChannelBind(Kind::Request))
                .credentials(&self.username, &self.password)
                .attribute(RequestAttr::ChannelNumber(number))
                .attribute(RequestAttr::XorPeerAddress(peer));
            request.realm = realm.clone();
            request.nonce = nonce.clone();

            let requester = match StunRequester::create(
                &self.settings,
                StunRequesterOptions {
                    server,
                    request,
                    variant: RfcVariant::Rfc5766Turn,
                    pattern: Some(refresh_pattern()),
                },
                Arc::new(RequestBridge {
                    client: Arc::downgrade(self),
                    via: via.clone(),
                    role: Role::ChannelBind { peer },
                }),
            ) {
                Ok(requester) => requester,
                Err(err) => {
                    log::warn!("turn channel bind rejected: peer={:?}, err={}", peer, err);
                    if let Some(active) = self.state.lock().active.as_mut() {
                        active.channels.bind_failed(peer);
                    }

                    continue;
                }
            };

            if let Some(active) = self.state.lock().active.as_mut() {
                active.aux.push(requester);
            }
        }
    }

    fn on_bind_response(
        self: &Arc<Self>,
        peer: SocketAddr,
        requester: &Arc<StunRequester>,
        message: &MessageReader<'_, '_>,
    ) {
        if message.method == Method::ChannelBind(Kind::Error) {
            self.on_bind_failed(peer, requester);
            return;
        }

        let mut state = self.state.lock();
        if let Some(active) = state.active.as_mut() {
            active.aux.retain(|r| !Arc::ptr_eq(r, requester));
            active.channels.bind_confirmed(peer, Instant::now());
            log::debug!("turn channel bound: peer={:?}", peer);
        }
    }

    fn on_bind_failed(self: &Arc<Self>, peer: SocketAddr, requester: &Arc<StunRequester>) {
        let mut state = self.state.lock();
        if let Some(active) = state.active.as_mut() {
            active.aux.retain(|r| !Arc::ptr_eq(r, requester));
            active.channels.bind_failed(peer);
        }
    }

    fn send_indication(&self, peer: SocketAddr, bytes: &[u8]) -> Result<BytesMut, codec::Error> {
        let token: [u8; 12] = rand::random();
        let mut buf = BytesMut::with_capacity(bytes.len() + 48);
        let mut writer = MessageWriter::new(Method::SendIndication, &token, &mut buf);
        writer.append::<XorPeerAddress>(peer);
        writer.append::<Data>(bytes);
        writer.flush(None)?;
        Ok(buf)
    }

    fn transmit_to_active(self: &Arc<Self>, via: &Via, bytes: &[u8]) -> bool {
        let Some(server) = self.active_server() else {
            return false;
        };

        self.transmit(via, server, bytes)
    }

    fn transmit(self: &Arc<Self>, via: &Via, destination: SocketAddr, bytes: &[u8]) -> bool {
        match via {
            Via::Udp => self.observer.on_send(self, destination, bytes),
            Via::Tcp(link) => {
                // stream framing pads to 32-bit boundaries.
                let mut frame = bytes.to_vec();
                while frame.len() % 4 != 0 {
                    frame.push(0);
                }

                link.send(frame)
            }
        }
    }

    fn count_unknown(self: &Arc<Self>) {
        let too_many = {
            let mut state = self.state.lock();
            state.unknown_count += 1;
            state.unknown_count >= MAX_UNKNOWN_PACKETS
        };

        if too_many {
            self.fail(Reason::TooManyUnknownIncomingData);
        }
    }

    pub(crate) fn observer_write_ready(self: &Arc<Self>) {
        self.observer.on_write_ready(self);
    }

    pub(crate) fn tcp_link_lost(self: &Arc<Self>) {
        let relevant = {
            let state = self.state.lock();
            state.lifecycle == TurnState::Ready
                && state
                    .active
                    .as_ref()
                    .map(|a| a.transport == Transport::TCP)
                    .unwrap_or(false)
        };

        if relevant {
            self.fail(Reason::UnexpectedSocketFailure);
        }
    }
}

impl ActiveServer {
    fn via(&self) -> Via {
        match &self.link {
            Some(link) => Via::Tcp(link.clone()),
            None => Via::Udp,
        }
    }
}

fn refresh_after(lifetime: u32) -> Duration {
    // refresh before expiry with a margin of up to one minute, and
    // never later than half the lifetime for very short allocations.
    let margin = (lifetime / 4).min(60).max(1);
    Duration::from_secs(lifetime.saturating_sub(margin).max(lifetime / 2) as u64)
}

async fn resolve_turn(
    resolver: &Arc<dyn SrvResolver>,
    servers: &[String],
    proto: &str,
) -> Vec<SrvRecord> {
    let mut records = Vec::new();
    for server in servers {
        let uri = match parse_server_uri(server) {
            Ok(uri) => uri,
            Err(err) => {
                log::warn!("bad turn server reference: server={:?}, err={}", server, err);
                continue;
            }
        };

        // a uri that pins a transport only feeds that probe list.
        if let Some(transport) = &uri.transport
            && format!("_{}", transport) != proto
        {
            continue;
        }

        let port = uri.port.unwrap_or(TURN_DEFAULT_PORT);
        match resolver.lookup_srv("_turn", proto, &uri.host, port).await {
            Ok(answer) => records.extend(answer),
            Err(err) => {
                log::warn!("turn srv lookup failed: host={:?}, err={}", uri.host, err);
            }
        }
    }

    records
}

/// connect to a tcp relay and run its reader and writer tasks.
async fn connect_tcp(client: Weak<TurnClient>, server: SocketAddr) -> std::io::Result<TcpLink> {
    let stream = TcpStream::connect(server).await?;
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(TCP_RING_FRAMES);
    let blocked = Arc::new(AtomicBool::new(false));
    let link = TcpLink {
        tx,
        blocked: blocked.clone(),
    };

    // writer: drain the ring, announce write-ready after congestion
    // once the ring is half empty.
    let writer_client = client.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }

            if blocked.load(Ordering::SeqCst) && rx.len() <= TCP_RING_FRAMES / 2 {
                blocked.store(false, Ordering::SeqCst);
                if let Some(client) = writer_client.upgrade() {
                    client.observer_write_ready();
                }
            }
        }
    });

    // reader: reframe the byte stream and feed the packet path.
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(8192);
        let mut chunk = [0u8; 4096];

        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };

            buf.extend_from_slice(&chunk[..n]);

            loop {
                if buf.len() < 4 {
                    break;
                }

                let Ok(size) = codec::Decoder::message_size(&buf, true) else {
                    // stream desynchronized beyond recovery.
                    if let Some(client) = client.upgrade() {
                        client.fail(Reason::BogusDataOnSocketReceived);
                    }
                    return;
                };

                if buf.len() < size {
                    break;
                }

                let frame = buf.split_to(size);
                let Some(client) = client.upgrade() else {
                    return;
                };

                client.handle_packet(server, &frame);
            }
        }

        if let Some(client) = client.upgrade() {
            client.tcp_link_lost();
        }
    });

    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticResolver;
    use codec::attribute::{Nonce, Realm, UserName};
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct Events {
        sends: PlMutex<Vec<(SocketAddr, Vec<u8>)>>,
        states: PlMutex<Vec<TurnState>>,
        received: PlMutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl TurnObserver for Events {
        fn on_state_changed(&self, _: &Arc<TurnClient>, state: TurnState) {
            self.states.lock().push(state);
        }

        fn on_received(&self, _: &Arc<TurnClient>, peer: SocketAddr, bytes: &[u8]) {
            self.received.lock().push((peer, bytes.to_vec()));
        }

        fn on_send(&self, _: &Arc<TurnClient>, destination: SocketAddr, packet: &[u8]) -> bool {
            self.sends.lock().push((destination, packet.to_vec()));
            true
        }
    }

    impl Events {
        /// last outbound stun message matching the method, with its
        /// transaction id.
        fn last_request(&self, method: Method) -> Option<(SocketAddr, [u8; 12])> {
            let sends = self.sends.lock();
            sends.iter().rev().find_map(|(dest, packet)| {
                let mut attributes = Attributes::default();
                let message = MessageReader::decode(packet, &mut attributes).ok()?;
                (message.method == method)
                    .then(|| (*dest, message.token.try_into().unwrap()))
            })
        }

        fn count_requests(&self, method: Method) -> usize {
            let sends = self.sends.lock();
            sends
                .iter()
                .filter(|(_, packet)| {
                    let mut attributes = Attributes::default();
                    MessageReader::decode(packet, &mut attributes)
                        .map(|m| m.method == method)
                        .unwrap_or(false)
                })
                .count()
        }
    }

    fn server() -> SocketAddr {
        "5.6.7.8:3478".parse().unwrap()
    }

    fn srv() -> Vec<SrvRecord> {
        vec![SrvRecord {
            priority: 0,
            weight: 0,
            port: 3478,
            target: "relay".into(),
            ips: vec![server().ip()],
        }]
    }

    fn options() -> TurnOptions {
        TurnOptions {
            servers: Vec::new(),
            srv_udp: Some(srv()),
            srv_tcp: Some(Vec::new()),
            username: "u".into(),
            password: "p".into(),
            lifetime: None,
            pattern: None,
        }
    }

    fn respond(
        from: SocketAddr,
        method: Method,
        token: &[u8; 12],
        build: impl FnOnce(&mut MessageWriter<'_>),
    ) {
        let mut buf = BytesMut::new();
        let mut writer = MessageWriter::new(method, token, &mut buf);
        build(&mut writer);
        writer.flush(None).unwrap();
        assert!(
            crate::requester::StunRequesterManager::singleton().handle_packet(from, &buf)
        );
    }

    async fn allocate(probe: &Arc<Events>, client: &Arc<TurnClient>, lifetime: u32) {
        // wait for the first allocate to go out.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let (dest, token) = probe
            .last_request(Method::Allocate(Kind::Request))
            .expect("allocate sent");
        assert_eq!(dest, server());

        // the server demands credentials first.
        respond(dest, Method::Allocate(Kind::Error), &token, |writer| {
            writer.append::<ErrorCode>(codec::attribute::ErrorValue::from(ErrKind::Unauthorized));
            writer.append::<Realm>("example.org");
            writer.append::<Nonce>("f00d");
        });

        // the authenticated retry runs under a fresh transaction.
        let (_, token) = probe
            .last_request(Method::Allocate(Kind::Request))
            .expect("authenticated allocate");

        let relayed: SocketAddr = "5.6.7.8:49152".parse().unwrap();
        let mapped: SocketAddr = "9.9.9.9:40000".parse().unwrap();
        respond(dest, Method::Allocate(Kind::Response), &token, |writer| {
            writer.append::<XorRelayedAddress>(relayed);
            writer.append::<XorMappedAddress>(mapped);
            writer.append::<Lifetime>(lifetime);
        });

        assert!(client.is_ready());
        assert_eq!(client.relayed_address(), Some(relayed));
        assert_eq!(client.reflexive_address(), Some(mapped));
    }

    #[tokio::test(start_paused = true)]
    async fn allocates_with_credential_retry_then_refreshes() {
        let probe = Arc::new(Events::default());
        let client = TurnClient::create(
            Arc::new(Settings::default()),
            Arc::new(StaticResolver(Vec::new())),
            options(),
            probe.clone(),
        );

        allocate(&probe, &client, 600).await;

        // the authenticated allocate carried the username and realm.
        let sends = probe.sends.lock().clone();
        let last_allocate = sends
            .iter()
            .rev()
            .find_map(|(_, packet)| {
                let mut attributes = Attributes::default();
                let message = MessageReader::decode(packet, &mut attributes).ok()?;
                (message.method == Method::Allocate(Kind::Request)
                    && message.get::<Realm>().is_some())
                .then(|| {
                    (
                        message.get::<UserName>().map(str::to_string),
                        message.get::<Realm>().map(str::to_string),
                    )
                })
            })
            .expect("authenticated allocate");
        assert_eq!(last_allocate.0.as_deref(), Some("u"));
        assert_eq!(last_allocate.1.as_deref(), Some("example.org"));

        // exactly one refresh goes out at lifetime minus the margin.
        assert_eq!(probe.count_requests(Method::Refresh(Kind::Request)), 0);
        tokio::time::sleep(Duration::from_secs(545)).await;
        assert_eq!(probe.count_requests(Method::Refresh(Kind::Request)), 1);

        let (dest, token) = probe.last_request(Method::Refresh(Kind::Request)).unwrap();
        respond(dest, Method::Refresh(Kind::Response), &token, |writer| {
            writer.append::<Lifetime>(600);
        });

        assert!(client.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_timeout_shuts_the_client_down() {
        let probe = Arc::new(Events::default());
        let client = TurnClient::create(
            Arc::new(Settings::default()),
            Arc::new(StaticResolver(Vec::new())),
            options(),
            probe.clone(),
        );

        allocate(&probe, &client, 600).await;

        // let the refresh go out and never answer it; the requester
        // burns its three attempts (0.5s, 1s, 2s) and gives up.
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert!(probe.count_requests(Method::Refresh(Kind::Request)) >= 3);
        let (state, reason) = client.state();
        assert_eq!(state, TurnState::Shutdown);
        assert_eq!(reason, Some(Reason::RefreshTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn permissions_gate_sends_and_channels_take_over() {
        let probe = Arc::new(Events::default());
        let client = TurnClient::create(
            Arc::new(Settings::default()),
            Arc::new(StaticResolver(Vec::new())),
            options(),
            probe.clone(),
        );

        allocate(&probe, &client, 600).await;

        let peer: SocketAddr = "7.7.7.7:7000".parse().unwrap();

        // first send has no permission installed yet: parked, and a
        // CreatePermission goes out.
        assert!(client.send_to(peer, b"first"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (dest, token) = probe
            .last_request(Method::CreatePermission(Kind::Request))
            .expect("create permission sent");

        respond(dest, Method::CreatePermission(Kind::Response), &token, |_| {});

        // the parked packet was released as a Send indication.
        assert_eq!(probe.count_requests(Method::SendIndication), 1);

        // sustained traffic earns a channel binding.
        for _ in 0..6 {
            assert!(client.send_to(peer, b"data"));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        let (dest, token) = probe
            .last_request(Method::ChannelBind(Kind::Request))
            .expect("channel bind sent");
        respond(dest, Method::ChannelBind(Kind::Response), &token, |_| {});

        probe.sends.lock().clear();
        assert!(client.send_to(peer, b"framed"));

        // channel-data framing: 4-byte header, number in range.
        let sends = probe.sends.lock();
        let (_, packet) = sends.last().expect("framed send");
        assert!(matches!(packet[0] >> 6, 1));
        assert_eq!(&packet[4..], b"framed");

        // inbound channel data maps back to the peer.
        drop(sends);
        let number = client.state.lock().active.as_ref().unwrap().channels.bound_number(&peer).unwrap();
        let mut frame = BytesMut::new();
        ChannelData {
            number,
            bytes: b"welcome back",
        }
        .encode(&mut frame);

        assert!(client.handle_packet(server(), &frame));
        assert_eq!(
            probe.received.lock().as_slice(),
            &[(peer, b"welcome back".to_vec())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn data_indications_deliver_to_the_observer() {
        let probe = Arc::new(Events::default());
        let client = TurnClient::create(
            Arc::new(Settings::default()),
            Arc::new(StaticResolver(Vec::new())),
            options(),
            probe.clone(),
        );

        allocate(&probe, &client, 600).await;

        let peer: SocketAddr = "8.8.4.4:4444".parse().unwrap();
        let token: [u8; 12] = rand::random();
        let mut buf = BytesMut::new();
        let mut writer = MessageWriter::new(Method::DataIndication, &token, &mut buf);
        writer.append::<XorPeerAddress>(peer);
        writer.append::<Data>(b"indirect");
        writer.flush(None).unwrap();

        assert!(client.handle_packet(server(), &buf));
        assert_eq!(
            probe.received.lock().as_slice(),
            &[(peer, b"indirect".to_vec())]
        );

        // packets from strangers are not consumed.
        assert!(!client.handle_packet("2.2.2.2:1000".parse().unwrap(), &buf));
    }
}
