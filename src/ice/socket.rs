use parking_lot::Mutex;

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;

use ahash::AHashMap;

use codec::{Attributes, MessageReader};

use crate::config::Settings;
use crate::discovery::{DiscoveryObserver, StunDiscovery, StunDiscoveryOptions};
use crate::dns::{SrvRecord, SrvResolver};
use crate::error::Reason;
use crate::turn::{TurnClient, TurnObserver, TurnOptions, TurnState};

use super::candidate::{Candidate, CandidateType, candidate_set_crc};
use super::session::{IceSession, IceSessionObserver, IceSessionOptions};

/// unknown inbound packets tolerated before the socket declares the
/// link hostile.
const MAX_JUNK_PACKETS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceSocketState {
    Pending,
    Ready,
    GoingToSleep,
    Sleeping,
    ShuttingDown,
    Shutdown,
}

pub trait IceSocketObserver: Send + Sync {
    fn on_state_changed(&self, socket: &Arc<IceSocket>, state: IceSocketState);

    /// the observable candidate set changed (new reflexive or relayed
    /// candidate, lost interface, ...).
    fn on_candidates_changed(&self, socket: &Arc<IceSocket>);
}

#[derive(Clone)]
pub struct TurnServerConfig {
    pub servers: Vec<String>,
    pub srv_udp: Option<Vec<SrvRecord>>,
    pub srv_tcp: Option<Vec<SrvRecord>>,
    pub username: String,
    pub password: String,
}

#[derive(Default)]
pub struct IceSocketOptions {
    pub component_id: u16,
    /// bind port; zero for ephemeral.
    pub port: u16,
    /// explicit local addresses to bind.  Empty means discover.
    pub bind_ips: Vec<IpAddr>,
    /// named interfaces for the interface-name-order setting; used
    /// instead of discovery when non-empty.
    pub interfaces: Vec<(String, IpAddr)>,
    pub stun_servers: Vec<String>,
    pub stun_srv: Option<Vec<SrvRecord>>,
    pub turn: Option<TurnServerConfig>,
}

struct LocalSocket {
    udp: Arc<UdpSocket>,
    address: SocketAddr,
    host: Candidate,
    discovery: Option<Arc<StunDiscovery>>,
    turn: Option<Arc<TurnClient>>,
    reflexive: Option<Candidate>,
    relayed: Option<Candidate>,
    /// gatherers still working on this socket.
    outstanding: u8,
}

type RouteKey = (SocketAddr, SocketAddr, SocketAddr);

struct SocketState {
    lifecycle: IceSocketState,
    reason: Option<Reason>,
    locals: Vec<LocalSocket>,
    sessions: Vec<Weak<IceSession>>,
    /// `(via, via local, source)` fast path into a session.
    routes: AHashMap<RouteKey, Weak<IceSession>>,
    last_crc: u32,
    awake_until: Instant,
    missing_ips_since: Option<Instant>,
    junk: u32,
}

/// Gathers candidates for one component and routes packets between
/// its UDP sockets, TURN relays, and sessions.
pub struct IceSocket {
    settings: Arc<Settings>,
    resolver: Arc<dyn SrvResolver>,
    component_id: u16,
    observer: Arc<dyn IceSocketObserver>,
    stun_servers: Vec<String>,
    stun_srv: Option<Vec<SrvRecord>>,
    turn_config: Option<TurnServerConfig>,
    port: u16,
    bind_ips: Vec<IpAddr>,
    interfaces: Vec<(String, IpAddr)>,
    state: Mutex<SocketState>,
}

struct DiscoveryBridge {
    socket: Weak<IceSocket>,
    index: usize,
}

impl DiscoveryObserver for DiscoveryBridge {
    fn on_send(&self, _: &Arc<StunDiscovery>, destination: SocketAddr, packet: &[u8]) {
        if let Some(socket) = self.socket.upgrade() {
            socket.transmit_local(self.index, destination, packet);
        }
    }

    fn on_completed(&self, _: &Arc<StunDiscovery>, mapped: Option<SocketAddr>) {
        if let Some(socket) = self.socket.upgrade() {
            socket.discovery_completed(self.index, mapped);
        }
    }
}

struct TurnBridge {
    socket: Weak<IceSocket>,
    index: usize,
}

impl TurnObserver for TurnBridge {
    fn on_state_changed(&self, client: &Arc<TurnClient>, state: TurnState) {
        if let Some(socket) = self.socket.upgrade() {
            socket.turn_state_changed(self.index, client, state);
        }
    }

    fn on_received(&self, _: &Arc<TurnClient>, peer: SocketAddr, bytes: &[u8]) {
        if let Some(socket) = self.socket.upgrade() {
            socket.relay_received(self.index, peer, bytes);
        }
    }

    fn on_send(&self, _: &Arc<TurnClient>, destination: SocketAddr, packet: &[u8]) -> bool {
        match self.socket.upgrade() {
            Some(socket) => socket.transmit_local(self.index, destination, packet),
            None => false,
        }
    }
}

impl IceSocket {
    pub fn create(
        settings: Arc<Settings>,
        resolver: Arc<dyn SrvResolver>,
        options: IceSocketOptions,
        observer: Arc<dyn IceSocketObserver>,
    ) -> Arc<Self> {
        let socket = Arc::new(Self {
            component_id: options.component_id.max(1),
            observer,
            stun_servers: options.stun_servers.clone(),
            stun_srv: options.stun_srv.clone(),
            turn_config: options.turn.clone(),
            port: options.port,
            bind_ips: options.bind_ips.clone(),
            interfaces: options.interfaces.clone(),
            state: Mutex::new(SocketState {
                lifecycle: IceSocketState::Pending,
                reason: None,
                locals: Vec::new(),
                sessions: Vec::new(),
                routes: AHashMap::new(),
                last_crc: 0,
                awake_until: Instant::now() + settings.turn_alive_after_wake(),
                missing_ips_since: None,
                junk: 0,
            }),
            settings,
            resolver,
        });

        let gather = socket.clone();
        tokio::spawn(async move {
            gather.gather().await;
        });

        socket.drive();
        socket
    }

    pub fn component_id(&self) -> u16 {
        self.component_id
    }

    pub(crate) fn settings_arc(&self) -> Arc<Settings> {
        self.settings.clone()
    }

    pub fn state(&self) -> (IceSocketState, Option<Reason>) {
        let state = self.state.lock();
        (state.lifecycle, state.reason)
    }

    /// the current observable candidate set.
    pub fn local_candidates(&self) -> Vec<Candidate> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for local in state.locals.iter() {
            out.push(local.host.clone());
            if let Some(reflexive) = &local.reflexive {
                out.push(reflexive.clone());
            }

            if let Some(relayed) = &local.relayed {
                out.push(relayed.clone());
            }
        }

        out
    }

    /// extend the awake deadline; wakes the socket back up when it
    /// had gone to sleep.
    pub fn wakeup(self: &Arc<Self>, min_alive: Duration) {
        let regather = {
            let mut state = self.state.lock();
            let deadline = Instant::now() + min_alive;
            if deadline > state.awake_until {
                state.awake_until = deadline;
            }

            if state.lifecycle == IceSocketState::Sleeping {
                state.lifecycle = IceSocketState::Pending;
                true
            } else {
                false
            }
        };

        if regather {
            log::info!("ice socket waking up, regathering");
            self.set_state(IceSocketState::Pending);
            let socket = self.clone();
            tokio::spawn(async move {
                socket.gather().await;
            });
        }
    }

    pub fn create_session(
        self: &Arc<Self>,
        options: IceSessionOptions,
        observer: Arc<dyn IceSessionObserver>,
    ) -> Arc<IceSession> {
        let session = IceSession::create(self, options, observer);
        self.state.lock().sessions.push(Arc::downgrade(&session));
        session
    }

    pub fn shutdown(self: &Arc<Self>) {
        let (sessions, turns) = {
            let mut state = self.state.lock();
            if matches!(
                state.lifecycle,
                IceSocketState::ShuttingDown | IceSocketState::Shutdown
            ) {
                return;
            }

            state.lifecycle = IceSocketState::ShuttingDown;
            let sessions: Vec<_> = state.sessions.drain(..).collect();
            let turns: Vec<_> = state
                .locals
                .iter_mut()
                .filter_map(|l| l.turn.take())
                .collect();

            state.routes.clear();
            (sessions, turns)
        };

        self.observer
            .on_state_changed(self, IceSocketState::ShuttingDown);

        for session in sessions.iter().filter_map(|s| s.upgrade()) {
            session.shutdown();
        }

        for turn in turns {
            turn.shutdown();
        }

        {
            let mut state = self.state.lock();
            state.lifecycle = IceSocketState::Shutdown;
            for local in state.locals.iter() {
                if let Some(discovery) = &local.discovery {
                    discovery.cancel();
                }
            }

            state.locals.clear();
        }

        self.observer.on_state_changed(self, IceSocketState::Shutdown);
    }

    /// transmit over the socket a given local candidate belongs to;
    /// relayed candidates route through their TURN client.
    pub(crate) fn send_via(
        self: &Arc<Self>,
        local: &Candidate,
        destination: SocketAddr,
        bytes: &[u8],
    ) -> bool {
        if local.kind == CandidateType::Relayed {
            let turn = {
                let state = self.state.lock();
                state
                    .locals
                    .iter()
                    .find(|l| l.relayed.as_ref().map(|c| c.address) == Some(local.address))
                    .and_then(|l| l.turn.clone())
            };

            return match turn {
                Some(turn) => turn.send_to(destination, bytes),
                None => false,
            };
        }

        let (index, found) = {
            let state = self.state.lock();
            match state
                .locals
                .iter()
                .position(|l| l.address == local.address)
            {
                Some(index) => (index, true),
                None => (0, false),
            }
        };

        found && self.transmit_local(index, destination, bytes)
    }

    /// let a session claim the fast path for a proven route.
    pub(crate) fn install_route(
        &self,
        via: SocketAddr,
        via_local: SocketAddr,
        source: SocketAddr,
        session: &Arc<IceSession>,
    ) {
        self.state
            .lock()
            .routes
            .insert((via, via_local, source), Arc::downgrade(session));
    }

    pub(crate) fn remove_session_routes(&self, session: &Arc<IceSession>) {
        let mut state = self.state.lock();
        state
            .routes
            .retain(|_, weak| !weak.upgrade().map(|s| Arc::ptr_eq(&s, session)).unwrap_or(false));
        state
            .sessions
            .retain(|weak| !weak.upgrade().map(|s| Arc::ptr_eq(&s, session)).unwrap_or(false));
    }

    /// whether any live session keeps a relay path nominated.
    fn any_session_using_relay(&self) -> bool {
        let sessions: Vec<_> = {
            let state = self.state.lock();
            state.sessions.iter().filter_map(|s| s.upgrade()).collect()
        };

        sessions.iter().any(|s| s.is_using_relay())
    }

    async fn gather(self: Arc<Self>) {
        // drop whatever a previous gathering pass left behind; stale
        // receive loops notice their socket was replaced and exit.
        let old_turns = {
            let mut state = self.state.lock();
            let mut turns = Vec::new();
            for local in state.locals.drain(..) {
                if let Some(discovery) = &local.discovery {
                    discovery.cancel();
                }

                if let Some(turn) = local.turn {
                    turns.push(turn);
                }
            }

            turns
        };

        for turn in old_turns {
            turn.shutdown();
        }

        let ips = self.select_local_ips().await;
        if ips.is_empty() {
            log::warn!("ice socket found no usable local ips");
            self.state
                .lock()
                .missing_ips_since
                .get_or_insert(Instant::now());
            return;
        }

        self.state.lock().missing_ips_since = None;

        for (preference_index, ip) in ips.into_iter().enumerate() {
            let bind = SocketAddr::new(ip, self.port);
            let udp = match UdpSocket::bind(bind).await {
                Ok(udp) => Arc::new(udp),
                Err(err) => {
                    log::warn!("ice socket bind failed: addr={:?}, err={}", bind, err);
                    continue;
                }
            };

            let address = match udp.local_addr() {
                Ok(address) => address,
                Err(_) => continue,
            };

            let local_preference = 65535u16.saturating_sub(preference_index as u16 * 256);
            let host = Candidate::new(
                CandidateType::Host,
                self.component_id,
                address,
                local_preference,
                None,
            );

            log::info!("ice socket bound: addr={:?}", address);

            let index = {
                let mut state = self.state.lock();
                if state.lifecycle != IceSocketState::Pending {
                    return;
                }

                let mut outstanding = 0;
                if !self.stun_servers.is_empty() || self.stun_srv.is_some() {
                    outstanding += 1;
                }

                if self.turn_config.is_some() {
                    outstanding += 1;
                }

                state.locals.push(LocalSocket {
                    udp: udp.clone(),
                    address,
                    host,
                    discovery: None,
                    turn: None,
                    reflexive: None,
                    relayed: None,
                    outstanding,
                });

                state.locals.len() - 1
            };

            // receive loop.
            let weak = Arc::downgrade(&self);
            let recv_udp = udp.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                loop {
                    let (n, from) = match recv_udp.recv_from(&mut buf).await {
                        Ok(v) => v,
                        Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                        Err(_) => break,
                    };

                    let Some(socket) = weak.upgrade() else {
                        break;
                    };

                    // a regathering pass may have replaced this local.
                    let current = {
                        let state = socket.state.lock();
                        state
                            .locals
                            .get(index)
                            .map(|l| Arc::ptr_eq(&l.udp, &recv_udp))
                            .unwrap_or(false)
                    };

                    if !current {
                        break;
                    }

                    socket.internal_received(index, address, from, &buf[..n]);
                }
            });

            // server-reflexive gatherer.
            if !self.stun_servers.is_empty() || self.stun_srv.is_some() {
                let discovery = StunDiscovery::create(
                    self.settings.clone(),
                    self.resolver.clone(),
                    StunDiscoveryOptions {
                        servers: self.stun_servers.clone(),
                        srv_result: self.stun_srv.clone(),
                        keep_warm_interval: Some(Duration::from_secs(30)),
                        ..Default::default()
                    },
                    Arc::new(DiscoveryBridge {
                        socket: Arc::downgrade(&self),
                        index,
                    }),
                );

                if let Some(local) = self.state.lock().locals.get_mut(index) {
                    local.discovery = Some(discovery);
                }
            }

            // relayed gatherer.
            if let Some(turn) = &self.turn_config {
                let client = TurnClient::create(
                    self.settings.clone(),
                    self.resolver.clone(),
                    TurnOptions {
                        servers: turn.servers.clone(),
                        srv_udp: turn.srv_udp.clone(),
                        srv_tcp: turn.srv_tcp.clone(),
                        username: turn.username.clone(),
                        password: turn.password.clone(),
                        lifetime: None,
                        pattern: None,
                    },
                    Arc::new(TurnBridge {
                        socket: Arc::downgrade(&self),
                        index,
                    }),
                );

                if let Some(local) = self.state.lock().locals.get_mut(index) {
                    local.turn = Some(client);
                }
            }
        }

        self.notify_candidates_changed();
        self.maybe_ready();
    }

    /// pick the local addresses to bind, honoring the explicit list,
    /// the named-interface ordering, or OS routing as a last resort.
    async fn select_local_ips(&self) -> Vec<IpAddr> {
        if !self.bind_ips.is_empty() {
            return self
                .bind_ips
                .iter()
                .copied()
                .filter(|ip| self.settings.support_ipv6 || ip.is_ipv4())
                .collect();
        }

        if !self.interfaces.is_empty() {
            let order = &self.settings.interface_name_order;
            let rank = |name: &str| {
                order
                    .iter()
                    .position(|prefix| name.starts_with(prefix.as_str()))
                    .unwrap_or(order.len())
            };

            let mut interfaces = self.interfaces.clone();
            interfaces.sort_by_key(|(name, _)| rank(name));
            return interfaces
                .into_iter()
                .map(|(_, ip)| ip)
                .filter(|ip| self.settings.support_ipv6 || ip.is_ipv4())
                .collect();
        }

        let mut ips = Vec::new();
        if let Some(ip) = routed_local_ip("8.8.8.8:80").await {
            ips.push(ip);
        }

        if self.settings.support_ipv6
            && let Some(ip) = routed_local_ip("[2001:4860:4860::8888]:80").await
        {
            ips.push(ip);
        }

        if ips.is_empty() {
            // no route anywhere; loopback still lets local sessions
            // work.
            ips.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }

        ips
    }

    fn drive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let Some(socket) = weak.upgrade() else { return };

                let lifecycle = socket.state.lock().lifecycle;
                match lifecycle {
                    IceSocketState::Shutdown => return,
                    IceSocketState::Ready => socket.tick_ready(),
                    IceSocketState::Pending => socket.tick_pending(),
                    _ => {}
                }
            }
        });
    }

    fn tick_pending(self: &Arc<Self>) {
        // a socket that cannot find any local ip keeps retrying the
        // bind, and eventually errors out when the settings demand it.
        let (missing, expired) = {
            let state = self.state.lock();
            match state.missing_ips_since {
                Some(since) => (
                    true,
                    self.settings.error_on_missing_local_ips
                        && Instant::now().duration_since(since)
                            >= self.settings.max_rebind_duration(),
                ),
                None => (false, false),
            }
        };

        if expired {
            self.fail(Reason::UnexpectedSocketFailure);
            return;
        }

        if missing {
            let socket = self.clone();
            tokio::spawn(async move {
                socket.gather().await;
            });
        }
    }

    fn tick_ready(self: &Arc<Self>) {
        let sleep = {
            let state = self.state.lock();
            Instant::now() >= state.awake_until
                && state.locals.iter().any(|l| l.turn.is_some())
        };

        if sleep && !self.any_session_using_relay() {
            log::info!("ice socket going to sleep, releasing turn allocations");
            self.set_state(IceSocketState::GoingToSleep);

            let turns: Vec<_> = {
                let mut state = self.state.lock();
                let turns = state
                    .locals
                    .iter_mut()
                    .filter_map(|l| {
                        l.relayed = None;
                        l.turn.take()
                    })
                    .collect();

                state.lifecycle = IceSocketState::Sleeping;
                turns
            };

            for turn in turns {
                turn.shutdown();
            }

            self.observer.on_state_changed(self, IceSocketState::Sleeping);
            self.notify_candidates_changed();
        }
    }

    fn transmit_local(self: &Arc<Self>, index: usize, destination: SocketAddr, bytes: &[u8]) -> bool {
        let udp = {
            let state = self.state.lock();
            state.locals.get(index).map(|l| l.udp.clone())
        };

        let Some(udp) = udp else { return false };
        match udp.try_send_to(bytes, destination) {
            Ok(_) => true,
            Err(err) => {
                log::trace!(
                    "ice socket send failed: dest={:?}, err={}",
                    destination,
                    err
                );
                false
            }
        }
    }

    fn internal_received(self: &Arc<Self>, index: usize, via_local: SocketAddr, source: SocketAddr, bytes: &[u8]) {
        // relay traffic from our TURN server is the turn client's to
        // demux.
        let turn = {
            let state = self.state.lock();
            state.locals.get(index).and_then(|l| l.turn.clone())
        };

        if let Some(turn) = turn
            && turn.handle_packet(source, bytes)
        {
            return;
        }

        self.deliver(via_local, via_local, source, bytes);
    }

    /// data a TURN client unwrapped from the relay.
    fn relay_received(self: &Arc<Self>, index: usize, peer: SocketAddr, bytes: &[u8]) {
        let via = {
            let state = self.state.lock();
            state
                .locals
                .get(index)
                .and_then(|l| l.relayed.as_ref().map(|c| c.address))
        };

        let (via, via_local) = match via {
            Some(via) => {
                let state = self.state.lock();
                (via, state.locals.get(index).map(|l| l.address).unwrap_or(via))
            }
            None => return,
        };

        self.deliver(via, via_local, peer, bytes);
    }

    fn deliver(self: &Arc<Self>, via: SocketAddr, via_local: SocketAddr, source: SocketAddr, bytes: &[u8]) {
        // fast path: a proven route delivers synchronously.
        let routed = {
            let state = self.state.lock();
            state
                .routes
                .get(&(via, via_local, source))
                .and_then(|weak| weak.upgrade())
        };

        if let Some(session) = routed {
            session.handle_packet(via, source, bytes);
            return;
        }

        // slow path: parse and offer to every session that might own
        // the binding.
        let mut attributes = Attributes::default();
        if let Ok(message) = MessageReader::decode(bytes, &mut attributes) {
            if crate::requester::StunRequesterManager::singleton().handle_message(source, &message)
            {
                return;
            }

            let sessions: Vec<_> = {
                let state = self.state.lock();
                state.sessions.iter().filter_map(|s| s.upgrade()).collect()
            };

            for session in sessions {
                if session.handle_unrouted_stun(via, source, &message) {
                    self.install_route(via, via_local, source, &session);
                    return;
                }
            }
        }

        self.count_junk();
    }

    fn discovery_completed(self: &Arc<Self>, index: usize, mapped: Option<SocketAddr>) {
        {
            let mut state = self.state.lock();
            let Some(local) = state.locals.get_mut(index) else {
                return;
            };

            if local.reflexive.is_none() {
                local.outstanding = local.outstanding.saturating_sub(1);
            }

            match mapped {
                Some(mapped) if mapped != local.address => {
                    local.reflexive = Some(Candidate::new(
                        CandidateType::ServerReflexive,
                        self.component_id,
                        mapped,
                        local.host.local_preference,
                        Some(local.address),
                    ));
                }
                _ => local.reflexive = None,
            }
        }

        self.notify_candidates_changed();
        self.maybe_ready();
    }

    fn turn_state_changed(self: &Arc<Self>, index: usize, client: &Arc<TurnClient>, state: TurnState) {
        match state {
            TurnState::Ready => {
                let relayed = client.relayed_address();
                {
                    let mut locked = self.state.lock();
                    let Some(local) = locked.locals.get_mut(index) else {
                        return;
                    };

                    local.outstanding = local.outstanding.saturating_sub(1);
                    local.relayed = relayed.map(|address| {
                        Candidate::new(
                            CandidateType::Relayed,
                            self.component_id,
                            address,
                            local.host.local_preference,
                            client.reflexive_address(),
                        )
                    });
                }

                self.notify_candidates_changed();
                self.maybe_ready();
            }
            TurnState::Shutdown => {
                {
                    let mut locked = self.state.lock();
                    let Some(local) = locked.locals.get_mut(index) else {
                        return;
                    };

                    if local.relayed.is_none() {
                        // the probe never produced an allocation.
                        local.outstanding = local.outstanding.saturating_sub(1);
                    }

                    local.relayed = None;
                }

                self.notify_candidates_changed();
                self.maybe_ready();
            }
            _ => {}
        }
    }

    fn maybe_ready(self: &Arc<Self>) {
        let becomes_ready = {
            let mut state = self.state.lock();
            if state.lifecycle != IceSocketState::Pending || state.locals.is_empty() {
                false
            } else if state.locals.iter().all(|l| l.outstanding == 0) {
                state.lifecycle = IceSocketState::Ready;
                true
            } else {
                false
            }
        };

        if becomes_ready {
            log::info!("ice socket ready");
            self.observer.on_state_changed(self, IceSocketState::Ready);
        }
    }

    fn notify_candidates_changed(self: &Arc<Self>) {
        let changed = {
            let candidates = self.local_candidates();
            let crc = candidate_set_crc(&candidates);
            let mut state = self.state.lock();
            if state.last_crc == crc {
                false
            } else {
                state.last_crc = crc;
                true
            }
        };

        if changed {
            self.observer.on_candidates_changed(self);
        }
    }

    fn count_junk(self: &Arc<Self>) {
        let too_many = {
            let mut state = self.state.lock();
            state.junk += 1;
            state.junk >= MAX_JUNK_PACKETS
        };

        if too_many {
            self.fail(Reason::TooManyUnknownIncomingData);
        }
    }

    fn fail(self: &Arc<Self>, reason: Reason) {
        {
            let mut state = self.state.lock();
            if matches!(
                state.lifecycle,
                IceSocketState::ShuttingDown | IceSocketState::Shutdown
            ) {
                return;
            }

            state.reason = Some(reason);
        }

        log::warn!("ice socket failed: reason={}", reason);
        self.shutdown();
    }

    fn set_state(self: &Arc<Self>, state: IceSocketState) {
        self.observer.on_state_changed(self, state);
    }
}

/// the routing trick: a connected UDP socket reveals which local
/// address the OS would use to reach the destination, without sending
/// a single packet.
async fn routed_local_ip(destination: &str) -> Option<IpAddr> {
    let bind: SocketAddr = if destination.starts_with('[') {
        "[::]:0".parse().ok()?
    } else {
        "0.0.0.0:0".parse().ok()?
    };

    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(destination).await.ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}
