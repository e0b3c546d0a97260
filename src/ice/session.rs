use bytes::BytesMut;
use parking_lot::Mutex;
use rand::Rng;

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;

use codec::attribute::{
    ErrKind, ErrorCode, ErrorValue, IceControlled, IceControlling, Priority, UseCandidate,
    UserName, XorMappedAddress,
};
use codec::{Attributes, Kind, MessageReader, MessageWriter, Method, RfcVariant};

use crate::backgrounding::{Backgrounding, BackgroundingObserver, Notifier};
use crate::backoff::BackOffPattern;
use crate::config::Settings;
use crate::error::Reason;
use crate::requester::{
    RequestAttr, RequesterObserver, StunRequest, StunRequester, StunRequesterOptions,
};
use crate::subscriptions::Subscription;

use super::candidate::{Candidate, CandidateType, pair_priority};
use super::socket::IceSocket;

/// connectivity-check pacing.
const CHECK_TICK: Duration = Duration::from_millis(20);

/// idle pacing once a pair is nominated.
const IDLE_TICK: Duration = Duration::from_millis(250);

/// candidate pair list ceiling (RFC 8445 recommends 100).
const MAX_PAIRS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceSessionState {
    Pending,
    Prepared,
    Searching,
    Nominating,
    Nominated,
    Completed,
    Haulted,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceControl {
    Controlling,
    Controlled,
}

/// the keep-alive trio plus the backgrounding allowance.
#[derive(Debug, Clone)]
pub struct KeepAliveOptions {
    /// Binding indication cadence over the nominated pair.
    pub keep_alive: Duration,
    /// silence tolerated before probing the nominated pair.
    pub expect_traffic_within: Duration,
    /// budget of that aliveness probe.
    pub aliveness_timeout: Duration,
    /// background residence allowed before resume fails the session.
    pub backgrounding_timeout: Duration,
}

impl KeepAliveOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            keep_alive: settings.ice_keep_alive(),
            expect_traffic_within: settings.ice_expect_traffic_within(),
            aliveness_timeout: settings.ice_aliveness_timeout(),
            backgrounding_timeout: settings.ice_backgrounding_timeout(),
        }
    }
}

pub struct RemoteParty {
    pub username_frag: String,
    pub password: String,
    pub candidates: Vec<Candidate>,
}

pub struct IceSessionOptions {
    pub control: IceControl,
    pub local_username_frag: String,
    pub local_password: String,
    pub remote: Option<RemoteParty>,
    pub keep_alive: Option<KeepAliveOptions>,
}

pub trait IceSessionObserver: Send + Sync {
    fn on_state_changed(&self, session: &Arc<IceSession>, state: IceSessionState);

    /// application data arrived over the session.
    fn on_data(&self, session: &Arc<IceSession>, bytes: &[u8]);

    fn on_nominated(&self, _session: &Arc<IceSession>, _local: &Candidate, _remote: &Candidate) {}
}

struct CandidatePair {
    id: u64,
    local: Candidate,
    remote: Candidate,
    priority: u64,
    received_request: bool,
    received_response: bool,
    failed: bool,
    requester: Option<Arc<StunRequester>>,
    nominating: bool,
}

struct SessionState {
    lifecycle: IceSessionState,
    reason: Option<Reason>,
    control: IceControl,
    remote_frag: Option<String>,
    remote_password: Option<String>,
    remote_candidates: Vec<Candidate>,
    pairs: Vec<CandidatePair>,
    next_pair_id: u64,
    nominated: Option<u64>,
    previously_nominated: Option<u64>,
    last_sent: Instant,
    last_received: Instant,
    aliveness: Option<Arc<StunRequester>>,
    went_to_background_at: Option<Instant>,
    _background_sub: Option<Subscription>,
}

/// One ICE conversation with one remote party.
///
/// Owns the candidate-pair table and the connectivity-check state
/// machine; the parent [`IceSocket`] feeds it packets and transmits on
/// its behalf.
pub struct IceSession {
    settings: Arc<Settings>,
    socket: Weak<IceSocket>,
    observer: Arc<dyn IceSessionObserver>,
    local_frag: String,
    local_password: String,
    /// role tie-breaker, random per session.
    conflict_resolver: u64,
    keep_alive: KeepAliveOptions,
    state: Mutex<SessionState>,
}

enum CheckRole {
    Check { pair: u64 },
    Nominate { pair: u64 },
    Aliveness,
}

struct CheckBridge {
    session: Weak<IceSession>,
    role: CheckRole,
    via: Candidate,
}

impl RequesterObserver for CheckBridge {
    fn on_send(&self, _: &Arc<StunRequester>, destination: SocketAddr, packet: &[u8]) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        let Some(socket) = session.socket.upgrade() else {
            return;
        };

        socket.send_via(&self.via, destination, packet);
        session.state.lock().last_sent = Instant::now();
    }

    fn on_response(
        &self,
        _requester: &Arc<StunRequester>,
        from: SocketAddr,
        message: &MessageReader<'_, '_>,
    ) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        match &self.role {
            CheckRole::Check { pair } => session.on_check_response(*pair, from, message),
            CheckRole::Nominate { pair } => session.on_nominate_response(*pair, message),
            CheckRole::Aliveness => session.on_aliveness_response(message),
        }
    }

    fn on_timed_out(&self, _: &Arc<StunRequester>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        match &self.role {
            CheckRole::Check { pair } => session.on_check_failed(*pair),
            CheckRole::Nominate { pair } => session.on_check_failed(*pair),
            CheckRole::Aliveness => session.on_aliveness_failed(),
        }
    }
}

/// backgrounding fan-in; releases its notifier immediately because
/// suspending check timers needs no wind-down time.
struct BackgroundBridge(Weak<IceSession>);

impl BackgroundingObserver for BackgroundBridge {
    fn on_going_to_background(&self, notifier: Notifier) {
        if let Some(session) = self.0.upgrade() {
            session.going_to_background();
        }

        drop(notifier);
    }

    fn on_returning_from_background(&self) {
        if let Some(session) = self.0.upgrade() {
            session.returning_from_background();
        }
    }
}

impl IceSession {
    pub(crate) fn create(
        socket: &Arc<IceSocket>,
        options: IceSessionOptions,
        observer: Arc<dyn IceSessionObserver>,
    ) -> Arc<Self> {
        let settings = socket_settings(socket);
        let keep_alive = options
            .keep_alive
            .unwrap_or_else(|| KeepAliveOptions::from_settings(&settings));

        let now = Instant::now();
        let session = Arc::new(Self {
            settings: settings.clone(),
            socket: Arc::downgrade(socket),
            observer,
            local_frag: options.local_username_frag,
            local_password: options.local_password,
            conflict_resolver: rand::thread_rng().r#gen(),
            keep_alive,
            state: Mutex::new(SessionState {
                lifecycle: IceSessionState::Pending,
                reason: None,
                control: options.control,
                remote_frag: None,
                remote_password: None,
                remote_candidates: Vec::new(),
                pairs: Vec::new(),
                next_pair_id: 1,
                nominated: None,
                previously_nominated: None,
                last_sent: now,
                last_received: now,
                aliveness: None,
                went_to_background_at: None,
                _background_sub: None,
            }),
        });

        let sub = Backgrounding::singleton().subscribe(
            settings.ice_backgrounding_phase,
            Arc::new(BackgroundBridge(Arc::downgrade(&session))),
        );
        session.state.lock()._background_sub = Some(sub);

        if let Some(remote) = options.remote {
            session.set_remote(remote);
        } else {
            session.set_lifecycle(IceSessionState::Prepared);
        }

        session.drive();
        session
    }

    pub fn state(&self) -> (IceSessionState, Option<Reason>) {
        let state = self.state.lock();
        (state.lifecycle, state.reason)
    }

    pub fn control(&self) -> IceControl {
        self.state.lock().control
    }

    pub fn local_username_frag(&self) -> &str {
        &self.local_frag
    }

    /// the nominated pair, once one exists.
    pub fn nominated_pair(&self) -> Option<(Candidate, Candidate)> {
        let state = self.state.lock();
        let id = state.nominated?;
        state
            .pairs
            .iter()
            .find(|p| p.id == id)
            .map(|p| (p.local.clone(), p.remote.clone()))
    }

    pub(crate) fn is_using_relay(&self) -> bool {
        self.nominated_pair()
            .map(|(local, _)| local.kind == CandidateType::Relayed)
            .unwrap_or(false)
    }

    /// supply or replace the remote party, generating the pair table.
    pub fn set_remote(self: &Arc<Self>, remote: RemoteParty) {
        let locals = self
            .socket
            .upgrade()
            .map(|s| s.local_candidates())
            .unwrap_or_default();

        {
            let mut state = self.state.lock();
            if state.lifecycle == IceSessionState::Shutdown {
                return;
            }

            state.remote_frag = Some(remote.username_frag);
            state.remote_password = Some(remote.password);
            state.remote_candidates = remote.candidates;

            let control = state.control;
            let mut pairs = Vec::new();
            let mut next_id = state.next_pair_id;
            for local in locals.iter() {
                for remote in state.remote_candidates.iter() {
                    if local.address.is_ipv4() != remote.address.is_ipv4() {
                        continue;
                    }

                    if local.component_id != remote.component_id {
                        continue;
                    }

                    let (g, d) = match control {
                        IceControl::Controlling => (local.priority, remote.priority),
                        IceControl::Controlled => (remote.priority, local.priority),
                    };

                    pairs.push(CandidatePair {
                        id: next_id,
                        local: local.clone(),
                        remote: remote.clone(),
                        priority: pair_priority(g, d),
                        received_request: false,
                        received_response: false,
                        failed: false,
                        requester: None,
                        nominating: false,
                    });

                    next_id += 1;
                }
            }

            pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
            pairs.truncate(MAX_PAIRS);
            state.next_pair_id = next_id;
            state.pairs = pairs;
        }

        log::debug!(
            "ice session searching: pairs={}",
            self.state.lock().pairs.len()
        );
        self.set_lifecycle(IceSessionState::Searching);
    }

    /// send application data over the nominated (or best proven)
    /// pair.
    pub fn send_packet(self: &Arc<Self>, bytes: &[u8]) -> bool {
        let route = {
            let mut state = self.state.lock();
            let pair = state
                .nominated
                .and_then(|id| state.pairs.iter().find(|p| p.id == id))
                .or_else(|| {
                    state
                        .pairs
                        .iter()
                        .filter(|p| p.received_request && p.received_response)
                        .max_by_key(|p| p.priority)
                });

            let route = pair.map(|p| (p.local.clone(), p.remote.address));
            if route.is_some() {
                state.last_sent = Instant::now();
            }

            route
        };

        let Some((local, destination)) = route else {
            return false;
        };

        self.socket
            .upgrade()
            .map(|socket| socket.send_via(&local, destination, bytes))
            .unwrap_or(false)
    }

    /// packets arriving over an installed route.
    pub(crate) fn handle_packet(self: &Arc<Self>, via: SocketAddr, source: SocketAddr, bytes: &[u8]) {
        self.state.lock().last_received = Instant::now();

        let mut attributes = Attributes::default();
        match MessageReader::decode(bytes, &mut attributes) {
            Ok(message)
                if matches!(
                    message.method,
                    Method::Binding(_) | Method::BindingIndication
                ) =>
            {
                match message.method {
                    Method::Binding(Kind::Request) => {
                        self.handle_binding_request(via, source, &message);
                    }
                    Method::BindingIndication => {
                        // keep-alive; receipt timestamp already taken.
                    }
                    _ => {
                        // responses match an in-flight requester.
                        crate::requester::StunRequesterManager::singleton()
                            .handle_message(source, &message);
                    }
                }
            }
            _ => self.observer.on_data(self, bytes),
        }
    }

    /// packets with no route yet; consumed when the username targets
    /// this session.
    pub(crate) fn handle_unrouted_stun(
        self: &Arc<Self>,
        via: SocketAddr,
        source: SocketAddr,
        message: &MessageReader<'_, '_>,
    ) -> bool {
        if !matches!(
            message.method,
            Method::Binding(Kind::Request) | Method::BindingIndication
        ) {
            return false;
        }

        let targets_us = message
            .get::<UserName>()
            .map(|username| username.starts_with(&format!("{}:", self.local_frag)))
            .unwrap_or(false);

        if !targets_us {
            return false;
        }

        self.state.lock().last_received = Instant::now();
        if message.method == Method::Binding(Kind::Request) {
            self.handle_binding_request(via, source, message);
        }

        true
    }

    pub fn shutdown(self: &Arc<Self>) {
        self.finish(None);
    }

    /// the application is heading to the background; check timers are
    /// suspended until resume.
    pub fn going_to_background(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.went_to_background_at.is_none() {
            state.went_to_background_at = Some(Instant::now());
            log::debug!("ice session suspended for backgrounding");
        }
    }

    /// back from the background: too late fails the session, in time
    /// triggers an immediate aliveness check.
    pub fn returning_from_background(self: &Arc<Self>) {
        let verdict = {
            let mut state = self.state.lock();
            let Some(went) = state.went_to_background_at.take() else {
                return;
            };

            Instant::now().duration_since(went) > self.keep_alive.backgrounding_timeout
        };

        if verdict {
            self.fail(Reason::BackgroundingTimeout);
        } else {
            self.start_aliveness_check();
        }
    }

    fn fail(self: &Arc<Self>, reason: Reason) {
        log::warn!("ice session failed: reason={}", reason);
        self.finish(Some(reason));
    }

    fn finish(self: &Arc<Self>, reason: Option<Reason>) {
        let cancelled = {
            let mut state = self.state.lock();
            if state.lifecycle == IceSessionState::Shutdown {
                return;
            }

            state.lifecycle = IceSessionState::Shutdown;
            state.reason = reason;

            let mut cancelled: Vec<Arc<StunRequester>> = Vec::new();
            for pair in state.pairs.iter_mut() {
                if let Some(requester) = pair.requester.take() {
                    cancelled.push(requester);
                }
            }

            if let Some(aliveness) = state.aliveness.take() {
                cancelled.push(aliveness);
            }

            cancelled
        };

        for requester in cancelled {
            requester.cancel();
        }

        if let Some(socket) = self.socket.upgrade() {
            socket.remove_session_routes(self);
        }

        self.observer.on_state_changed(self, IceSessionState::Shutdown);
    }

    fn set_lifecycle(self: &Arc<Self>, lifecycle: IceSessionState) {
        {
            let mut state = self.state.lock();
            if state.lifecycle == lifecycle || state.lifecycle == IceSessionState::Shutdown {
                return;
            }

            state.lifecycle = lifecycle;
        }

        log::debug!("ice session state changed: state={:?}", lifecycle);
        self.observer.on_state_changed(self, lifecycle);
    }

    fn drive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let tick = {
                    let Some(session) = weak.upgrade() else { return };
                    let state = session.state.lock();
                    match state.lifecycle {
                        IceSessionState::Shutdown => return,
                        IceSessionState::Searching | IceSessionState::Nominating => CHECK_TICK,
                        _ => IDLE_TICK,
                    }
                };

                tokio::time::sleep(tick).await;
                let Some(session) = weak.upgrade() else { return };
                session.tick();
            }
        });
    }

    fn tick(self: &Arc<Self>) {
        if self.state.lock().went_to_background_at.is_some() {
            return;
        }

        self.unfreeze_next_pair();
        self.keep_alive_tick();
    }

    /// kick off a check on the highest-priority pair whose foundation
    /// is not already being checked.
    fn unfreeze_next_pair(self: &Arc<Self>) {
        enum Verdict {
            Check(u64),
            Halt,
            Idle,
        }

        let verdict = {
            let state = self.state.lock();
            if !matches!(
                state.lifecycle,
                IceSessionState::Searching | IceSessionState::Nominating
            ) {
                return;
            }

            let busy_foundations: Vec<(String, String)> = state
                .pairs
                .iter()
                .filter(|p| p.requester.is_some())
                .map(|p| (p.local.foundation.clone(), p.remote.foundation.clone()))
                .collect();

            let next = state
                .pairs
                .iter()
                .filter(|p| !p.failed && !p.received_response && p.requester.is_none())
                .find(|p| {
                    !busy_foundations
                        .contains(&(p.local.foundation.clone(), p.remote.foundation.clone()))
                })
                .map(|p| p.id);

            match next {
                Some(id) => Verdict::Check(id),
                // every pair burned out with nothing proven: the
                // search halts until new candidates arrive.
                None if state.lifecycle == IceSessionState::Searching
                    && !state.pairs.is_empty()
                    && state.pairs.iter().all(|p| p.failed) =>
                {
                    Verdict::Halt
                }
                None => Verdict::Idle,
            }
        };

        match verdict {
            Verdict::Check(pair) => self.start_check(pair, false),
            Verdict::Halt => self.set_lifecycle(IceSessionState::Haulted),
            Verdict::Idle => {}
        }
    }

    fn start_check(self: &Arc<Self>, pair_id: u64, nominate: bool) {
        let prepared = {
            let mut state = self.state.lock();
            let control = state.control;
            let (remote_frag, remote_password) =
                match (state.remote_frag.clone(), state.remote_password.clone()) {
                    (Some(f), Some(p)) => (f, p),
                    _ => return,
                };

            let Some(pair) = state.pairs.iter_mut().find(|p| p.id == pair_id) else {
                return;
            };

            if pair.requester.is_some() {
                return;
            }

            pair.nominating = nominate;
            Some((
                pair.local.clone(),
                pair.remote.clone(),
                remote_frag,
                remote_password,
                control,
            ))
        };

        let Some((local, remote, remote_frag, remote_password, control)) = prepared else {
            return;
        };

        let mut request = StunRequest::new(Method::Binding(Kind::Request));
        request.username = Some(format!("{}:{}", remote_frag, self.local_frag));
        request.password = Some(remote_password);
        request = request.attribute(RequestAttr::Priority(local.priority));

        request = match control {
            IceControl::Controlling => {
                let mut r = request.attribute(RequestAttr::IceControlling(self.conflict_resolver));
                if nominate {
                    r = r.attribute(RequestAttr::UseCandidate);
                }
                r
            }
            IceControl::Controlled => {
                request.attribute(RequestAttr::IceControlled(self.conflict_resolver))
            }
        };

        let role = if nominate {
            CheckRole::Nominate { pair: pair_id }
        } else {
            CheckRole::Check { pair: pair_id }
        };

        let requester = match StunRequester::create(
            &self.settings,
            StunRequesterOptions {
                server: remote.address,
                request,
                variant: RfcVariant::Rfc5245Ice,
                pattern: Some(check_pattern()),
            },
            Arc::new(CheckBridge {
                session: Arc::downgrade(self),
                role,
                via: local,
            }),
        ) {
            Ok(requester) => requester,
            Err(err) => {
                // the pair stays unchecked; the pacing tick retries.
                log::warn!("ice check rejected: pair={}, err={}", pair_id, err);
                return;
            }
        };

        let mut state = self.state.lock();
        if let Some(pair) = state.pairs.iter_mut().find(|p| p.id == pair_id) {
            pair.requester = Some(requester);
        } else {
            drop(state);
            requester.cancel();
        }
    }

    fn on_check_response(
        self: &Arc<Self>,
        pair_id: u64,
        from: SocketAddr,
        message: &MessageReader<'_, '_>,
    ) {
        if message.method == Method::Binding(Kind::Error) {
            // a role conflict rejection means our view of the roles
            // lost; flip and retry the pair.
            let conflicted = message
                .get::<ErrorCode>()
                .map(|e| e.is(ErrKind::RoleConflict))
                .unwrap_or(false);

            {
                let mut state = self.state.lock();
                if conflicted {
                    state.control = match state.control {
                        IceControl::Controlling => IceControl::Controlled,
                        IceControl::Controlled => IceControl::Controlling,
                    };
                }

                if let Some(pair) = state.pairs.iter_mut().find(|p| p.id == pair_id) {
                    pair.requester = None;
                    if !conflicted {
                        pair.failed = true;
                    }
                }
            }

            return;
        }

        {
            let mut state = self.state.lock();
            let Some(pair) = state.pairs.iter_mut().find(|p| p.id == pair_id) else {
                return;
            };

            if pair.remote.address != from {
                // a response must come back from the address the
                // check went to.
                return;
            }

            pair.received_response = true;
            pair.requester = None;
        }

        self.maybe_nominate();
    }

    fn on_check_failed(self: &Arc<Self>, pair_id: u64) {
        let demote = {
            let mut state = self.state.lock();
            if let Some(pair) = state.pairs.iter_mut().find(|p| p.id == pair_id) {
                pair.failed = true;
                pair.requester = None;
                pair.nominating
            } else {
                false
            }
        };

        if demote {
            // nomination fell through; hunt again.
            self.set_lifecycle(IceSessionState::Searching);
        }
    }

    /// controlling side: once a pair proved both directions, nominate
    /// the best such pair.
    fn maybe_nominate(self: &Arc<Self>) {
        let nominate = {
            let state = self.state.lock();
            if state.control != IceControl::Controlling
                || state.lifecycle != IceSessionState::Searching
            {
                None
            } else {
                state
                    .pairs
                    .iter()
                    .filter(|p| p.received_request && p.received_response && !p.failed)
                    .max_by_key(|p| p.priority)
                    .map(|p| p.id)
            }
        };

        let Some(pair) = nominate else {
            return;
        };

        self.set_lifecycle(IceSessionState::Nominating);
        self.start_check(pair, true);
    }

    fn on_nominate_response(self: &Arc<Self>, pair_id: u64, message: &MessageReader<'_, '_>) {
        if message.method == Method::Binding(Kind::Error) {
            self.on_check_failed(pair_id);
            return;
        }

        self.promote(pair_id);
    }

    /// a pair became the nominated pair.
    fn promote(self: &Arc<Self>, pair_id: u64) {
        let (info, cancelled) = {
            let mut state = self.state.lock();
            let Some(pair) = state.pairs.iter_mut().find(|p| p.id == pair_id) else {
                return;
            };

            pair.received_response = true;
            pair.requester = None;
            let info = (pair.local.clone(), pair.remote.clone());

            state.nominated = Some(pair_id);

            // wind the rest of the checks down.
            let mut cancelled = Vec::new();
            for pair in state.pairs.iter_mut() {
                if pair.id != pair_id
                    && let Some(requester) = pair.requester.take()
                {
                    cancelled.push(requester);
                }
            }

            (info, cancelled)
        };

        for requester in cancelled {
            requester.cancel();
        }

        log::info!(
            "ice session nominated: local={:?}, remote={:?}",
            info.0.address,
            info.1.address
        );

        self.set_lifecycle(IceSessionState::Nominated);
        self.observer.on_nominated(self, &info.0, &info.1);
        self.set_lifecycle(IceSessionState::Completed);
    }

    fn handle_binding_request(
        self: &Arc<Self>,
        via: SocketAddr,
        source: SocketAddr,
        message: &MessageReader<'_, '_>,
    ) {
        // short-term credentials: the request must target our
        // fragment and carry our password's integrity.
        let expected_user = {
            let state = self.state.lock();
            match &state.remote_frag {
                Some(remote) => format!("{}:{}", self.local_frag, remote),
                None => format!("{}:", self.local_frag),
            }
        };

        let username_ok = message
            .get::<UserName>()
            .map(|u| u.starts_with(&expected_user) || u.starts_with(&format!("{}:", self.local_frag)))
            .unwrap_or(false);

        if !username_ok || message.integrity(self.local_password.as_bytes()).is_err() {
            log::debug!("ice check rejected: source={:?}", source);
            return;
        }

        // role conflict resolution: the higher tie-breaker ends up
        // controlling.
        let mut role_conflict_response = false;
        {
            let mut state = self.state.lock();
            match (state.control, message.get::<IceControlling>(), message.get::<IceControlled>()) {
                (IceControl::Controlling, Some(their_tb), _) => {
                    if their_tb >= self.conflict_resolver {
                        log::debug!("ice role conflict, becoming controlled");
                        state.control = IceControl::Controlled;
                    } else {
                        role_conflict_response = true;
                    }
                }
                (IceControl::Controlled, _, Some(their_tb)) => {
                    if their_tb < self.conflict_resolver {
                        log::debug!("ice role conflict, becoming controlling");
                        state.control = IceControl::Controlling;
                    } else {
                        role_conflict_response = true;
                    }
                }
                _ => {}
            }
        }

        if role_conflict_response {
            let mut buf = BytesMut::with_capacity(128);
            let mut writer = MessageWriter::extend(Method::Binding(Kind::Error), message, &mut buf);
            writer.append::<ErrorCode>(ErrorValue::from(ErrKind::RoleConflict));
            if let Err(err) = writer.flush(Some(self.local_password.as_bytes())) {
                log::warn!("ice role conflict response rejected: err={}", err);
                return;
            }

            self.send_raw(via, source, &buf);
            return;
        }

        // success response echoes where we saw the request from.
        let mut buf = BytesMut::with_capacity(128);
        let mut writer = MessageWriter::extend(Method::Binding(Kind::Response), message, &mut buf);
        writer.append::<XorMappedAddress>(source);
        if let Err(err) = writer.flush(Some(self.local_password.as_bytes())) {
            log::warn!("ice check response rejected: err={}", err);
            return;
        }

        self.send_raw(via, source, &buf);

        // bookkeeping on the pair table.
        let use_candidate = message.get::<UseCandidate>().is_some();
        let priority = message.get::<Priority>();

        let (pair_id, should_check, promote) = {
            let mut state = self.state.lock();
            let existing = state
                .pairs
                .iter_mut()
                .find(|p| p.remote.address == source && p.local.address == via);

            let pair_id = match existing {
                Some(pair) => {
                    pair.received_request = true;
                    pair.id
                }
                None => match self.synthesize_peer_reflexive(&mut state, via, source, priority) {
                    Some(id) => id,
                    None => return,
                },
            };

            let pair = state.pairs.iter().find(|p| p.id == pair_id);
            let should_check = pair
                .map(|p| !p.received_response && !p.failed && p.requester.is_none())
                .unwrap_or(false);

            let promote = use_candidate
                && state.control == IceControl::Controlled
                && state.nominated != Some(pair_id);

            (pair_id, should_check, promote)
        };

        // a triggered check runs right away rather than waiting for
        // the pacing tick.
        if should_check {
            self.start_check(pair_id, false);
        }

        if promote {
            self.promote(pair_id);
        } else {
            self.maybe_nominate();
        }
    }

    /// a request from an address we never signalled: a NAT invented
    /// it, so adopt it as a peer-reflexive candidate.
    fn synthesize_peer_reflexive(
        &self,
        state: &mut SessionState,
        via: SocketAddr,
        source: SocketAddr,
        priority: Option<u32>,
    ) -> Option<u64> {
        let local = {
            let socket = self.socket.upgrade()?;
            socket
                .local_candidates()
                .into_iter()
                .find(|c| c.address == via)?
        };

        let mut remote = Candidate::new(
            CandidateType::PeerReflexive,
            local.component_id,
            source,
            65535,
            None,
        );

        if let Some(priority) = priority {
            remote.priority = priority;
        }

        log::debug!("ice peer-reflexive candidate: address={:?}", source);

        let (g, d) = match state.control {
            IceControl::Controlling => (local.priority, remote.priority),
            IceControl::Controlled => (remote.priority, local.priority),
        };

        let id = state.next_pair_id;
        state.next_pair_id += 1;
        state.pairs.push(CandidatePair {
            id,
            priority: pair_priority(g, d),
            local,
            remote,
            received_request: true,
            received_response: false,
            failed: false,
            requester: None,
            nominating: false,
        });

        state.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        if state.pairs.len() > MAX_PAIRS {
            state.pairs.truncate(MAX_PAIRS);
        }

        state.pairs.iter().any(|p| p.id == id).then_some(id)
    }

    fn keep_alive_tick(self: &Arc<Self>) {
        let now = Instant::now();

        enum Action {
            Indication(Candidate, SocketAddr),
            Aliveness,
        }

        let action = {
            let mut state = self.state.lock();
            if !matches!(
                state.lifecycle,
                IceSessionState::Nominated | IceSessionState::Completed
            ) {
                return;
            }

            let Some(pair) = state
                .nominated
                .and_then(|id| state.pairs.iter().find(|p| p.id == id))
            else {
                return;
            };

            if now.duration_since(state.last_received) >= self.keep_alive.expect_traffic_within
                && state.aliveness.is_none()
            {
                Some(Action::Aliveness)
            } else if now.duration_since(state.last_sent) >= self.keep_alive.keep_alive {
                let action = Action::Indication(pair.local.clone(), pair.remote.address);
                state.last_sent = now;
                Some(action)
            } else {
                None
            }
        };

        match action {
            Some(Action::Indication(local, destination)) => {
                let token: [u8; 12] = rand::random();
                let mut buf = BytesMut::with_capacity(32);
                let mut writer = MessageWriter::new(Method::BindingIndication, &token, &mut buf);
                if let Err(err) = writer.flush(None) {
                    log::warn!("ice keep-alive indication rejected: err={}", err);
                    return;
                }

                self.send_raw_candidate(&local, destination, &buf);
            }
            Some(Action::Aliveness) => self.start_aliveness_check(),
            None => {}
        }
    }

    /// probe the nominated pair after a stretch of silence.
    fn start_aliveness_check(self: &Arc<Self>) {
        let prepared = {
            let state = self.state.lock();
            let pair = state
                .nominated
                .and_then(|id| state.pairs.iter().find(|p| p.id == id));

            match (pair, state.remote_frag.clone(), state.remote_password.clone()) {
                (Some(pair), Some(frag), Some(password)) if state.aliveness.is_none() => {
                    Some((pair.local.clone(), pair.remote.address, frag, password, state.control))
                }
                _ => None,
            }
        };

        let Some((local, destination, remote_frag, remote_password, control)) = prepared else {
            return;
        };

        log::debug!("ice aliveness check: destination={:?}", destination);

        let mut request = StunRequest::new(Method::Binding(Kind::Request));
        request.username = Some(format!("{}:{}", remote_frag, self.local_frag));
        request.password = Some(remote_password);
        request = match control {
            IceControl::Controlling => {
                request.attribute(RequestAttr::IceControlling(self.conflict_resolver))
            }
            IceControl::Controlled => {
                request.attribute(RequestAttr::IceControlled(self.conflict_resolver))
            }
        };

        let requester = match StunRequester::create(
            &self.settings,
            StunRequesterOptions {
                server: destination,
                request,
                variant: RfcVariant::Rfc5245Ice,
                pattern: Some(aliveness_pattern(self.keep_alive.aliveness_timeout)),
            },
            Arc::new(CheckBridge {
                session: Arc::downgrade(self),
                role: CheckRole::Aliveness,
                via: local,
            }),
        ) {
            Ok(requester) => requester,
            Err(err) => {
                log::warn!("ice aliveness check rejected: err={}", err);
                return;
            }
        };

        self.state.lock().aliveness = Some(requester);
    }

    fn on_aliveness_response(self: &Arc<Self>, _message: &MessageReader<'_, '_>) {
        let mut state = self.state.lock();
        state.aliveness = None;
        state.last_received = Instant::now();
    }

    /// the nominated path went dark; demote it and search again.
    fn on_aliveness_failed(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.aliveness = None;
            state.previously_nominated = state.nominated.take();

            for pair in state.pairs.iter_mut() {
                pair.received_response = false;
                pair.failed = false;
                pair.requester = None;
            }
        }

        log::warn!("ice nominated pair went dark, searching again");
        self.set_lifecycle(IceSessionState::Searching);
    }

    fn send_raw(self: &Arc<Self>, via: SocketAddr, destination: SocketAddr, bytes: &[u8]) {
        let local = self
            .socket
            .upgrade()
            .and_then(|s| s.local_candidates().into_iter().find(|c| c.address == via));

        if let Some(local) = local {
            self.send_raw_candidate(&local, destination, bytes);
        }
    }

    fn send_raw_candidate(self: &Arc<Self>, local: &Candidate, destination: SocketAddr, bytes: &[u8]) {
        if let Some(socket) = self.socket.upgrade() {
            socket.send_via(local, destination, bytes);
            self.state.lock().last_sent = Instant::now();
        }
    }
}

fn socket_settings(socket: &Arc<IceSocket>) -> Arc<Settings> {
    socket.settings_arc()
}

/// connectivity checks answer fast or not at all.
fn check_pattern() -> BackOffPattern {
    BackOffPattern {
        max_attempts: 5,
        attempt_timeouts: vec![Duration::from_millis(250)],
        attempt_multiplier: 2.0,
        max_attempt_timeout: Duration::from_secs(2),
        retry_after: vec![Duration::ZERO],
        retry_multiplier: 1.0,
        max_retry_after: Duration::ZERO,
    }
}

fn aliveness_pattern(timeout: Duration) -> BackOffPattern {
    BackOffPattern {
        max_attempts: 1,
        attempt_timeouts: vec![timeout],
        attempt_multiplier: 1.0,
        max_attempt_timeout: timeout,
        retry_after: Vec::new(),
        retry_multiplier: 1.0,
        max_retry_after: Duration::ZERO,
    }
}
