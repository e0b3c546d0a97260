use ahash::AHashMap;
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use codec::attribute::{
    ChannelNumber, Data, ErrKind, ErrorCode, IceControlled, IceControlling, Lifetime,
    MobilityTicket, Nonce, Priority, Realm, RequestedTransport, Software, Transport, UseCandidate,
    UserName, XorPeerAddress,
};
use codec::crypto::long_term_credential_digest;
use codec::{Attributes, CredentialMechanism, Kind, MessageReader, MessageWriter, Method, RfcVariant};

use crate::backoff::{BackOffObserver, BackOffPattern, BackOffState, BackOffTimer};
use crate::config::Settings;
use crate::subscriptions::Subscription;

/// Typed attribute to carry on an outbound request.
#[derive(Debug, Clone)]
pub enum RequestAttr {
    Priority(u32),
    UseCandidate,
    IceControlling(u64),
    IceControlled(u64),
    RequestedTransport(Transport),
    Lifetime(u32),
    XorPeerAddress(SocketAddr),
    ChannelNumber(u16),
    Data(Vec<u8>),
    MobilityTicket(Vec<u8>),
    Software(String),
}

/// A request the requester can rebuild at will, which is what the
/// 401/438 credential dance needs: the retry reuses the method and
/// attributes but carries fresh realm, nonce, and integrity.
#[derive(Debug, Clone, Default)]
pub struct StunRequest {
    pub method: Option<Method>,
    pub attributes: Vec<RequestAttr>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
    pub nonce: Option<String>,
}

impl StunRequest {
    pub fn new(method: Method) -> Self {
        Self {
            method: Some(method),
            ..Default::default()
        }
    }

    pub fn attribute(mut self, attr: RequestAttr) -> Self {
        self.attributes.push(attr);
        self
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// the message-integrity key for the given variant, when the
    /// request has enough material to compute one.
    fn integrity_key(&self, variant: RfcVariant) -> Option<Vec<u8>> {
        match variant.credential_mechanism() {
            CredentialMechanism::None => None,
            CredentialMechanism::ShortTerm => {
                self.password.as_ref().map(|p| p.as_bytes().to_vec())
            }
            CredentialMechanism::LongTerm => {
                match (&self.username, &self.password, &self.realm) {
                    (Some(u), Some(p), Some(r)) => {
                        Some(long_term_credential_digest(u, p, r).to_vec())
                    }
                    _ => None,
                }
            }
        }
    }

    /// serialize the request under the given transaction id; also
    /// used for fire-and-forget messages that bypass the requester.
    pub fn to_packet(&self, token: &[u8; 12], variant: RfcVariant) -> Result<BytesMut, codec::Error> {
        let mut buf = BytesMut::with_capacity(1280);
        let method = self.method.unwrap_or(Method::Binding(Kind::Request));
        let mut writer = MessageWriter::new(method, token, &mut buf);

        for attr in self.attributes.iter() {
            match attr {
                RequestAttr::Priority(v) => writer.append::<Priority>(*v),
                RequestAttr::UseCandidate => writer.append::<UseCandidate>(()),
                RequestAttr::IceControlling(v) => writer.append::<IceControlling>(*v),
                RequestAttr::IceControlled(v) => writer.append::<IceControlled>(*v),
                RequestAttr::RequestedTransport(v) => writer.append::<RequestedTransport>(*v),
                RequestAttr::Lifetime(v) => writer.append::<Lifetime>(*v),
                RequestAttr::XorPeerAddress(v) => writer.append::<XorPeerAddress>(*v),
                RequestAttr::ChannelNumber(v) => writer.append::<ChannelNumber>(*v),
                RequestAttr::Data(v) => writer.append::<Data>(v),
                RequestAttr::MobilityTicket(v) => writer.append::<MobilityTicket>(v),
                RequestAttr::Software(v) => writer.append::<Software>(v),
            }
        }

        if let Some(username) = &self.username {
            writer.append::<UserName>(username);
        }

        if variant.credential_mechanism() == CredentialMechanism::LongTerm {
            if let Some(realm) = &self.realm {
                writer.append::<Realm>(realm);
            }

            if let Some(nonce) = &self.nonce {
                writer.append::<Nonce>(nonce);
            }
        }

        let key = self.integrity_key(variant);
        writer.flush(key.as_deref())?;

        Ok(buf)
    }
}

/// Events from a [`StunRequester`].
///
/// `on_send` does the actual transmission; the requester has no socket
/// of its own so the owner routes the bytes over whatever transport
/// the request belongs to.
pub trait RequesterObserver: Send + Sync {
    fn on_send(&self, requester: &Arc<StunRequester>, destination: SocketAddr, packet: &[u8]);

    /// a matching response arrived (success or error other than the
    /// credential retry the requester absorbs itself).
    fn on_response(
        &self,
        requester: &Arc<StunRequester>,
        from: SocketAddr,
        message: &MessageReader<'_, '_>,
    );

    fn on_timed_out(&self, requester: &Arc<StunRequester>);
}

pub struct StunRequesterOptions {
    pub server: SocketAddr,
    pub request: StunRequest,
    pub variant: RfcVariant,
    pub pattern: Option<BackOffPattern>,
}

/// the RFC 5389 retransmission schedule: RTO 500ms doubling per
/// attempt, capped, seven tries.
pub fn default_stun_pattern() -> BackOffPattern {
    BackOffPattern {
        max_attempts: 7,
        attempt_timeouts: vec![Duration::from_millis(500)],
        attempt_multiplier: 2.0,
        max_attempt_timeout: Duration::from_secs(16),
        retry_after: vec![Duration::ZERO],
        retry_multiplier: 1.0,
        max_retry_after: Duration::ZERO,
    }
}

struct RequesterState {
    request: StunRequest,
    token: [u8; 12],
    packet: BytesMut,
    auth_retries: u8,
    completed: bool,
    _timer_sub: Option<Subscription>,
}

/// One transactional STUN request with retransmission and credential
/// retry.
pub struct StunRequester {
    server: SocketAddr,
    variant: RfcVariant,
    timer: Arc<BackOffTimer>,
    observer: Arc<dyn RequesterObserver>,
    state: Mutex<RequesterState>,
}

/// forwards back-off edges into the requester without keeping it
/// alive.
struct TimerBridge(Weak<StunRequester>);

impl BackOffObserver for TimerBridge {
    fn on_state_changed(&self, state: BackOffState) {
        let Some(requester) = self.0.upgrade() else {
            return;
        };

        match state {
            BackOffState::AttemptNow => requester.send_now(),
            BackOffState::AllAttemptsFailed => requester.timed_out(),
            _ => {}
        }
    }
}

impl StunRequester {
    pub fn create(
        settings: &Settings,
        options: StunRequesterOptions,
        observer: Arc<dyn RequesterObserver>,
    ) -> Result<Arc<Self>, codec::Error> {
        let pattern = options.pattern.unwrap_or_else(default_stun_pattern);
        let timer = BackOffTimer::create(pattern, 0, settings);
        let token: [u8; 12] = rand::thread_rng().r#gen();
        let packet = options.request.to_packet(&token, options.variant)?;

        let requester = Arc::new(Self {
            server: options.server,
            variant: options.variant,
            timer,
            observer,
            state: Mutex::new(RequesterState {
                request: options.request,
                token,
                packet,
                auth_retries: 0,
                completed: false,
                _timer_sub: None,
            }),
        });

        let sub = requester
            .timer
            .subscribe(Arc::new(TimerBridge(Arc::downgrade(&requester))));
        requester.state.lock()._timer_sub = Some(sub);

        StunRequesterManager::singleton().register(&requester);
        requester.send_now();
        Ok(requester)
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn variant(&self) -> RfcVariant {
        self.variant
    }

    pub fn token(&self) -> [u8; 12] {
        self.state.lock().token
    }

    /// snapshot of the request as currently serialized, including any
    /// realm and nonce learned through the credential dance.
    pub fn request(&self) -> StunRequest {
        self.state.lock().request.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().completed
    }

    pub fn total_tries(&self) -> u32 {
        self.timer.total_failures()
    }

    /// process a packet that may answer this request; consumed iff it
    /// matches the in-flight transaction.
    pub fn handle_stun_packet(
        self: &Arc<Self>,
        from: SocketAddr,
        message: &MessageReader<'_, '_>,
    ) -> bool {
        enum Action {
            Retry([u8; 12]),
            Deliver,
        }

        let action = {
            let mut state = self.state.lock();
            if state.completed {
                return false;
            }

            if !message.is_valid_response_to(&state.token, self.variant) {
                return false;
            }

            // a 401/438 carrying fresh realm/nonce means "say that
            // again with credentials"; absorb one round of it.
            let stale = message.get::<ErrorCode>().filter(|e| {
                e.is(ErrKind::Unauthorized) || e.is(ErrKind::StaleNonce)
            });

            match stale {
                Some(_)
                    if state.auth_retries == 0
                        && self.variant.credential_mechanism() == CredentialMechanism::LongTerm
                        && message.get::<Realm>().is_some()
                        && message.get::<Nonce>().is_some() =>
                {
                    state.request.realm = message.get::<Realm>().map(|r| r.to_string());
                    state.request.nonce = message.get::<Nonce>().map(|n| n.to_string());

                    // fresh transaction for the authenticated retry.
                    let old_token = state.token;
                    let token: [u8; 12] = rand::thread_rng().r#gen();
                    match state.request.to_packet(&token, self.variant) {
                        Ok(packet) => {
                            state.auth_retries += 1;
                            state.token = token;
                            state.packet = packet;
                            Action::Retry(old_token)
                        }
                        Err(err) => {
                            log::warn!(
                                "stun requester could not rebuild credentials: err={}",
                                err
                            );

                            state.completed = true;
                            Action::Deliver
                        }
                    }
                }
                _ => {
                    state.completed = true;
                    Action::Deliver
                }
            }
        };

        match action {
            Action::Retry(old_token) => {
                log::debug!(
                    "stun requester retries with credentials: server={:?}",
                    self.server
                );

                StunRequesterManager::singleton().deregister_token(&old_token);
                StunRequesterManager::singleton().register(self);
                let packet = self.state.lock().packet.clone();
                self.observer.on_send(self, self.server, &packet);
            }
            Action::Deliver => {
                self.timer.notify_succeeded();
                StunRequesterManager::singleton().deregister(self);
                self.observer.on_response(self, from, message);
            }
        }

        true
    }

    /// idempotent teardown; a cancelled requester never reports
    /// anything again.
    pub fn cancel(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }

            state.completed = true;
        }

        self.timer.cancel();
        StunRequesterManager::singleton().deregister(self);
    }

    fn send_now(self: &Arc<Self>) {
        let packet = {
            let state = self.state.lock();
            if state.completed {
                return;
            }

            state.packet.clone()
        };

        log::trace!(
            "stun requester send: server={:?}, tries={}",
            self.server,
            self.timer.total_failures()
        );

        self.observer.on_send(self, self.server, &packet);
        self.timer.notify_attempting();
    }

    fn timed_out(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }

            state.completed = true;
        }

        log::debug!("stun requester timed out: server={:?}", self.server);
        StunRequesterManager::singleton().deregister(self);
        self.observer.on_timed_out(self);
    }
}

/// Process-wide index of in-flight requesters.
///
/// Keyed by `(magic cookie, transaction id)` so inbound packet
/// dispatch is a single O(1) lookup; requesters register on creation
/// and deregister on completion or cancel.
#[derive(Default)]
pub struct StunRequesterManager {
    map: RwLock<AHashMap<[u8; 12], Weak<StunRequester>>>,
}

static MANAGER: OnceLock<StunRequesterManager> = OnceLock::new();

impl StunRequesterManager {
    pub fn singleton() -> &'static Self {
        MANAGER.get_or_init(Self::default)
    }

    fn register(&self, requester: &Arc<StunRequester>) {
        self.map
            .write()
            .insert(requester.token(), Arc::downgrade(requester));
    }

    fn deregister(&self, requester: &Arc<StunRequester>) {
        self.map.write().remove(&requester.token());
    }

    fn deregister_token(&self, token: &[u8; 12]) {
        self.map.write().remove(token);
    }

    /// parse and dispatch an inbound packet; returns true when an
    /// in-flight requester consumed it.
    pub fn handle_packet(&self, from: SocketAddr, bytes: &[u8]) -> bool {
        let mut attributes = Attributes::default();
        let Ok(message) = MessageReader::decode(bytes, &mut attributes) else {
            return false;
        };

        self.handle_message(from, &message)
    }

    /// dispatch an already-parsed message; exactly one requester may
    /// consume it.
    pub fn handle_message(&self, from: SocketAddr, message: &MessageReader<'_, '_>) -> bool {
        if message.cookie != codec::COOKIE {
            return false;
        }

        let Ok(token) = <[u8; 12]>::try_from(message.token) else {
            return false;
        };

        let requester = { self.map.read().get(&token).and_then(|w| w.upgrade()) };
        let Some(requester) = requester else {
            log::trace!("stun response matches no requester: from={:?}", from);
            return false;
        };

        requester.handle_stun_packet(from, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Probe {
        sent: AtomicU32,
        responses: AtomicU32,
        timeouts: AtomicU32,
        last_packet: PlMutex<Vec<u8>>,
    }

    impl RequesterObserver for Probe {
        fn on_send(&self, _: &Arc<StunRequester>, _: SocketAddr, packet: &[u8]) {
            self.sent.fetch_add(1, Ordering::SeqCst);
            *self.last_packet.lock() = packet.to_vec();
        }

        fn on_response(&self, _: &Arc<StunRequester>, _: SocketAddr, _: &MessageReader<'_, '_>) {
            self.responses.fetch_add(1, Ordering::SeqCst);
        }

        fn on_timed_out(&self, _: &Arc<StunRequester>) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn server() -> SocketAddr {
        "1.2.3.4:3478".parse().unwrap()
    }

    fn short_pattern() -> BackOffPattern {
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

    #[tokio::test(start_paused = true)]
    async fn retransmits_then_times_out() {
        let settings = Settings::default();
        let probe = Arc::new(Probe::default());
        let requester = StunRequester::create(
            &settings,
            StunRequesterOptions {
                server: server(),
                request: StunRequest::new(Method::Binding(Kind::Request)),
                variant: RfcVariant::Rfc5389,
                pattern: Some(short_pattern()),
            },
            probe.clone(),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(probe.sent.load(Ordering::SeqCst), 3);
        assert_eq!(probe.timeouts.load(Ordering::SeqCst), 1);
        assert!(requester.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn matching_response_completes_the_transaction() {
        let settings = Settings::default();
        let probe = Arc::new(Probe::default());
        let requester = StunRequester::create(
            &settings,
            StunRequesterOptions {
                server: server(),
                request: StunRequest::new(Method::Binding(Kind::Request)),
                variant: RfcVariant::Rfc5389,
                pattern: Some(short_pattern()),
            },
            probe.clone(),
        )
        .unwrap();

        // craft the success response for the in-flight transaction.
        let token = requester.token();
        let mut buf = BytesMut::new();
        let mut writer = MessageWriter::new(Method::Binding(Kind::Response), &token, &mut buf);
        writer.flush(None).unwrap();

        assert!(StunRequesterManager::singleton().handle_packet(server(), &buf));
        assert_eq!(probe.responses.load(Ordering::SeqCst), 1);

        // a second copy of the response is dropped silently.
        assert!(!StunRequesterManager::singleton().handle_packet(server(), &buf));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_triggers_one_credential_retry() {
        let settings = Settings::default();
        let probe = Arc::new(Probe::default());
        let requester = StunRequester::create(
            &settings,
            StunRequesterOptions {
                server: server(),
                request: StunRequest::new(Method::Allocate(Kind::Request))
                    .credentials("panda", "raspberry")
                    .attribute(RequestAttr::RequestedTransport(Transport::UDP)),
                variant: RfcVariant::Rfc5766Turn,
                pattern: Some(short_pattern()),
            },
            probe.clone(),
        )
        .unwrap();

        let reply_401 = |token: &[u8; 12]| {
            let mut buf = BytesMut::new();
            let mut writer = MessageWriter::new(Method::Allocate(Kind::Error), token, &mut buf);
            writer.append::<ErrorCode>(codec::attribute::ErrorValue::from(ErrKind::Unauthorized));
            writer.append::<Realm>("example.org");
            writer.append::<Nonce>("f00dface");
            writer.flush(None).unwrap();
            buf
        };

        let first_token = requester.token();
        let buf = reply_401(&first_token);
        assert!(StunRequesterManager::singleton().handle_packet(server(), &buf));

        // absorbed: no response surfaced, a new authenticated send went
        // out under a fresh transaction id.
        assert_eq!(probe.responses.load(Ordering::SeqCst), 0);
        assert_eq!(probe.sent.load(Ordering::SeqCst), 2);
        assert_ne!(requester.token(), first_token);

        // the authenticated retry carries realm, nonce and integrity.
        let packet = probe.last_packet.lock().clone();
        let mut attributes = Attributes::default();
        let message = MessageReader::decode(&packet, &mut attributes).unwrap();
        assert_eq!(message.get::<Realm>(), Some("example.org"));
        assert_eq!(message.get::<Nonce>(), Some("f00dface"));
        assert!(message.get::<codec::attribute::MessageIntegrity>().is_some());

        // a second 401 is fatal: surfaced to the observer as the final
        // response.
        let buf = reply_401(&requester.token());
        assert!(StunRequesterManager::singleton().handle_packet(server(), &buf));
        assert_eq!(probe.responses.load(Ordering::SeqCst), 1);
        assert!(requester.is_complete());
    }
}
