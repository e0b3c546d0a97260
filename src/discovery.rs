use parking_lot::Mutex;

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::AHashSet;

use codec::attribute::{AlternateServer, MappedAddress, XorMappedAddress};
use codec::{Kind, MessageReader, Method, RfcVariant};

use crate::backoff::BackOffPattern;
use crate::config::Settings;
use crate::dns::{SrvRecord, SrvResolver};
use crate::requester::{RequesterObserver, StunRequest, StunRequester, StunRequesterOptions};
use crate::uri::parse_server_uri;

pub const STUN_DEFAULT_PORT: u16 = 3478;

/// Which address family the discovery should chase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupKind {
    #[default]
    Any,
    Ipv4Only,
    Ipv6Only,
}

impl LookupKind {
    fn admits(&self, ip: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::Ipv4Only => ip.is_ipv4(),
            Self::Ipv6Only => ip.is_ipv6(),
        }
    }
}

#[derive(Default)]
pub struct StunDiscoveryOptions {
    /// `stun:` URIs or bare `host[:port]` references, tried in order.
    pub servers: Vec<String>,
    /// pre-resolved SRV answers, skipping the resolver entirely.
    pub srv_result: Option<Vec<SrvRecord>>,
    /// when set, keep pinging the winning server this often and
    /// re-report whenever the mapped address moves.
    pub keep_warm_interval: Option<Duration>,
    pub lookup: LookupKind,
    pub variant: RfcVariant,
    pub pattern: Option<BackOffPattern>,
}

pub trait DiscoveryObserver: Send + Sync {
    fn on_send(&self, discovery: &Arc<StunDiscovery>, destination: SocketAddr, packet: &[u8]);

    /// the discovery finished a pass; `mapped` is empty when every
    /// server was exhausted without an answer.
    fn on_completed(&self, discovery: &Arc<StunDiscovery>, mapped: Option<SocketAddr>);
}

struct DiscoveryState {
    pending: VecDeque<SocketAddr>,
    /// every server IP already contacted; redirects back into this
    /// set are refused so two misconfigured servers cannot bounce the
    /// discovery between themselves forever.
    contacted: AHashSet<IpAddr>,
    current: Option<Arc<StunRequester>>,
    active_server: Option<SocketAddr>,
    mapped: Option<SocketAddr>,
    cancelled: bool,
}

/// Server-reflexive address discovery.
///
/// Walks the configured STUN servers one at a time, issuing a Binding
/// request per server through a [`StunRequester`], following alternate
/// server redirects, and reporting the first mapped address learned.
/// With a keep-warm interval it keeps the NAT binding open afterwards
/// and notices when the mapping changes.
pub struct StunDiscovery {
    settings: Arc<Settings>,
    variant: RfcVariant,
    pattern: Option<BackOffPattern>,
    keep_warm: Option<Duration>,
    observer: Arc<dyn DiscoveryObserver>,
    state: Mutex<DiscoveryState>,
}

/// routes requester events back into the discovery.
struct RequesterBridge(Weak<StunDiscovery>);

impl RequesterObserver for RequesterBridge {
    fn on_send(&self, _: &Arc<StunRequester>, destination: SocketAddr, packet: &[u8]) {
        if let Some(discovery) = self.0.upgrade() {
            discovery.observer.on_send(&discovery, destination, packet);
        }
    }

    fn on_response(
        &self,
        requester: &Arc<StunRequester>,
        from: SocketAddr,
        message: &MessageReader<'_, '_>,
    ) {
        if let Some(discovery) = self.0.upgrade() {
            discovery.handle_response(requester, from, message);
        }
    }

    fn on_timed_out(&self, _: &Arc<StunRequester>) {
        if let Some(discovery) = self.0.upgrade() {
            log::debug!("stun discovery server timed out, moving on");
            discovery.try_next_server();
        }
    }
}

impl StunDiscovery {
    pub fn create(
        settings: Arc<Settings>,
        resolver: Arc<dyn SrvResolver>,
        options: StunDiscoveryOptions,
        observer: Arc<dyn DiscoveryObserver>,
    ) -> Arc<Self> {
        let discovery = Arc::new(Self {
            settings,
            variant: options.variant,
            pattern: options.pattern.clone(),
            keep_warm: options.keep_warm_interval,
            observer,
            state: Mutex::new(DiscoveryState {
                pending: VecDeque::new(),
                contacted: AHashSet::new(),
                current: None,
                active_server: None,
                mapped: None,
                cancelled: false,
            }),
        });

        let lookup = options.lookup;
        let weak = Arc::downgrade(&discovery);
        tokio::spawn(async move {
            let records = match options.srv_result {
                Some(records) => records,
                None => resolve_all(resolver, &options.servers).await,
            };

            let Some(discovery) = weak.upgrade() else {
                return;
            };

            {
                let mut state = discovery.state.lock();
                for record in records.iter() {
                    for ip in record.ips.iter().filter(|ip| lookup.admits(ip)) {
                        state.pending.push_back(SocketAddr::new(*ip, record.port));
                    }
                }
            }

            discovery.try_next_server();
        });

        discovery
    }

    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.state.lock().mapped
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn cancel(&self) {
        let current = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }

            state.cancelled = true;
            state.pending.clear();
            state.current.take()
        };

        if let Some(requester) = current {
            requester.cancel();
        }
    }

    fn try_next_server(self: &Arc<Self>) {
        let next = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }

            state.current = None;
            loop {
                match state.pending.pop_front() {
                    None => break None,
                    Some(server) if state.contacted.contains(&server.ip()) => continue,
                    Some(server) => {
                        state.contacted.insert(server.ip());
                        break Some(server);
                    }
                }
            }
        };

        match next {
            Some(server) => self.send_binding(server),
            None => {
                // every server exhausted; report the empty result and
                // let the caller decide what that means.
                log::debug!("stun discovery exhausted all servers");
                self.observer.on_completed(self, None);
            }
        }
    }

    fn send_binding(self: &Arc<Self>, server: SocketAddr) {
        log::debug!("stun discovery binding: server={:?}", server);

        let requester = match StunRequester::create(
            &self.settings,
            StunRequesterOptions {
                server,
                request: StunRequest::new(Method::Binding(Kind::Request)),
                variant: self.variant,
                pattern: self.pattern.clone(),
            },
            Arc::new(RequesterBridge(Arc::downgrade(self))),
        ) {
            Ok(requester) => requester,
            Err(err) => {
                log::warn!("stun discovery request rejected: err={}", err);
                self.try_next_server();
                return;
            }
        };

        let mut state = self.state.lock();
        if state.cancelled {
            drop(state);
            requester.cancel();
            return;
        }

        state.active_server = Some(server);
        state.current = Some(requester);
    }

    fn handle_response(
        self: &Arc<Self>,
        requester: &Arc<StunRequester>,
        _from: SocketAddr,
        message: &MessageReader<'_, '_>,
    ) {
        // alternate server redirect; refuse any address we have
        // already knocked on.
        if let Some(alternate) = message.get::<AlternateServer>() {
            let accepted = {
                let mut state = self.state.lock();
                if state.contacted.contains(&alternate.ip()) {
                    false
                } else {
                    state.pending.push_front(alternate);
                    true
                }
            };

            log::debug!(
                "stun discovery redirect: alternate={:?}, accepted={}",
                alternate,
                accepted
            );

            self.try_next_server();
            return;
        }

        let mapped = message
            .get::<XorMappedAddress>()
            .or_else(|| message.get::<MappedAddress>());

        match mapped {
            None => self.try_next_server(),
            Some(mapped) => {
                let changed = {
                    let mut state = self.state.lock();
                    if state.cancelled {
                        return;
                    }

                    state.current = None;
                    let changed = state.mapped != Some(mapped);
                    state.mapped = Some(mapped);
                    changed
                };

                log::debug!(
                    "stun discovery mapped: mapped={:?}, server={:?}, changed={}",
                    mapped,
                    requester.server(),
                    changed
                );

                if changed {
                    self.observer.on_completed(self, Some(mapped));
                }

                self.schedule_keep_warm(requester.server());
            }
        }
    }

    fn schedule_keep_warm(self: &Arc<Self>, server: SocketAddr) {
        let Some(interval) = self.keep_warm else {
            return;
        };

        if interval.is_zero() {
            return;
        }

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(discovery) = weak.upgrade() else {
                return;
            };

            if discovery.state.lock().cancelled {
                return;
            }

            discovery.send_binding(server);
        });
    }
}

async fn resolve_all(resolver: Arc<dyn SrvResolver>, servers: &[String]) -> Vec<SrvRecord> {
    let mut records = Vec::new();
    for server in servers {
        let uri = match parse_server_uri(server) {
            Ok(uri) => uri,
            Err(err) => {
                log::warn!("bad stun server reference: server={:?}, err={}", server, err);
                continue;
            }
        };

        let port = uri.port.unwrap_or(STUN_DEFAULT_PORT);
        match resolver.lookup_srv("_stun", "_udp", &uri.host, port).await {
            Ok(answer) => records.extend(answer),
            Err(err) => {
                log::warn!("stun srv lookup failed: host={:?}, err={}", uri.host, err);
            }
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticResolver;
    use bytes::BytesMut;
    use codec::MessageWriter;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Probe {
        destinations: PlMutex<Vec<SocketAddr>>,
        tokens: PlMutex<Vec<[u8; 12]>>,
        completions: PlMutex<Vec<Option<SocketAddr>>>,
        sends: AtomicU32,
    }

    impl DiscoveryObserver for Probe {
        fn on_send(&self, _: &Arc<StunDiscovery>, destination: SocketAddr, packet: &[u8]) {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.destinations.lock().push(destination);
            self.tokens
                .lock()
                .push(packet[8..20].try_into().expect("transaction id"));
        }

        fn on_completed(&self, _: &Arc<StunDiscovery>, mapped: Option<SocketAddr>) {
            self.completions.lock().push(mapped);
        }
    }

    fn record(ip: &str, port: u16) -> SrvRecord {
        SrvRecord {
            priority: 0,
            weight: 0,
            port,
            target: ip.to_string(),
            ips: vec![ip.parse().unwrap()],
        }
    }

    fn quick_pattern() -> BackOffPattern {
        BackOffPattern {
            max_attempts: 2,
            attempt_timeouts: vec![Duration::from_millis(100)],
            attempt_multiplier: 1.0,
            max_attempt_timeout: Duration::from_millis(100),
            retry_after: vec![Duration::ZERO],
            retry_multiplier: 1.0,
            max_retry_after: Duration::ZERO,
        }
    }

    fn respond(probe: &Probe, which: usize, mapped: SocketAddr) {
        let token = probe.tokens.lock()[which];
        let from = probe.destinations.lock()[which];
        let mut buf = BytesMut::new();
        let mut writer = MessageWriter::new(Method::Binding(Kind::Response), &token, &mut buf);
        writer.append::<XorMappedAddress>(mapped);
        writer.flush(None).unwrap();

        assert!(
            crate::requester::StunRequesterManager::singleton().handle_packet(from, &buf)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_answering_server_wins() {
        let probe = Arc::new(Probe::default());
        let _discovery = StunDiscovery::create(
            Arc::new(Settings::default()),
            Arc::new(StaticResolver(vec![record("1.2.3.4", 3478)])),
            StunDiscoveryOptions {
                srv_result: Some(vec![record("1.2.3.4", 3478)]),
                pattern: Some(quick_pattern()),
                ..Default::default()
            },
            probe.clone(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probe.sends.load(Ordering::SeqCst), 1);

        let mapped: SocketAddr = "9.9.9.9:40000".parse().unwrap();
        respond(&probe, 0, mapped);

        assert_eq!(probe.completions.lock().as_slice(), &[Some(mapped)]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_empty_mapped_address() {
        let probe = Arc::new(Probe::default());
        let _discovery = StunDiscovery::create(
            Arc::new(Settings::default()),
            Arc::new(StaticResolver(Vec::new())),
            StunDiscoveryOptions {
                srv_result: Some(vec![record("1.2.3.4", 3478), record("5.6.7.8", 3478)]),
                pattern: Some(quick_pattern()),
                ..Default::default()
            },
            probe.clone(),
        );

        // let both servers time out (2 attempts x 100ms each).
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(probe.sends.load(Ordering::SeqCst) >= 2);
        assert_eq!(probe.completions.lock().as_slice(), &[None]);
    }
}
