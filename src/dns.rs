use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use tokio::net::lookup_host;

/// One SRV answer, already chased down to addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
    pub ips: Vec<IpAddr>,
}

pub type Lookup = Pin<Box<dyn Future<Output = anyhow::Result<Vec<SrvRecord>>> + Send>>;

/// Name resolution capability.
///
/// Resolution stays outside this library; hosts inject whatever
/// resolver they run.  Queries are cancelled by dropping the returned
/// future.  `service`/`proto` follow SRV naming (`_stun`, `_udp`).
pub trait SrvResolver: Send + Sync {
    fn lookup_srv(&self, service: &str, proto: &str, name: &str, default_port: u16) -> Lookup;
}

/// A resolver backed by the system's A/AAAA lookup.
///
/// Real SRV queries need a richer resolver; this fallback fabricates a
/// single record at the default port, which is how every public STUN
/// and TURN deployment answers anyway.
#[derive(Default)]
pub struct SystemResolver;

impl SrvResolver for SystemResolver {
    fn lookup_srv(&self, _service: &str, _proto: &str, name: &str, default_port: u16) -> Lookup {
        let name = name.to_string();
        Box::pin(async move {
            let ips: Vec<IpAddr> = lookup_host((name.as_str(), default_port))
                .await?
                .map(|a| a.ip())
                .collect();

            if ips.is_empty() {
                anyhow::bail!("no addresses for {}", name);
            }

            Ok(vec![SrvRecord {
                priority: 0,
                weight: 0,
                port: default_port,
                target: name,
                ips,
            }])
        })
    }
}

/// A fixed result resolver, mostly for tests and for callers that
/// already did the lookup out of band.
pub struct StaticResolver(pub Vec<SrvRecord>);

impl SrvResolver for StaticResolver {
    fn lookup_srv(&self, _service: &str, _proto: &str, _name: &str, _default_port: u16) -> Lookup {
        let records = self.0.clone();
        Box::pin(async move { Ok(records) })
    }
}
