use serde::Deserialize;

use std::net::IpAddr;
use std::time::Duration;

/// Which transport a TURN client may probe.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ForcedTransport {
    Udp,
    Tcp,
}

/// Library-wide semantic options.
///
/// Every field has a serving default so an empty `{}` document is a
/// valid configuration; hosts usually load this once at startup and
/// share it behind an `Arc`.
#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    /// how long TURN allocations stay warm after the last wakeup
    /// before the socket lets them lapse.
    ///
    /// relays bill by allocation time, so an idle socket tears its
    /// allocations down once no session needed them for this long.
    #[serde(default = "Settings::turn_alive_after_wake_secs")]
    pub turn_alive_after_wake_secs: u64,

    /// restrict TURN probing to a single transport.
    #[serde(default)]
    pub force_turn_transport: Option<ForcedTransport>,

    /// debugging ACL: when non-empty, TURN egress is dropped unless
    /// the peer IP is listed here.
    #[serde(default)]
    pub only_allow_turn_peers: Vec<IpAddr>,

    /// priority order of local interface name prefixes when
    /// gathering; unlisted interfaces sort last.
    #[serde(default = "Settings::interface_name_order")]
    pub interface_name_order: Vec<String>,

    /// include AAAA candidates.
    #[serde(default)]
    pub support_ipv6: bool,

    /// how long an ICE socket tolerates having no usable local IP
    /// before it errors out.
    #[serde(default = "Settings::max_rebind_duration_secs")]
    pub max_rebind_duration_secs: u64,

    /// fail the socket when local IPs stay missing past the rebind
    /// window; otherwise it keeps retrying forever.
    #[serde(default = "Settings::yes")]
    pub error_on_missing_local_ips: bool,

    /// backgrounding subscription phase of ICE sessions.
    #[serde(default = "Settings::ice_backgrounding_phase")]
    pub ice_backgrounding_phase: u8,

    /// backgrounding subscription phase of stream messaging users.
    #[serde(default = "Settings::tcp_backgrounding_phase")]
    pub tcp_backgrounding_phase: u8,

    /// cap on the "failures thus far" a back-off timer may be
    /// constructed with.
    #[serde(default = "Settings::backoff_max_constructor_failures")]
    pub backoff_max_constructor_failures: u32,

    /// seconds between sender key changes on an MLS channel.
    #[serde(default = "Settings::mls_rotation_interval_secs")]
    pub mls_rotation_interval_secs: u64,

    /// opt-in to the legacy passphrase-only IV derivation.  Leave off
    /// unless talking to a peer that never upgraded.
    #[serde(default)]
    pub mls_legacy_passphrase_iv: bool,

    /// ICE keep-alive indication interval over the nominated pair.
    #[serde(default = "Settings::ice_keep_alive_secs")]
    pub ice_keep_alive_secs: u64,

    /// how long an ICE session tolerates silence before probing the
    /// nominated pair with a Binding request.
    #[serde(default = "Settings::ice_expect_traffic_within_secs")]
    pub ice_expect_traffic_within_secs: u64,

    /// timeout of that aliveness Binding request.
    #[serde(default = "Settings::ice_aliveness_timeout_secs")]
    pub ice_aliveness_timeout_secs: u64,

    /// maximum period an ICE session may sit in the background before
    /// resume declares it failed.
    #[serde(default = "Settings::ice_backgrounding_timeout_secs")]
    pub ice_backgrounding_timeout_secs: u64,

    /// initial period of the RUDP baton add-back timer; doubles on
    /// each congestion event.
    #[serde(default = "Settings::rudp_addback_initial_ms")]
    pub rudp_addback_initial_ms: u64,

    /// ceiling of the doubled add-back period.
    #[serde(default = "Settings::rudp_addback_max_ms")]
    pub rudp_addback_max_ms: u64,

    /// issue-free sending period after which the add-back period
    /// shrinks back toward its floor.
    #[serde(default = "Settings::rudp_clean_period_ms")]
    pub rudp_clean_period_ms: u64,

    /// total bytes the RUDP receive buffer may hold out of order.
    #[serde(default = "Settings::rudp_max_receive_bytes")]
    pub rudp_max_receive_bytes: usize,
}

impl Settings {
    fn turn_alive_after_wake_secs() -> u64 {
        60
    }

    fn interface_name_order() -> Vec<String> {
        ["lo", "en", "eth", "wlan", "ppp"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn max_rebind_duration_secs() -> u64 {
        60
    }

    fn yes() -> bool {
        true
    }

    fn ice_backgrounding_phase() -> u8 {
        4
    }

    fn tcp_backgrounding_phase() -> u8 {
        3
    }

    fn backoff_max_constructor_failures() -> u32 {
        10
    }

    fn mls_rotation_interval_secs() -> u64 {
        3600
    }

    fn ice_keep_alive_secs() -> u64 {
        15
    }

    fn ice_expect_traffic_within_secs() -> u64 {
        60
    }

    fn ice_aliveness_timeout_secs() -> u64 {
        10
    }

    fn ice_backgrounding_timeout_secs() -> u64 {
        120
    }

    fn rudp_addback_initial_ms() -> u64 {
        1000
    }

    fn rudp_addback_max_ms() -> u64 {
        60_000
    }

    fn rudp_clean_period_ms() -> u64 {
        10_000
    }

    fn rudp_max_receive_bytes() -> usize {
        16 * 1024 * 1024
    }

    /// load settings from a JSON document.
    pub fn from_str(source: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn turn_alive_after_wake(&self) -> Duration {
        Duration::from_secs(self.turn_alive_after_wake_secs)
    }

    pub fn max_rebind_duration(&self) -> Duration {
        Duration::from_secs(self.max_rebind_duration_secs)
    }

    pub fn mls_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.mls_rotation_interval_secs)
    }

    pub fn ice_keep_alive(&self) -> Duration {
        Duration::from_secs(self.ice_keep_alive_secs)
    }

    pub fn ice_expect_traffic_within(&self) -> Duration {
        Duration::from_secs(self.ice_expect_traffic_within_secs)
    }

    pub fn ice_aliveness_timeout(&self) -> Duration {
        Duration::from_secs(self.ice_aliveness_timeout_secs)
    }

    pub fn ice_backgrounding_timeout(&self) -> Duration {
        Duration::from_secs(self.ice_backgrounding_timeout_secs)
    }

    pub fn rudp_addback_initial(&self) -> Duration {
        Duration::from_millis(self.rudp_addback_initial_ms)
    }

    pub fn rudp_addback_max(&self) -> Duration {
        Duration::from_millis(self.rudp_addback_max_ms)
    }

    pub fn rudp_clean_period(&self) -> Duration {
        Duration::from_millis(self.rudp_clean_period_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty settings document")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_valid() {
        let settings = Settings::from_str("{}").unwrap();
        assert_eq!(settings.turn_alive_after_wake_secs, 60);
        assert!(settings.force_turn_transport.is_none());
        assert!(!settings.support_ipv6);
    }

    #[test]
    fn forced_transport_parses() {
        let settings = Settings::from_str(r#"{"force_turn_transport": "tcp"}"#).unwrap();
        assert_eq!(settings.force_turn_transport, Some(ForcedTransport::Tcp));
    }
}
