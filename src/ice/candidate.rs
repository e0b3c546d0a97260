use std::fmt;
use std::net::SocketAddr;

/// ICE candidate type, in decreasing order of directness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    PeerReflexive,
    ServerReflexive,
    Relayed,
}

impl CandidateType {
    /// RFC 8445 recommended type preferences.
    pub fn preference(&self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relayed => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::PeerReflexive => "prflx",
            Self::ServerReflexive => "srflx",
            Self::Relayed => "relay",
        }
    }
}

/// A transport address proposed for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: CandidateType,
    /// equivalence class of candidates sharing a base and transport.
    pub foundation: String,
    pub component_id: u16,
    pub address: SocketAddr,
    pub priority: u32,
    pub local_preference: u16,
    /// the base this candidate derives from (host for srflx, mapped
    /// for relay), carried for diagnostics only.
    pub related: Option<SocketAddr>,
}

impl Candidate {
    /// build a candidate with the standard priority formula:
    /// `(type preference << 24) | (local preference << 8) |
    /// (256 - component id)`.
    ///
    /// ```
    /// use icelink::ice::{Candidate, CandidateType};
    ///
    /// let candidate = Candidate::new(
    ///     CandidateType::Host,
    ///     1,
    ///     "192.168.0.10:50000".parse().unwrap(),
    ///     65535,
    ///     None,
    /// );
    ///
    /// assert_eq!(candidate.priority, (126 << 24) | (65535 << 8) | 255);
    /// ```
    pub fn new(
        kind: CandidateType,
        component_id: u16,
        address: SocketAddr,
        local_preference: u16,
        related: Option<SocketAddr>,
    ) -> Self {
        let priority = (kind.preference() << 24)
            | ((local_preference as u32) << 8)
            | (256 - component_id.min(256) as u32);

        Self {
            foundation: foundation(kind, &address, related.as_ref()),
            kind,
            component_id,
            address,
            priority,
            local_preference,
            related,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.foundation, self.component_id, self.kind.as_str(), self.address
        )
    }
}

/// candidates sharing a base address and type share a foundation.
fn foundation(kind: CandidateType, address: &SocketAddr, related: Option<&SocketAddr>) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(address.ip().to_string().as_bytes());
    if let Some(related) = related {
        hasher.update(related.ip().to_string().as_bytes());
    }

    hasher.finalize().to_string()
}

/// candidate pair priority per RFC 8445 section 6.1.2.3:
/// `2^32 * min(G, D) + 2 * max(G, D) + (G > D ? 1 : 0)` where G is the
/// controlling side's candidate priority and D the controlled side's.
pub fn pair_priority(controlling: u32, controlled: u32) -> u64 {
    let g = controlling as u64;
    let d = controlled as u64;
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + if g > d { 1 } else { 0 }
}

/// stable checksum of an observable candidate set, used to suppress
/// duplicate change notifications.
pub fn candidate_set_crc(candidates: &[Candidate]) -> u32 {
    let mut lines: Vec<String> = candidates.iter().map(|c| c.to_string()).collect();
    lines.sort_unstable();

    let mut hasher = crc32fast::Hasher::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(port: u16) -> Candidate {
        Candidate::new(
            CandidateType::Host,
            1,
            format!("10.0.0.1:{}", port).parse().unwrap(),
            65535,
            None,
        )
    }

    #[test]
    fn priorities_order_by_type() {
        let host = host(1000);
        let srflx = Candidate::new(
            CandidateType::ServerReflexive,
            1,
            "1.2.3.4:1000".parse().unwrap(),
            65535,
            Some(host.address),
        );
        let relay = Candidate::new(
            CandidateType::Relayed,
            1,
            "5.6.7.8:49152".parse().unwrap(),
            65535,
            None,
        );

        assert!(host.priority > srflx.priority);
        assert!(srflx.priority > relay.priority);
    }

    #[test]
    fn pair_priority_is_symmetric_up_to_the_tiebreak_bit() {
        let a = pair_priority(1000, 2000);
        let b = pair_priority(2000, 1000);
        // same magnitude, the low bit says which side was higher.
        assert_eq!(a & !1, b & !1);
        assert_ne!(a & 1, b & 1);
    }

    #[test]
    fn same_base_same_foundation() {
        let a = host(1000);
        let b = host(2000);
        assert_eq!(a.foundation, b.foundation);

        let relay = Candidate::new(
            CandidateType::Relayed,
            1,
            "10.0.0.1:1000".parse().unwrap(),
            65535,
            None,
        );
        assert_ne!(a.foundation, relay.foundation);
    }

    #[test]
    fn set_crc_ignores_order() {
        let a = host(1000);
        let b = host(2000);
        let one = candidate_set_crc(&[a.clone(), b.clone()]);
        let two = candidate_set_crc(&[b, a]);
        assert_eq!(one, two);
    }
}
