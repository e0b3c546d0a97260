use ahash::AHashMap;

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::time::Instant;

/// Permissions last 5 minutes on the relay; renew with margin.
pub(crate) const PERMISSION_REFRESH: Duration = Duration::from_secs(4 * 60);

/// Channel bindings last 10 minutes on the relay; renew with margin.
pub(crate) const CHANNEL_REFRESH: Duration = Duration::from_secs(9 * 60);

/// Sends to one peer before a channel binding pays for itself.
pub(crate) const CHANNEL_TRAFFIC_THRESHOLD: u32 = 5;

/// Outbound packets parked per peer while its permission installs.
const MAX_PENDING_PACKETS: usize = 16;

pub(crate) const CHANNEL_RANGE: std::ops::RangeInclusive<u16> = 0x4000..=0x7FFF;

/// Per-peer permission bookkeeping.
///
/// The relay only forwards traffic to peers the client has installed a
/// permission for; the client batches installs, renews them on a
/// cadence, and parks outbound data for peers whose install is still
/// in flight.
pub(crate) struct Permissions {
    installed: AHashMap<IpAddr, Instant>,
    pending: AHashMap<IpAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    /// how many peers one CreatePermission may carry; lowered when the
    /// server answers 508.
    capacity: usize,
    in_flight: bool,
    last_refresh: Option<Instant>,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            installed: AHashMap::new(),
            pending: AHashMap::new(),
            capacity: 8,
            in_flight: false,
            last_refresh: None,
        }
    }
}

impl Permissions {
    pub fn is_installed(&self, ip: &IpAddr) -> bool {
        self.installed.contains_key(ip)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shrink_capacity(&mut self) {
        self.capacity = (self.capacity / 2).max(1);
    }

    pub fn set_in_flight(&mut self, value: bool) {
        self.in_flight = value;
    }

    /// park a packet for a peer whose permission is not installed yet;
    /// drops the oldest parked packet once the bound is hit.
    pub fn park(&mut self, peer: SocketAddr, bytes: Vec<u8>) {
        let queue = self.pending.entry(peer.ip()).or_default();
        if queue.len() >= MAX_PENDING_PACKETS {
            queue.pop_front();
        }

        queue.push_back((peer, bytes));
    }

    /// whether a CreatePermission request should go out now.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        if self.in_flight {
            return false;
        }

        if !self.pending.is_empty() {
            return true;
        }

        if self.installed.is_empty() {
            return false;
        }

        match self.last_refresh {
            None => true,
            Some(at) => now.duration_since(at) >= PERMISSION_REFRESH,
        }
    }

    /// the peer IPs the next CreatePermission should list, capped to
    /// the learned capacity.
    pub fn refresh_set(&self) -> Vec<IpAddr> {
        self.pending
            .keys()
            .chain(self.installed.keys())
            .copied()
            .take(self.capacity)
            .collect()
    }

    /// a CreatePermission listing `ips` succeeded; returns the parked
    /// packets now clear to transmit.
    pub fn installed_now(&mut self, ips: &[IpAddr], now: Instant) -> Vec<(SocketAddr, Vec<u8>)> {
        self.in_flight = false;
        self.last_refresh = Some(now);

        let mut released = Vec::new();
        for ip in ips {
            self.installed.insert(*ip, now);
            if let Some(queue) = self.pending.remove(ip) {
                released.extend(queue);
            }
        }

        released
    }

    pub fn clear(&mut self) {
        self.installed.clear();
        self.pending.clear();
        self.in_flight = false;
    }
}

pub(crate) struct ChannelBinding {
    pub number: u16,
    pub bound: bool,
    pub in_flight: bool,
    pub refresh_at: Instant,
    /// sends to the peer since the binding question last came up.
    pub traffic: u32,
}

/// Client-side channel binding table.
///
/// Channel numbers are allocated next-available with wrap-around in
/// the TURN range; once a binding confirms, outbound data to the peer
/// switches from Send indications to 4-byte channel-data framing.
pub(crate) struct Channels {
    by_peer: AHashMap<SocketAddr, ChannelBinding>,
    by_number: AHashMap<u16, SocketAddr>,
    next_number: u16,
}

impl Default for Channels {
    fn default() -> Self {
        Self {
            by_peer: AHashMap::new(),
            by_number: AHashMap::new(),
            next_number: *CHANNEL_RANGE.start(),
        }
    }
}

impl Channels {
    /// the bound channel number for a peer, when framing may be used.
    pub fn bound_number(&self, peer: &SocketAddr) -> Option<u16> {
        self.by_peer
            .get(peer)
            .filter(|b| b.bound)
            .map(|b| b.number)
    }

    pub fn peer_of(&self, number: u16) -> Option<SocketAddr> {
        self.by_number.get(&number).copied()
    }

    /// count one send toward the peer; true once traffic is sustained
    /// enough that a binding should be created.
    pub fn note_traffic(&mut self, peer: SocketAddr) -> bool {
        let binding = self.by_peer.entry(peer).or_insert_with(|| ChannelBinding {
            number: 0,
            bound: false,
            in_flight: false,
            refresh_at: Instant::now(),
            traffic: 0,
        });

        binding.traffic = binding.traffic.saturating_add(1);
        !binding.bound && !binding.in_flight && binding.traffic >= CHANNEL_TRAFFIC_THRESHOLD
    }

    /// next-available channel number, wrapping around the range.
    pub fn allocate_number(&mut self) -> Option<u16> {
        let span = *CHANNEL_RANGE.end() - *CHANNEL_RANGE.start() + 1;
        for _ in 0..span {
            let candidate = self.next_number;
            self.next_number = if candidate == *CHANNEL_RANGE.end() {
                *CHANNEL_RANGE.start()
            } else {
                candidate + 1
            };

            if !self.by_number.contains_key(&candidate) {
                return Some(candidate);
            }
        }

        None
    }

    /// a ChannelBind request for `peer` went out under `number`.
    pub fn bind_started(&mut self, peer: SocketAddr, number: u16) {
        self.by_number.insert(number, peer);
        if let Some(binding) = self.by_peer.get_mut(&peer) {
            binding.number = number;
            binding.in_flight = true;
        }
    }

    pub fn bind_confirmed(&mut self, peer: SocketAddr, now: Instant) {
        if let Some(binding) = self.by_peer.get_mut(&peer) {
            binding.bound = true;
            binding.in_flight = false;
            binding.refresh_at = now + CHANNEL_REFRESH;
        }
    }

    pub fn bind_failed(&mut self, peer: SocketAddr) {
        if let Some(binding) = self.by_peer.get_mut(&peer) {
            let number = binding.number;
            self.by_number.remove(&number);
            binding.number = 0;
            binding.bound = false;
            binding.in_flight = false;
            binding.traffic = 0;
        }
    }

    /// peers whose sustained traffic earned a binding.
    pub fn due_for_binding(&self) -> Vec<SocketAddr> {
        self.by_peer
            .iter()
            .filter(|(_, b)| !b.bound && !b.in_flight && b.traffic >= CHANNEL_TRAFFIC_THRESHOLD)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// bound peers whose refresh window arrived.
    pub fn due_for_refresh(&self, now: Instant) -> Vec<(SocketAddr, u16)> {
        self.by_peer
            .iter()
            .filter(|(_, b)| b.bound && !b.in_flight && now >= b.refresh_at)
            .map(|(peer, b)| (*peer, b.number))
            .collect()
    }

    pub fn refresh_started(&mut self, peer: SocketAddr) {
        if let Some(binding) = self.by_peer.get_mut(&peer) {
            binding.in_flight = true;
        }
    }

    pub fn clear(&mut self) {
        self.by_peer.clear();
        self.by_number.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::from([10, 0, 0, last]), port)
    }

    #[test]
    fn channel_numbers_wrap_next_available() {
        let mut channels = Channels::default();
        assert_eq!(channels.allocate_number(), Some(0x4000));
        assert_eq!(channels.allocate_number(), Some(0x4001));

        // numbers only burn once a bind starts.
        channels.note_traffic(peer(1, 1000));
        channels.bind_started(peer(1, 1000), 0x4002);
        assert_eq!(channels.allocate_number(), Some(0x4003));
    }

    #[test]
    fn sustained_traffic_earns_a_binding() {
        let mut channels = Channels::default();
        let p = peer(1, 1000);

        for _ in 0..CHANNEL_TRAFFIC_THRESHOLD - 1 {
            channels.note_traffic(p);
        }
        assert!(channels.due_for_binding().is_empty());

        channels.note_traffic(p);
        assert_eq!(channels.due_for_binding(), vec![p]);

        channels.bind_started(p, 0x4000);
        channels.bind_confirmed(p, Instant::now());
        assert_eq!(channels.bound_number(&p), Some(0x4000));
        assert_eq!(channels.peer_of(0x4000), Some(p));
    }

    #[test]
    fn parked_packets_release_on_install() {
        let mut permissions = Permissions::default();
        let p = peer(2, 2000);

        permissions.park(p, vec![1]);
        permissions.park(p, vec![2]);
        assert!(permissions.needs_refresh(Instant::now()));

        let released = permissions.installed_now(&[p.ip()], Instant::now());
        assert_eq!(released.len(), 2);
        assert!(permissions.is_installed(&p.ip()));
        assert!(!permissions.needs_refresh(Instant::now()));
    }

    #[test]
    fn parked_packets_are_bounded() {
        let mut permissions = Permissions::default();
        let p = peer(3, 3000);

        for i in 0..40u8 {
            permissions.park(p, vec![i]);
        }

        let released = permissions.installed_now(&[p.ip()], Instant::now());
        assert_eq!(released.len(), MAX_PENDING_PACKETS);
        // oldest packets were shed first.
        assert_eq!(released[0].1, vec![24]);
    }

    #[test]
    fn capacity_shrinks_but_never_hits_zero() {
        let mut permissions = Permissions::default();
        for _ in 0..10 {
            permissions.shrink_capacity();
        }

        assert_eq!(permissions.capacity(), 1);
    }
}
