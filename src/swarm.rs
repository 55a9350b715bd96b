use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long a connection must live to not count as a quick disconnect.
const QUICK_DISCONNECT_WINDOW: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Pex,
    Dht,
    Lpd,
    Incoming,
    Manual,
    MagnetHint,
}

impl PeerSource {
    pub fn name(&self) -> &'static str {
        match self {
            PeerSource::Tracker => "tracker",
            PeerSource::Pex => "pex",
            PeerSource::Dht => "dht",
            PeerSource::Lpd => "lpd",
            PeerSource::Incoming => "incoming",
            PeerSource::Manual => "manual",
            PeerSource::MagnetHint => "magnet_hint",
        }
    }

    fn score_bonus(&self) -> i64 {
        match self {
            PeerSource::Manual => 20,
            PeerSource::Lpd => 15,
            PeerSource::Tracker => 10,
            PeerSource::Incoming => 5,
            PeerSource::Pex => 0,
            PeerSource::Dht => -5,
            PeerSource::MagnetHint => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    Failed,
    Banned,
}

impl Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PeerState::Idle => "idle",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Failed => "failed",
            PeerState::Banned => "banned",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanReason {
    /// Proven bad data (suspicion threshold crossed).
    DataCorruption,
    /// Host decision, independent of anything the peer sent.
    Manual,
}

impl BanReason {
    /// Recoverable bans may be lifted when the swarm runs dry; corruption
    /// never is.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, BanReason::DataCorruption)
    }
}

/// Non-owning handle to a live peer connection. Dropping the peer is a
/// cancellation notification, never a deref of owned state.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub uuid: Uuid,
    pub cancel: CancellationToken,
}

/// One known swarm address and everything we remember about it.
#[derive(Debug)]
pub struct SwarmPeer {
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub discovered_at: Instant,
    state: PeerState,
    link: Option<PeerLink>,
    pub peer_id: Option<[u8; 20]>,
    pub client_name: Option<String>,
    pub country: Option<String>,
    pub connect_attempts: u32,
    pub connect_failures: u32,
    pub last_attempt: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_error: Option<String>,
    pub quick_disconnects: u32,
    pub last_disconnect: Option<Instant>,
    pub rejection_count: u32,
    pub ban_reason: Option<BanReason>,
    pub suspicious_port: bool,
    pub downloaded: u64,
    pub uploaded: u64,
}

impl SwarmPeer {
    fn new(addr: SocketAddr, source: PeerSource, suspicious_port: bool, now: Instant) -> Self {
        Self {
            addr,
            source,
            discovered_at: now,
            state: PeerState::Idle,
            link: None,
            peer_id: None,
            client_name: None,
            country: None,
            connect_attempts: 0,
            connect_failures: 0,
            last_attempt: None,
            last_success: None,
            last_error: None,
            quick_disconnects: 0,
            last_disconnect: None,
            rejection_count: 0,
            ban_reason: None,
            suspicious_port,
            downloaded: 0,
            uploaded: 0,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn link(&self) -> Option<&PeerLink> {
        self.link.as_ref()
    }

    fn backoff(&self) -> Duration {
        let failures = match self.state {
            PeerState::Failed => self.connect_failures,
            // idle peers that keep disconnecting right away get the same
            // treatment as failed ones
            PeerState::Idle => self.quick_disconnects,
            _ => return Duration::ZERO,
        };
        if failures == 0 {
            return Duration::ZERO;
        }
        (BACKOFF_BASE * 2u32.saturating_pow(failures.min(16))).min(BACKOFF_CAP)
    }

    fn in_backoff(&self, now: Instant) -> bool {
        let since = match self.state {
            PeerState::Failed => self.last_attempt,
            PeerState::Idle if self.quick_disconnects > 0 => self.last_disconnect,
            _ => return false,
        };
        match since {
            Some(at) => now.saturating_duration_since(at) < self.backoff(),
            None => false,
        }
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        match self.state {
            PeerState::Idle | PeerState::Failed => !self.in_backoff(now),
            PeerState::Connecting | PeerState::Connected | PeerState::Banned => false,
        }
    }

    /// Connect-priority score, higher wins. Weighs history, source and a
    /// dash of jitter so equal peers rotate.
    pub fn score(&self, now: Instant) -> i64 {
        use rand::Rng;
        let mut score: i64 = 100;
        if self.suspicious_port {
            score -= 25;
        }
        if self.last_success.is_some() {
            score += 50;
        }
        score -= self.connect_failures as i64 * 20;
        if self.downloaded > 0 {
            score += (((self.downloaded as f64).log10() * 5.0) as i64).min(50);
        }
        if let Some(last_attempt) = self.last_attempt {
            let since = now.saturating_duration_since(last_attempt);
            if since < Duration::from_secs(30) {
                score -= 50;
            } else if since < Duration::from_secs(120) {
                score -= 15;
            }
        }
        score += self.source.score_bonus();
        score + rand::rng().random_range(0..8)
    }
}

/// Why an address was refused at the door.
#[derive(Debug, PartialEq, Eq)]
pub enum AddrRejection {
    InvalidIp,
    InvalidPort,
}

/// Canonical per-torrent peer database, keyed by socket address. Keeps
/// state-indexed sets so connected/connecting counts are O(1), plus an
/// identity index from peer id to every address it was seen at.
#[derive(Debug, Default)]
pub struct Swarm {
    peers: HashMap<SocketAddr, SwarmPeer>,
    connected: HashSet<SocketAddr>,
    connecting: HashSet<SocketAddr>,
    identity: HashMap<String, HashSet<SocketAddr>>,
}

fn validate_addr(addr: &SocketAddr) -> Result<bool, AddrRejection> {
    if addr.port() == 0 {
        return Err(AddrRejection::InvalidPort);
    }
    let valid = match addr.ip() {
        IpAddr::V4(ip) => {
            !ip.is_multicast() && !ip.is_broadcast() && !ip.is_unspecified() && ip.octets()[0] != 0
        }
        IpAddr::V6(ip) => !ip.is_multicast() && !ip.is_unspecified(),
    };
    if !valid {
        return Err(AddrRejection::InvalidIp);
    }
    Ok(addr.port() < 1024)
}

impl Swarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&SwarmPeer> {
        self.peers.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut SwarmPeer> {
        self.peers.get_mut(addr)
    }

    pub fn peers(&self) -> impl Iterator<Item = &SwarmPeer> {
        self.peers.values()
    }

    /// Register a discovered address. The first source wins; re-adding an
    /// existing key is a no-op. Returns whether the peer is new.
    pub fn add_peer(&mut self, addr: SocketAddr, source: PeerSource, now: Instant) -> bool {
        let suspicious = match validate_addr(&addr) {
            Ok(suspicious) => suspicious,
            Err(rejection) => {
                tracing::debug!(%addr, ?rejection, "Dropping invalid peer address");
                return false;
            }
        };
        match self.peers.entry(addr) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(SwarmPeer::new(addr, source, suspicious, now));
                true
            }
        }
    }

    /// Reserve the slot before the socket exists so an incoming connection
    /// from the same address cannot race the dial.
    pub fn mark_connecting(&mut self, addr: &SocketAddr, now: Instant) -> bool {
        let Some(peer) = self.peers.get_mut(addr) else {
            return false;
        };
        match peer.state {
            PeerState::Idle | PeerState::Failed => {
                peer.state = PeerState::Connecting;
                peer.connect_attempts += 1;
                peer.last_attempt = Some(now);
                self.connecting.insert(*addr);
                true
            }
            state => {
                tracing::warn!(%addr, %state, "Refusing connecting transition");
                false
            }
        }
    }

    /// Connecting (outbound) or idle (accepted incoming) to connected.
    pub fn mark_connected(&mut self, addr: &SocketAddr, link: PeerLink, now: Instant) -> bool {
        let Some(peer) = self.peers.get_mut(addr) else {
            return false;
        };
        match peer.state {
            PeerState::Connecting | PeerState::Idle => {
                peer.state = PeerState::Connected;
                peer.link = Some(link);
                peer.last_success = Some(now);
                peer.last_error = None;
                self.connecting.remove(addr);
                self.connected.insert(*addr);
                true
            }
            state => {
                tracing::warn!(%addr, %state, "Refusing connected transition");
                false
            }
        }
    }

    pub fn mark_connect_failed(&mut self, addr: &SocketAddr, reason: &str) -> bool {
        let Some(peer) = self.peers.get_mut(addr) else {
            return false;
        };
        if peer.state != PeerState::Connecting {
            tracing::warn!(%addr, state = %peer.state, "Refusing failed transition");
            return false;
        }
        peer.state = PeerState::Failed;
        peer.connect_failures += 1;
        peer.last_error = Some(reason.to_string());
        self.connecting.remove(addr);
        true
    }

    /// Connected back to idle; short-lived sessions count as quick
    /// disconnects and feed the same backoff as connect failures.
    pub fn mark_disconnected(&mut self, addr: &SocketAddr, now: Instant) -> bool {
        let Some(peer) = self.peers.get_mut(addr) else {
            return false;
        };
        if peer.state != PeerState::Connected {
            return false;
        }
        let lifetime = peer
            .last_success
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        if lifetime < QUICK_DISCONNECT_WINDOW {
            peer.quick_disconnects += 1;
        } else {
            peer.quick_disconnects = 0;
        }
        peer.state = PeerState::Idle;
        peer.link = None;
        peer.last_disconnect = Some(now);
        self.connected.remove(addr);
        true
    }

    pub fn record_rejection(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.rejection_count += 1;
        }
    }

    pub fn add_transfer(&mut self, addr: &SocketAddr, downloaded: u64, uploaded: u64) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.downloaded += downloaded;
            peer.uploaded += uploaded;
        }
    }

    /// Ban an address. Closes any live connection and clears it from the
    /// state indices. Bans never expire on their own.
    pub fn ban(&mut self, addr: &SocketAddr, reason: BanReason) -> bool {
        let Some(peer) = self.peers.get_mut(addr) else {
            return false;
        };
        tracing::warn!(%addr, ?reason, "Banning peer");
        if let Some(link) = peer.link.take() {
            link.cancel.cancel();
        }
        peer.state = PeerState::Banned;
        peer.ban_reason = Some(reason);
        self.connected.remove(addr);
        self.connecting.remove(addr);
        true
    }

    pub fn unban(&mut self, addr: &SocketAddr) -> bool {
        let Some(peer) = self.peers.get_mut(addr) else {
            return false;
        };
        if peer.state != PeerState::Banned {
            return false;
        }
        peer.state = PeerState::Idle;
        peer.ban_reason = None;
        true
    }

    /// Lift every ban that was not for data corruption. Used when the
    /// swarm is desperately small.
    pub fn unban_recoverable(&mut self) -> usize {
        let recoverable: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|p| {
                p.state == PeerState::Banned
                    && p.ban_reason.is_some_and(|reason| reason.is_recoverable())
            })
            .map(|p| p.addr)
            .collect();
        for addr in &recoverable {
            self.unban(addr);
        }
        recoverable.len()
    }

    /// Record the handshaked identity, moving the address out of any
    /// previous peer-id bucket.
    pub fn set_identity(
        &mut self,
        addr: &SocketAddr,
        peer_id: [u8; 20],
        client_name: Option<String>,
    ) {
        let Some(peer) = self.peers.get_mut(addr) else {
            return;
        };
        if let Some(old_id) = peer.peer_id {
            let old_key = hex::encode(old_id);
            if let Some(addrs) = self.identity.get_mut(&old_key) {
                addrs.remove(addr);
                if addrs.is_empty() {
                    self.identity.remove(&old_key);
                }
            }
        }
        peer.peer_id = Some(peer_id);
        peer.client_name = client_name;
        self.identity
            .entry(hex::encode(peer_id))
            .or_default()
            .insert(*addr);
    }

    /// Every address a given identity was observed at.
    pub fn addresses_for_identity(&self, peer_id: &[u8; 20]) -> Option<&HashSet<SocketAddr>> {
        self.identity.get(&hex::encode(peer_id))
    }

    /// Addresses we could dial right now: idle or failed, out of backoff,
    /// not banned, not already connected or connecting.
    pub fn eligible(&self, now: Instant) -> impl Iterator<Item = &SwarmPeer> {
        self.peers.values().filter(move |p| p.is_eligible(now))
    }

    pub fn eligible_count(&self, now: Instant) -> usize {
        self.eligible(now).count()
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::{BanReason, PeerLink, PeerSource, PeerState, Swarm};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn link() -> PeerLink {
        PeerLink {
            uuid: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn address_validation() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        assert!(!swarm.add_peer(addr("224.0.0.1:6881"), PeerSource::Dht, now));
        assert!(!swarm.add_peer(addr("255.255.255.255:6881"), PeerSource::Dht, now));
        assert!(!swarm.add_peer(addr("0.0.0.5:6881"), PeerSource::Dht, now));
        assert!(!swarm.add_peer(addr("10.0.0.1:0"), PeerSource::Dht, now));
        assert!(swarm.add_peer(addr("10.0.0.1:6881"), PeerSource::Tracker, now));
        // privileged port is kept but flagged
        assert!(swarm.add_peer(addr("10.0.0.2:80"), PeerSource::Tracker, now));
        assert!(swarm.get(&addr("10.0.0.2:80")).unwrap().suspicious_port);
        assert!(!swarm.get(&addr("10.0.0.1:6881")).unwrap().suspicious_port);
    }

    #[test]
    fn first_source_wins() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let key = addr("10.0.0.1:6881");
        assert!(swarm.add_peer(key, PeerSource::Pex, now));
        assert!(!swarm.add_peer(key, PeerSource::Tracker, now));
        assert_eq!(swarm.len(), 1);
        assert_eq!(swarm.get(&key).unwrap().source, PeerSource::Pex);
    }

    #[test]
    fn connect_lifecycle_keeps_counts() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let key = addr("10.0.0.1:6881");
        swarm.add_peer(key, PeerSource::Tracker, now);

        assert!(swarm.mark_connecting(&key, now));
        assert_eq!(swarm.connecting_count(), 1);
        // double transition is refused
        assert!(!swarm.mark_connecting(&key, now));

        assert!(swarm.mark_connected(&key, link(), now));
        assert_eq!(swarm.connecting_count(), 0);
        assert_eq!(swarm.connected_count(), 1);
        assert!(swarm.get(&key).unwrap().link().is_some());

        let later = now + Duration::from_secs(60);
        assert!(swarm.mark_disconnected(&key, later));
        assert_eq!(swarm.connected_count(), 0);
        let peer = swarm.get(&key).unwrap();
        assert_eq!(peer.state(), PeerState::Idle);
        assert!(peer.link().is_none());
        assert_eq!(peer.quick_disconnects, 0);
    }

    #[test]
    fn failed_connect_backs_off() {
        let mut swarm = Swarm::new();
        let t0 = Instant::now();
        let key = addr("10.0.0.1:6881");
        swarm.add_peer(key, PeerSource::Tracker, t0);
        swarm.mark_connecting(&key, t0);
        swarm.mark_connect_failed(&key, "connection refused");

        let peer = swarm.get(&key).unwrap();
        assert_eq!(peer.state(), PeerState::Failed);
        assert_eq!(peer.connect_failures, 1);
        assert_eq!(peer.last_error.as_deref(), Some("connection refused"));
        // 1 failure -> 2s backoff
        assert!(!peer.is_eligible(t0 + Duration::from_secs(1)));
        assert!(peer.is_eligible(t0 + Duration::from_secs(3)));

        // second failure doubles it
        swarm.mark_connecting(&key, t0 + Duration::from_secs(3));
        swarm.mark_connect_failed(&key, "timeout");
        let peer = swarm.get(&key).unwrap();
        assert!(!peer.is_eligible(t0 + Duration::from_secs(6)));
        assert!(peer.is_eligible(t0 + Duration::from_secs(8)));
    }

    #[test]
    fn quick_disconnects_back_off_idle_peers() {
        let mut swarm = Swarm::new();
        let t0 = Instant::now();
        let key = addr("10.0.0.1:6881");
        swarm.add_peer(key, PeerSource::Tracker, t0);
        swarm.mark_connecting(&key, t0);
        swarm.mark_connected(&key, link(), t0);
        // dies after five seconds
        let t1 = t0 + Duration::from_secs(5);
        swarm.mark_disconnected(&key, t1);
        let peer = swarm.get(&key).unwrap();
        assert_eq!(peer.quick_disconnects, 1);
        assert!(!peer.is_eligible(t1 + Duration::from_secs(1)));
        assert!(peer.is_eligible(t1 + Duration::from_secs(3)));
    }

    #[test]
    fn ban_and_unban_round_trip() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let key = addr("10.0.0.1:6881");
        swarm.add_peer(key, PeerSource::Tracker, now);
        swarm.mark_connecting(&key, now);
        let peer_link = link();
        let token = peer_link.cancel.clone();
        swarm.mark_connected(&key, peer_link, now);

        assert!(swarm.ban(&key, BanReason::DataCorruption));
        assert!(token.is_cancelled());
        assert_eq!(swarm.connected_count(), 0);
        let peer = swarm.get(&key).unwrap();
        assert_eq!(peer.state(), PeerState::Banned);
        assert_eq!(peer.ban_reason, Some(BanReason::DataCorruption));
        assert!(!peer.is_eligible(now + Duration::from_secs(3600)));

        assert!(swarm.unban(&key));
        let peer = swarm.get(&key).unwrap();
        assert_eq!(peer.state(), PeerState::Idle);
        assert_eq!(peer.ban_reason, None);
    }

    #[test]
    fn unban_recoverable_spares_corruption() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let corrupt = addr("10.0.0.1:6881");
        let blocked = addr("10.0.0.2:6881");
        swarm.add_peer(corrupt, PeerSource::Tracker, now);
        swarm.add_peer(blocked, PeerSource::Tracker, now);
        swarm.ban(&corrupt, BanReason::DataCorruption);
        swarm.ban(&blocked, BanReason::Manual);

        assert_eq!(swarm.unban_recoverable(), 1);
        assert_eq!(swarm.get(&corrupt).unwrap().state(), PeerState::Banned);
        assert_eq!(swarm.get(&blocked).unwrap().state(), PeerState::Idle);
    }

    #[test]
    fn identity_index_moves_addresses() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let a = addr("10.0.0.1:6881");
        let b = addr("10.0.0.2:6881");
        swarm.add_peer(a, PeerSource::Tracker, now);
        swarm.add_peer(b, PeerSource::Tracker, now);
        let id_one = [1u8; 20];
        let id_two = [2u8; 20];

        swarm.set_identity(&a, id_one, Some("qBittorrent".into()));
        swarm.set_identity(&b, id_one, None);
        assert_eq!(swarm.addresses_for_identity(&id_one).unwrap().len(), 2);

        // the same address reappearing under a new id leaves the old bucket
        swarm.set_identity(&a, id_two, None);
        assert_eq!(swarm.addresses_for_identity(&id_one).unwrap().len(), 1);
        assert!(swarm.addresses_for_identity(&id_two).unwrap().contains(&a));
    }

    #[test]
    fn scoring_prefers_proven_peers() {
        let mut swarm = Swarm::new();
        let t0 = Instant::now();
        let proven = addr("10.0.0.1:6881");
        let flaky = addr("10.0.0.2:6881");
        swarm.add_peer(proven, PeerSource::Tracker, t0);
        swarm.add_peer(flaky, PeerSource::Tracker, t0);

        swarm.mark_connecting(&proven, t0);
        swarm.mark_connected(&proven, link(), t0);
        swarm.add_transfer(&proven, 100_000_000, 0);
        swarm.mark_disconnected(&proven, t0 + Duration::from_secs(120));

        for i in 0..3 {
            let at = t0 + Duration::from_secs(i * 100);
            swarm.mark_connecting(&flaky, at);
            swarm.mark_connect_failed(&flaky, "refused");
        }

        let now = t0 + Duration::from_secs(3600);
        let proven_score = swarm.get(&proven).unwrap().score(now);
        let flaky_score = swarm.get(&flaky).unwrap().score(now);
        assert!(proven_score > flaky_score);
    }
}
