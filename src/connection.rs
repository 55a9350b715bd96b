use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use crate::peers::Peer;
use crate::protocol::peer::PeerId;
use crate::swarm::Swarm;

const TIMING_SAMPLES: usize = 64;
/// Until enough dials were observed, fall back to a fixed timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Adaptive connect timeout derived from observed handshake latencies:
/// three times the p90, clamped to a sane band.
#[derive(Debug, Default)]
pub struct ConnectionTiming {
    latencies_ms: VecDeque<u64>,
}

impl ConnectionTiming {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: Duration) {
        if self.latencies_ms.len() == TIMING_SAMPLES {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency.as_millis() as u64);
    }

    pub fn connect_timeout(&self) -> Duration {
        if self.latencies_ms.len() < 5 {
            return DEFAULT_CONNECT_TIMEOUT;
        }
        let mut sorted: Vec<u64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_unstable();
        let p90 = sorted[(sorted.len() * 9 / 10).min(sorted.len() - 1)];
        Duration::from_millis(p90 * 3).clamp(MIN_CONNECT_TIMEOUT, MAX_CONNECT_TIMEOUT)
    }
}

/// Computes the dial order: eligible swarm entries scored high to low,
/// suspicious-port peers only after every normal candidate.
#[derive(Debug)]
pub struct PeerSelector;

impl PeerSelector {
    pub fn select(swarm: &Swarm, now: Instant, limit: usize) -> Vec<SocketAddr> {
        let mut normal: Vec<(i64, SocketAddr)> = Vec::new();
        let mut suspicious: Vec<(i64, SocketAddr)> = Vec::new();
        for peer in swarm.eligible(now) {
            let entry = (peer.score(now), peer.addr);
            if peer.suspicious_port {
                suspicious.push(entry);
            } else {
                normal.push(entry);
            }
        }
        normal.sort_unstable_by_key(|(score, _)| std::cmp::Reverse(*score));
        suspicious.sort_unstable_by_key(|(score, _)| std::cmp::Reverse(*score));
        normal
            .into_iter()
            .chain(suspicious)
            .map(|(_, addr)| addr)
            .take(limit)
            .collect()
    }
}

#[derive(Debug)]
pub enum ConnectOutcome {
    Connected { peer: Peer, latency: Duration },
    Failed { addr: SocketAddr, reason: String },
}

/// Outbound dialer. Owns the in-flight connect tasks; the swarm slot must
/// be reserved (`mark_connecting`) before [`Self::connect`] so an incoming
/// connection from the same address cannot race the dial.
#[derive(Debug)]
pub struct ConnectionManager {
    max_peers: usize,
    headroom: usize,
    timing: ConnectionTiming,
    join_set: JoinSet<ConnectOutcome>,
    in_flight: HashSet<SocketAddr>,
}

impl ConnectionManager {
    pub fn new(max_peers: usize, headroom: usize) -> Self {
        Self {
            max_peers,
            headroom,
            timing: ConnectionTiming::new(),
            join_set: JoinSet::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn set_max_peers(&mut self, max_peers: usize) {
        self.max_peers = max_peers;
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn available_slots(&self, connected: usize, connecting: usize) -> usize {
        (self.max_peers + self.headroom).saturating_sub(connected + connecting)
    }

    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.timing.connect_timeout()
    }

    pub fn connect(&mut self, addr: SocketAddr, info_hash: [u8; 20], our_id: PeerId) {
        if !self.in_flight.insert(addr) {
            tracing::warn!(%addr, "Duplicate dial suppressed");
            return;
        }
        let timeout = self.timing.connect_timeout();
        self.join_set.spawn(async move {
            let started = Instant::now();
            match tokio::time::timeout(timeout, Peer::connect(addr, info_hash, our_id)).await {
                Ok(Ok(peer)) => ConnectOutcome::Connected {
                    peer,
                    latency: started.elapsed(),
                },
                Ok(Err(e)) => ConnectOutcome::Failed {
                    addr,
                    reason: e.to_string(),
                },
                Err(_) => ConnectOutcome::Failed {
                    addr,
                    reason: "timeout".to_string(),
                },
            }
        });
    }

    /// Collect finished dials. Successful handshakes feed the latency
    /// estimate.
    pub fn poll(&mut self) -> Vec<ConnectOutcome> {
        let mut outcomes = Vec::new();
        while let Some(joined) = self.join_set.try_join_next() {
            match joined {
                Ok(outcome) => {
                    match &outcome {
                        ConnectOutcome::Connected { peer, latency } => {
                            self.in_flight.remove(&peer.addr);
                            self.timing.record(*latency);
                        }
                        ConnectOutcome::Failed { addr, .. } => {
                            self.in_flight.remove(addr);
                        }
                    }
                    outcomes.push(outcome);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => panic!("connect task panicked: {e}"),
            }
        }
        outcomes
    }

    /// Abort every in-flight dial. Returns the addresses so the owner can
    /// mark their swarm entries failed.
    pub fn abort_all(&mut self) -> Vec<SocketAddr> {
        self.join_set.abort_all();
        // drain whatever managed to finish before the abort landed
        while self.join_set.try_join_next().is_some() {}
        self.in_flight.drain().collect()
    }

    /// Maintenance cadence: hurry while far below the target peer count,
    /// relax once at 80% or more of it.
    pub fn maintenance_interval(
        &self,
        connected: usize,
        current: Duration,
        min: Duration,
        max: Duration,
    ) -> Duration {
        if self.max_peers == 0 {
            return max;
        }
        if connected * 10 >= self.max_peers * 8 {
            (current * 2).clamp(min, max)
        } else {
            (current / 2).clamp(min, max)
        }
    }
}

/// The drop recommendation rule: peers that keep us choked past the
/// timeout, or trickle far below both the floor and the swarm average.
#[derive(Debug, Clone, Copy)]
pub struct SlowPeerRule {
    pub min_speed: u64,
    pub choke_timeout: Duration,
}

impl SlowPeerRule {
    pub fn is_slow(
        &self,
        peer_choking: bool,
        choking_for: Duration,
        download_rate: u64,
        average_rate: u64,
        connected_for: Duration,
    ) -> bool {
        if peer_choking {
            return choking_for > self.choke_timeout;
        }
        download_rate < self.min_speed
            && download_rate * 10 < average_rate
            && connected_for > Duration::from_secs(10)
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::protocol::peer::PeerId;
    use crate::swarm::{PeerSource, Swarm};

    use super::{ConnectOutcome, ConnectionManager, ConnectionTiming, PeerSelector, SlowPeerRule};

    #[test]
    fn timeout_tracks_latency_quantile() {
        let mut timing = ConnectionTiming::new();
        assert_eq!(timing.connect_timeout(), Duration::from_secs(10));
        for _ in 0..20 {
            timing.record(Duration::from_millis(100));
        }
        // 3 x p90 of 100ms, clamped up to the floor
        assert_eq!(timing.connect_timeout(), Duration::from_secs(2));
        for _ in 0..64 {
            timing.record(Duration::from_millis(3000));
        }
        assert_eq!(timing.connect_timeout(), Duration::from_secs(9));
        for _ in 0..64 {
            timing.record(Duration::from_secs(60));
        }
        assert_eq!(timing.connect_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn selector_holds_suspicious_ports_back() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let privileged: std::net::SocketAddr = "10.0.0.1:81".parse().unwrap();
        swarm.add_peer(privileged, PeerSource::Manual, now);
        for i in 2..6 {
            swarm.add_peer(
                format!("10.0.0.{i}:6881").parse().unwrap(),
                PeerSource::Pex,
                now,
            );
        }
        let selected = PeerSelector::select(&swarm, now, 10);
        assert_eq!(selected.len(), 5);
        // manual source scores highest, yet the privileged port sorts last
        assert_eq!(*selected.last().unwrap(), privileged);

        let top = PeerSelector::select(&swarm, now, 2);
        assert_eq!(top.len(), 2);
        assert!(!top.contains(&privileged));
    }

    #[test]
    fn slot_math_floors_at_zero() {
        let manager = ConnectionManager::new(50, 5);
        assert_eq!(manager.available_slots(0, 0), 55);
        assert_eq!(manager.available_slots(50, 5), 0);
        assert_eq!(manager.available_slots(60, 10), 0);
    }

    #[test]
    fn maintenance_interval_adapts() {
        let manager = ConnectionManager::new(10, 0);
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        // starving -> shrink
        assert_eq!(
            manager.maintenance_interval(0, Duration::from_secs(8), min, max),
            Duration::from_secs(4)
        );
        // at 80% of target -> grow
        assert_eq!(
            manager.maintenance_interval(8, Duration::from_secs(8), min, max),
            Duration::from_secs(16)
        );
        assert_eq!(
            manager.maintenance_interval(10, Duration::from_secs(20), min, max),
            max
        );
    }

    #[test]
    fn slow_peer_rule() {
        let rule = SlowPeerRule {
            min_speed: 1024,
            choke_timeout: Duration::from_secs(60),
        };
        let minute = Duration::from_secs(61);
        let fresh = Duration::from_secs(5);
        let settled = Duration::from_secs(30);
        // choked too long
        assert!(rule.is_slow(true, minute, 0, 0, settled));
        assert!(!rule.is_slow(true, Duration::from_secs(30), 0, 0, settled));
        // unchoked but trickling under both thresholds
        assert!(rule.is_slow(false, Duration::ZERO, 100, 50_000, settled));
        // fast enough in absolute terms
        assert!(!rule.is_slow(false, Duration::ZERO, 2048, 50_000, settled));
        // slow but so is everyone else
        assert!(!rule.is_slow(false, Duration::ZERO, 100, 500, settled));
        // too early to judge
        assert!(!rule.is_slow(false, Duration::ZERO, 100, 50_000, fresh));
    }

    #[tokio::test]
    async fn failed_dial_reports_address() {
        // grab a port that nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut manager = ConnectionManager::new(10, 5);
        manager.connect(addr, [1; 20], PeerId::generate());
        assert_eq!(manager.pending(), 1);
        let outcome = loop {
            let mut outcomes = manager.poll();
            if let Some(outcome) = outcomes.pop() {
                break outcome;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        match outcome {
            ConnectOutcome::Failed { addr: failed, .. } => assert_eq!(failed, addr),
            ConnectOutcome::Connected { .. } => panic!("dial must fail"),
        }
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn abort_all_clears_in_flight() {
        // a listener that never accepts keeps the dial pending
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // swallow the handshake and stall
            let mut buffer = [0u8; 1024];
            let _ = socket.read(&mut buffer).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let mut manager = ConnectionManager::new(10, 5);
        manager.connect(addr, [1; 20], PeerId::generate());
        let aborted = manager.abort_all();
        assert_eq!(aborted, vec![addr]);
        assert_eq!(manager.pending(), 0);
    }
}
