use std::sync::atomic::{AtomicUsize, Ordering};

/// Engine-wide connection accounting. Every torrent dials against the same
/// `max_connections` roof; the dial allowance handed to one torrent is its
/// fair share of that roof, never more than the headroom all the others
/// left unused. Counters are atomics so torrent tasks update them without
/// coordination.
#[derive(Debug, Default)]
pub struct SessionContext {
    peers: AtomicUsize,
    torrents: AtomicUsize,
    max_connections: usize,
}

impl SessionContext {
    pub fn new(max_connections: usize) -> Self {
        Self {
            peers: AtomicUsize::new(0),
            torrents: AtomicUsize::new(0),
            max_connections,
        }
    }

    pub fn register_torrent(&self) {
        self.torrents.fetch_add(1, Ordering::AcqRel);
    }

    pub fn deregister_torrent(&self) {
        self.torrents.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn peer_connected(&self) {
        self.peers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn peer_disconnected(&self) {
        self.peers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn peers_amount(&self) -> usize {
        self.peers.load(Ordering::Acquire)
    }

    pub fn torrents_amount(&self) -> usize {
        self.torrents.load(Ordering::Acquire)
    }

    /// How many more connections a torrent already holding `own` of them
    /// (connected plus connecting) may open right now.
    pub fn connection_allowance(&self, own: usize) -> usize {
        let torrents = self.torrents_amount().max(1);
        let fair_share = self.max_connections / torrents;
        let global_headroom = self.max_connections.saturating_sub(self.peers_amount());
        fair_share.saturating_sub(own).min(global_headroom)
    }
}
