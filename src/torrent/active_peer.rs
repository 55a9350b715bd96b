use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bitfield::BitField;
use crate::choke::ChokeView;
use crate::protocol::peer::{ExtensionHandshake, HandShake, PeerMessage};

/// Assumed pipeline depth until the peer advertises `reqq`.
pub const DEFAULT_PIPELINE_DEPTH: usize = 250;

#[derive(Debug, Clone, Copy, Default)]
pub struct Performance {
    pub downloaded: u64,
    pub uploaded: u64,
}

/// Sliding window of per-tick transfer deltas; averages over it give the
/// peer's current rates.
#[derive(Debug, Clone)]
pub struct PerformanceHistory {
    history: VecDeque<Performance>,
    snapshot: Performance,
}

impl PerformanceHistory {
    const MAX_CAPACITY: usize = 20;

    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(Self::MAX_CAPACITY),
            snapshot: Performance::default(),
        }
    }

    /// Record totals as of now; the stored sample is the delta since the
    /// previous update.
    pub fn update(&mut self, totals: Performance) {
        if self.history.len() == Self::MAX_CAPACITY {
            self.history.pop_back();
        }
        let delta = Performance {
            downloaded: totals.downloaded - self.snapshot.downloaded,
            uploaded: totals.uploaded - self.snapshot.uploaded,
        };
        self.snapshot = totals;
        self.history.push_front(delta);
    }

    fn avg(&self, pick: impl Fn(&Performance) -> u64) -> u64 {
        if self.history.is_empty() {
            return 0;
        }
        self.history.iter().map(pick).sum::<u64>() / self.history.len() as u64
    }

    /// Bytes per second, assuming one update per `tick`.
    pub fn down_speed_sec(&self, tick: Duration) -> u64 {
        (self.avg(|p| p.downloaded) as f64 / tick.as_secs_f64()) as u64
    }

    pub fn up_speed_sec(&self, tick: Duration) -> u64 {
        (self.avg(|p| p.uploaded) as f64 / tick.as_secs_f64()) as u64
    }
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Choke/interest flags for one direction of a peer relationship.
#[derive(Debug, Clone, Copy)]
pub struct Status {
    choked: bool,
    choked_at: Instant,
    interested: bool,
}

impl Status {
    pub fn new(now: Instant) -> Self {
        Self {
            choked: true,
            choked_at: now,
            interested: false,
        }
    }

    pub fn set_choke(&mut self, choked: bool, now: Instant) {
        if self.choked != choked {
            self.choked_at = now;
        }
        self.choked = choked;
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_interest(&mut self, interested: bool) {
        self.interested = interested;
    }

    pub fn is_interested(&self) -> bool {
        self.interested
    }

    /// Time since the current choke state was entered.
    pub fn choke_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.choked_at)
    }
}

/// Piece-related messages that arrived before the metadata did (magnet
/// startup); replayed once piece info exists.
#[derive(Debug, Clone)]
pub enum DeferredBits {
    Bitfield(bytes::Bytes),
    HaveAll,
    HaveNone,
    Have(u32),
}

/// Engine-side state of one live peer connection. The socket lives in a
/// separate task; this struct only holds the channel ends, counters and
/// protocol state the torrent task needs.
#[derive(Debug)]
pub struct ActivePeer {
    pub uuid: Uuid,
    pub addr: SocketAddr,
    pub message_tx: flume::Sender<PeerMessage>,
    pub message_rx: flume::Receiver<PeerMessage>,
    pub bitfield: BitField,
    /// What the peer signals about us: they choke us / want our data.
    pub in_status: Status,
    /// What we signal about them.
    pub out_status: Status,
    pub downloaded: u64,
    pub uploaded: u64,
    pub performance_history: PerformanceHistory,
    /// Requests in flight to this peer. Approximate ground truth; zeroed
    /// on choke.
    pub pending_blocks: usize,
    pub pipeline_depth: usize,
    pub connected_at: Instant,
    pub last_data_received: Option<Instant>,
    pub handshake: HandShake,
    pub extension_handshake: Option<Box<ExtensionHandshake>>,
    pub deferred_bits: Vec<DeferredBits>,
    pub cancellation_token: CancellationToken,
    outbox: Vec<PeerMessage>,
}

impl ActivePeer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uuid: Uuid,
        addr: SocketAddr,
        handshake: HandShake,
        message_tx: flume::Sender<PeerMessage>,
        message_rx: flume::Receiver<PeerMessage>,
        piece_count: usize,
        cancellation_token: CancellationToken,
        now: Instant,
    ) -> Self {
        Self {
            uuid,
            addr,
            message_tx,
            message_rx,
            bitfield: BitField::empty(piece_count),
            in_status: Status::new(now),
            out_status: Status::new(now),
            downloaded: 0,
            uploaded: 0,
            performance_history: PerformanceHistory::new(),
            pending_blocks: 0,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            connected_at: now,
            last_data_received: None,
            handshake,
            extension_handshake: None,
            deferred_bits: Vec::new(),
            cancellation_token,
            outbox: Vec::new(),
        }
    }

    /// Stage a message for the end-of-tick flush.
    pub fn queue(&mut self, message: PeerMessage) {
        self.outbox.push(message);
    }

    /// Hand the staged batch to the connection task in order. A full or
    /// closed channel cancels the peer.
    pub fn flush(&mut self) {
        for message in self.outbox.drain(..) {
            if let Err(e) = self.message_tx.try_send(message) {
                tracing::warn!(addr = %self.addr, "Peer outbox overflow, dropping peer: {e}");
                self.cancellation_token.cancel();
                break;
            }
        }
    }

    pub fn has_queued(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn apply_extension_handshake(&mut self, handshake: Box<ExtensionHandshake>) {
        if let Some(reqq) = handshake.request_queue_size() {
            self.pipeline_depth = reqq.clamp(1, 4096);
        }
        self.extension_handshake = Some(handshake);
    }

    pub fn client_name(&self) -> String {
        self.extension_handshake
            .as_ref()
            .and_then(|h| h.client_name())
            .map(str::to_string)
            .unwrap_or_else(|| self.handshake.peer_id.client_name().to_string())
    }

    pub fn update_performance(&mut self) {
        self.performance_history.update(Performance {
            downloaded: self.downloaded,
            uploaded: self.uploaded,
        });
    }

    pub fn download_rate(&self, tick: Duration) -> u64 {
        self.performance_history.down_speed_sec(tick)
    }

    pub fn upload_rate(&self, tick: Duration) -> u64 {
        self.performance_history.up_speed_sec(tick)
    }

    pub fn choke_view(&self, tick: Duration, now: Instant) -> ChokeView {
        ChokeView {
            uuid: self.uuid,
            peer_interested: self.in_status.is_interested(),
            peer_choking: self.in_status.is_choked(),
            am_choking: self.out_status.is_choked(),
            choking_for: self.in_status.choke_duration(now),
            download_rate: self.download_rate(tick),
            upload_rate: self.upload_rate(tick),
            connected_for: now.saturating_duration_since(self.connected_at),
        }
    }

    /// Kill signal for the connection task; it joins shortly after.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }
}
