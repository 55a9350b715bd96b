use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::availability::PieceAvailability;
use crate::bandwidth::{BandwidthTracker, Direction, TokenBucket, TrafficCategory};
use crate::bitfield::BitField;
use crate::choke::{ChokeActionKind, Choker, CHOKE_INTERVAL};
use crate::config::EngineConfig;
use crate::connection::{ConnectOutcome, ConnectionManager, PeerSelector, SlowPeerRule};
use crate::endgame::EndgameManager;
use crate::peers::{Peer, PeerError, PeerIPC, PEER_IN_CHANNEL_CAPACITY, PEER_OUT_CHANNEL_CAPACITY};
use crate::persist::{PersistedTorrent, UserState};
use crate::pieces::{ActivePieceManager, Block, BlockAdd, PieceLayout, Priority, BLOCK_LENGTH};
use crate::protocol::peer::{HandShake, PeerId, PeerMessage};
use crate::protocol::ut_metadata::UtMetadata;
use crate::protocol::{Info, OutputFile};
use crate::requester::{PeerRequestState, PieceRequester};
use crate::seeder::Seeder;
use crate::session::SessionContext;
use crate::storage::{StorageFeedback, StorageHandle};
use crate::swarm::{BanReason, PeerLink, PeerSource, PeerState, Swarm};

pub mod active_peer;
mod handler;
pub mod progress;

use active_peer::{ActivePeer, DeferredBits};
use progress::{PeerSnapshot, ProgressConsumer, ProgressUpdate, StateChange};

/// Request tick cadence. Also the window one performance sample covers.
pub const REQUEST_TICK: Duration = Duration::from_millis(100);
/// Incoming REQUEST lengths above this close the peer (BEP 3 allows up to
/// 128 KiB historically; nobody honest asks for more).
const MAX_REQUEST_LENGTH: u32 = 128 * 1024;
/// Hash mismatches a single address may contribute to before it gets
/// banned for corruption.
const SUSPICION_BAN_THRESHOLD: u32 = 3;
const RATE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq)]
pub enum TorrentState {
    Error(String),
    Validation {
        validated: usize,
    },
    Stopped,
    #[default]
    Pending,
    Seeding,
}

impl TorrentState {
    /// While paused no peer traffic happens and no connections are made.
    pub fn is_paused(&self) -> bool {
        match self {
            TorrentState::Error(_) | TorrentState::Validation { .. } | TorrentState::Stopped => {
                true
            }
            TorrentState::Pending | TorrentState::Seeding => false,
        }
    }
}

impl std::fmt::Display for TorrentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TorrentState::Error(e) => write!(f, "Error: {e}"),
            TorrentState::Validation { validated } => write!(f, "Validation ({validated})"),
            TorrentState::Stopped => write!(f, "Stopped"),
            TorrentState::Pending => write!(f, "Pending"),
            TorrentState::Seeding => write!(f, "Seeding"),
        }
    }
}

/// A peer the host's listener accepted and handshaked for this torrent.
#[derive(Debug)]
pub enum NewPeer {
    Incoming(Peer),
}

#[derive(Debug)]
pub enum TorrentCommand {
    Start,
    Stop,
    SuspendNetwork,
    ResumeNetwork,
    Recheck,
    AddPeer(SocketAddr),
    AddPeerHints(Vec<SocketAddr>, PeerSource),
    DisconnectPeer(SocketAddr),
    BanPeer(SocketAddr),
    SetMaxPeers(usize),
    SetMaxUploadSlots(usize),
    PostPeers(oneshot::Sender<Vec<PeerSnapshot>>),
    PostPersisted(oneshot::Sender<PersistedTorrent>),
}

#[derive(Debug, Clone)]
pub struct TorrentHandle {
    pub command_tx: mpsc::Sender<TorrentCommand>,
    pub cancellation_token: CancellationToken,
}

impl TorrentHandle {
    pub fn abort(&self) {
        self.cancellation_token.cancel();
    }

    pub async fn user_start(&self) -> anyhow::Result<()> {
        self.command_tx.send(TorrentCommand::Start).await?;
        Ok(())
    }

    pub async fn user_stop(&self) -> anyhow::Result<()> {
        self.command_tx.send(TorrentCommand::Stop).await?;
        Ok(())
    }

    pub async fn recheck_data(&self) -> anyhow::Result<()> {
        self.command_tx.send(TorrentCommand::Recheck).await?;
        Ok(())
    }

    pub async fn manually_add_peer(&self, addr: SocketAddr) -> anyhow::Result<()> {
        self.command_tx.send(TorrentCommand::AddPeer(addr)).await?;
        Ok(())
    }

    pub async fn add_peer_hints(
        &self,
        addrs: Vec<SocketAddr>,
        source: PeerSource,
    ) -> anyhow::Result<()> {
        self.command_tx
            .send(TorrentCommand::AddPeerHints(addrs, source))
            .await?;
        Ok(())
    }

    pub async fn disconnect_peer(&self, addr: SocketAddr) -> anyhow::Result<()> {
        self.command_tx
            .send(TorrentCommand::DisconnectPeer(addr))
            .await?;
        Ok(())
    }

    /// Ban an address for good (until explicitly lifted or the swarm runs
    /// dry). Independent of the automatic corruption bans.
    pub async fn ban_peer(&self, addr: SocketAddr) -> anyhow::Result<()> {
        self.command_tx.send(TorrentCommand::BanPeer(addr)).await?;
        Ok(())
    }

    pub async fn display_peers(&self) -> anyhow::Result<Vec<PeerSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(TorrentCommand::PostPeers(tx)).await?;
        Ok(rx.await?)
    }

    pub async fn persisted_state(&self) -> anyhow::Result<PersistedTorrent> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(TorrentCommand::PostPersisted(tx))
            .await?;
        Ok(rx.await?)
    }
}

/// Construction parameters, either from a torrent file (info present) or a
/// magnet link (info fetched from the swarm via ut_metadata).
#[derive(Debug)]
pub struct TorrentParams {
    pub info_hash: [u8; 20],
    pub info: Option<Info>,
    pub magnet: Option<String>,
    pub torrent_file: Option<Bytes>,
    /// Restored piece state from a previous session.
    pub bitfield: Option<BitField>,
    pub file_priorities: Vec<Priority>,
    pub user_state: UserState,
    pub added_at: u64,
    pub completed_at: Option<u64>,
    pub queue_position: Option<u32>,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
}

impl TorrentParams {
    pub fn new(info_hash: [u8; 20], info: Option<Info>) -> Self {
        Self {
            info_hash,
            info,
            magnet: None,
            torrent_file: None,
            bitfield: None,
            file_priorities: Vec::new(),
            user_state: UserState::Active,
            added_at: unix_now(),
            completed_at: None,
            queue_position: None,
            total_downloaded: 0,
            total_uploaded: 0,
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Everything that only exists once the info dictionary is known.
#[derive(Debug)]
struct TorrentMeta {
    info: Info,
    layout: PieceLayout,
    bitfield: BitField,
    pieces: ActivePieceManager,
    availability: PieceAvailability,
    endgame: EndgameManager,
    /// Per-piece priority derived from per-file priorities.
    priorities: Vec<Priority>,
    files: Vec<OutputFile>,
    file_downloaded: Vec<u64>,
}

impl TorrentMeta {
    fn new(info: Info, restored: Option<BitField>, config: &EngineConfig) -> Self {
        let layout = PieceLayout {
            piece_length: info.piece_length,
            total_length: info.total_size(),
        };
        let piece_count = info.pieces.len();
        let bitfield = restored
            .filter(|bf| bf.len() == piece_count)
            .unwrap_or_else(|| BitField::empty(piece_count));
        let files = info.output_files("");
        let pieces = ActivePieceManager::new(
            info.piece_length,
            config.max_active_pieces,
            config.max_buffered_bytes,
            config.max_pool_size,
            config.request_timeout,
        );
        Self {
            layout,
            bitfield,
            pieces,
            availability: PieceAvailability::new(piece_count),
            endgame: EndgameManager::new(),
            priorities: vec![Priority::default(); piece_count],
            file_downloaded: vec![0; files.len()],
            files,
            info,
        }
    }

    fn apply_file_priorities(&mut self, file_priorities: &[Priority]) {
        let piece_length = self.layout.piece_length as u64;
        for (file_idx, file) in self.files.iter().enumerate() {
            let priority = file_priorities
                .get(file_idx)
                .copied()
                .unwrap_or_default();
            for piece in file.start_piece(piece_length)..=file.end_piece(piece_length) {
                // a piece shared between files keeps its highest priority
                if let Some(slot) = self.priorities.get_mut(piece) {
                    *slot = (*slot).max(priority);
                }
            }
        }
    }

    fn missing_pieces(&self) -> usize {
        self.bitfield.len() - self.bitfield.count()
    }

    fn percent(&self) -> f32 {
        if self.bitfield.is_empty() {
            return 0.0;
        }
        self.bitfield.count() as f32 / self.bitfield.len() as f32 * 100.0
    }

    /// Credit finished-piece bytes to the files the piece overlaps.
    fn credit_files(&mut self, piece: usize) {
        let piece_length = self.layout.piece_len(piece) as u64;
        let piece_start = piece as u64 * self.layout.piece_length as u64;
        let piece_end = piece_start + piece_length;
        for (file_idx, file) in self.files.iter().enumerate() {
            let overlap_start = piece_start.max(file.offset());
            let overlap_end = piece_end.min(file.end());
            if overlap_start < overlap_end {
                self.file_downloaded[file_idx] += overlap_end - overlap_start;
            }
        }
    }
}

/// Per-torrent orchestrator. Owns every engine component; all state is
/// mutated on this task only, driven by the 100 ms request tick.
#[derive(Debug)]
pub struct Torrent {
    config: EngineConfig,
    session: Arc<SessionContext>,
    info_hash: [u8; 20],
    our_id: PeerId,
    state: TorrentState,
    network_suspended: bool,
    user_state: UserState,
    meta: Option<TorrentMeta>,
    metadata_fetch: Option<UtMetadata>,
    metadata_source: Option<Uuid>,
    swarm: Swarm,
    connector: ConnectionManager,
    choker: Choker,
    requester: PieceRequester,
    bandwidth: BandwidthTracker,
    download_bucket: Option<TokenBucket>,
    upload_bucket: Option<TokenBucket>,
    seeder: Seeder,
    storage: StorageHandle,
    storage_rx: mpsc::Receiver<StorageFeedback>,
    new_peers: mpsc::Receiver<NewPeer>,
    peers: Vec<ActivePeer>,
    peers_handles: JoinSet<(Uuid, Result<(), PeerError>)>,
    uuid_to_addr: HashMap<Uuid, SocketAddr>,
    suspicion: HashMap<SocketAddr, u32>,
    cancellation_token: CancellationToken,
    changes: Vec<StateChange>,
    magnet: Option<String>,
    torrent_file: Option<Bytes>,
    added_at: u64,
    completed_at: Option<u64>,
    queue_position: Option<u32>,
    total_downloaded: u64,
    total_uploaded: u64,
    last_choke: Instant,
    last_maintenance: Instant,
    maintenance_interval: Duration,
    request_retry_at: Option<Instant>,
    upload_retry_at: Option<Instant>,
    tick_num: usize,
}

impl Torrent {
    pub fn new(
        config: EngineConfig,
        params: TorrentParams,
        session: Arc<SessionContext>,
        storage: StorageHandle,
        storage_rx: mpsc::Receiver<StorageFeedback>,
        new_peers: mpsc::Receiver<NewPeer>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        let meta = match params.info {
            Some(info) => {
                let mut meta = TorrentMeta::new(info, params.bitfield, &config);
                meta.apply_file_priorities(&params.file_priorities);
                Some(meta)
            }
            None => None,
        };
        let state = match params.user_state {
            UserState::Stopped | UserState::Queued => TorrentState::Stopped,
            UserState::Active => match &meta {
                Some(meta) if meta.bitfield.has_all() => TorrentState::Seeding,
                _ => TorrentState::Pending,
            },
        };
        let slow_rule = SlowPeerRule {
            min_speed: config.slow_peer_min_speed,
            choke_timeout: config.slow_peer_timeout,
        };
        let download_bucket = (config.download_limit > 0).then(|| {
            TokenBucket::new(config.download_limit, bucket_capacity(config.download_limit), now)
        });
        let upload_bucket = (config.upload_limit > 0).then(|| {
            TokenBucket::new(config.upload_limit, bucket_capacity(config.upload_limit), now)
        });

        Self {
            session,
            info_hash: params.info_hash,
            our_id: PeerId::generate(),
            state,
            network_suspended: false,
            user_state: params.user_state,
            meta,
            metadata_fetch: None,
            metadata_source: None,
            swarm: Swarm::new(),
            connector: ConnectionManager::new(config.max_peers, config.burst_connections),
            choker: Choker::new(config.max_upload_slots, slow_rule, now),
            requester: PieceRequester::new(config.max_pipeline_depth, config.fast_peer_speed),
            bandwidth: BandwidthTracker::new(now),
            download_bucket,
            upload_bucket,
            seeder: Seeder::new(storage.clone()),
            storage,
            storage_rx,
            new_peers,
            peers: Vec::new(),
            peers_handles: JoinSet::new(),
            uuid_to_addr: HashMap::new(),
            suspicion: HashMap::new(),
            cancellation_token,
            changes: Vec::new(),
            magnet: params.magnet,
            torrent_file: params.torrent_file,
            added_at: params.added_at,
            completed_at: params.completed_at,
            queue_position: params.queue_position,
            total_downloaded: params.total_downloaded,
            total_uploaded: params.total_uploaded,
            last_choke: now,
            last_maintenance: now,
            maintenance_interval: config.maintenance_min_interval,
            request_retry_at: None,
            upload_retry_at: None,
            tick_num: 0,
            config,
        }
    }

    pub fn start(
        self,
        progress: impl ProgressConsumer,
        task_tracker: &TaskTracker,
    ) -> TorrentHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        let handle = TorrentHandle {
            command_tx,
            cancellation_token: self.cancellation_token.clone(),
        };
        let session = self.session.clone();
        task_tracker.spawn(async move {
            self.work(progress, command_rx).await;
            session.deregister_torrent();
        });
        handle
    }

    async fn work(
        mut self,
        mut progress: impl ProgressConsumer,
        mut commands_rx: mpsc::Receiver<TorrentCommand>,
    ) {
        let mut tick_interval = tokio::time::interval(REQUEST_TICK);
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    self.process_tick(now);
                    self.dispatch_progress(&mut progress, now);
                }
                Some(command) = commands_rx.recv() => {
                    self.handle_command(command);
                }
                _ = self.cancellation_token.cancelled() => {
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutting down torrent");
        self.teardown_network("shutdown");
        while self.peers_handles.join_next().await.is_some() {}
    }

    fn paused(&self) -> bool {
        self.state.is_paused() || self.network_suspended
    }

    /// One cooperative slice: gather wire events, process them, refill
    /// request pipelines, then flush all produced messages in one batch.
    pub fn process_tick(&mut self, now: Instant) {
        while let Some(joined) = self.peers_handles.try_join_next() {
            self.handle_peer_join(joined, now);
        }
        self.poll_connects(now);
        self.accept_incoming(now);

        if self.paused() {
            self.drain_storage_feedback(now);
            self.flush_peers();
            self.tick_num += 1;
            return;
        }

        // gather + process
        for idx in 0..self.peers.len() {
            self.drain_peer_messages(idx, now);
        }
        self.drain_storage_feedback(now);
        self.apply_cleared_requests();
        self.cancel_stale_requests(now);
        self.abandon_stalled_pieces(now);

        if now.saturating_duration_since(self.last_choke) >= CHOKE_INTERVAL {
            self.last_choke = now;
            self.run_choker(now);
        }

        // request
        self.fill_all_pipelines(now);
        self.reevaluate_endgame();
        self.drain_uploads(now);

        if now.saturating_duration_since(self.last_maintenance) >= self.maintenance_interval {
            self.last_maintenance = now;
            self.run_maintenance(now);
        }

        for peer in &mut self.peers {
            peer.update_performance();
        }

        // flush
        self.flush_peers();
        self.tick_num += 1;
    }

    fn flush_peers(&mut self) {
        for peer in &mut self.peers {
            peer.flush();
        }
    }

    // ------------------------------------------------------------------
    // connections

    fn poll_connects(&mut self, now: Instant) {
        for outcome in self.connector.poll() {
            match outcome {
                ConnectOutcome::Connected { peer, .. } => {
                    if self.paused() {
                        self.swarm.mark_connect_failed(&peer.addr, "paused");
                        continue;
                    }
                    // the slot may have been banned or reused mid-dial
                    let still_expected = self
                        .swarm
                        .get(&peer.addr)
                        .is_some_and(|p| p.state() == PeerState::Connecting);
                    if !still_expected {
                        tracing::debug!(addr = %peer.addr, "Dropping connect result, slot was reclaimed");
                        continue;
                    }
                    self.spawn_peer(peer, now);
                }
                ConnectOutcome::Failed { addr, reason } => {
                    tracing::debug!(%addr, "Connect failed: {reason}");
                    self.swarm.mark_connect_failed(&addr, &reason);
                }
            }
        }
    }

    fn accept_incoming(&mut self, now: Instant) {
        while let Ok(NewPeer::Incoming(peer)) = self.new_peers.try_recv() {
            let addr = peer.addr;
            self.swarm.add_peer(addr, PeerSource::Incoming, now);
            if self.paused() || self.swarm.connected_count() >= self.connector.max_peers() {
                self.swarm.record_rejection(&addr);
                continue;
            }
            if self.swarm.get(&addr).is_some_and(|p| {
                p.link().is_some() || p.state() == PeerState::Banned
            }) {
                self.swarm.record_rejection(&addr);
                continue;
            }
            self.spawn_peer(peer, now);
        }
    }

    fn spawn_peer(&mut self, peer: Peer, now: Instant) {
        let (wire_tx, wire_rx) = flume::bounded(PEER_OUT_CHANNEL_CAPACITY);
        let (engine_tx, engine_rx) = flume::bounded(PEER_IN_CHANNEL_CAPACITY);
        let child_token = self.cancellation_token.child_token();
        let ipc = PeerIPC {
            engine_tx,
            wire_rx,
        };
        let uuid = peer.uuid;
        let addr = peer.addr;
        let handshake = peer.handshake.clone();
        self.session.peer_connected();
        self.peers_handles.spawn(peer.run(ipc, child_token.clone()));
        self.swarm.mark_connected(
            &addr,
            PeerLink {
                uuid,
                cancel: child_token.clone(),
            },
            now,
        );
        self.install_peer(uuid, addr, handshake, wire_tx, engine_rx, child_token, now);
    }

    /// Wire-up of the engine-side peer state. Split from [`Self::spawn_peer`]
    /// so tests can install peers without sockets.
    #[allow(clippy::too_many_arguments)]
    fn install_peer(
        &mut self,
        uuid: Uuid,
        addr: SocketAddr,
        handshake: HandShake,
        wire_tx: flume::Sender<PeerMessage>,
        engine_rx: flume::Receiver<PeerMessage>,
        token: CancellationToken,
        now: Instant,
    ) {
        let piece_count = self.meta.as_ref().map_or(0, |m| m.bitfield.len());
        let mut peer = ActivePeer::new(
            uuid,
            addr,
            handshake,
            wire_tx,
            engine_rx,
            piece_count,
            token,
            now,
        );
        self.swarm
            .set_identity(&addr, peer.handshake.peer_id.0, None);
        self.uuid_to_addr.insert(uuid, addr);
        if let Some(meta) = &self.meta {
            if meta.bitfield.count() > 0 {
                peer.queue(PeerMessage::bitfield(&meta.bitfield));
            } else if peer.handshake.supports_fast() {
                peer.queue(PeerMessage::HaveNone);
            }
        }
        self.changes.push(StateChange::PeerConnected(addr));
        self.peers.push(peer);
    }

    fn handle_peer_join(
        &mut self,
        joined: Result<(Uuid, Result<(), PeerError>), tokio::task::JoinError>,
        now: Instant,
    ) {
        self.session.peer_disconnected();
        match joined {
            Ok((uuid, result)) => {
                if let Err(peer_err) = &result {
                    tracing::debug!(cause = ?peer_err.cause, "Peer left with error: {}", peer_err.msg);
                }
                self.remove_peer(uuid, now);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => panic!("peer task panicked: {e}"),
        }
    }

    fn remove_peer(&mut self, uuid: Uuid, now: Instant) {
        let Some(idx) = self.peers.iter().position(|p| p.uuid == uuid) else {
            return;
        };
        let peer = self.peers.swap_remove(idx);
        peer.cancel();
        if let Some(meta) = &mut self.meta {
            meta.pieces.clear_requests_for_peer(uuid);
            meta.availability
                .on_peer_disconnected(uuid, peer.bitfield.has_all(), &peer.bitfield);
        }
        self.seeder.discard_peer(uuid);
        self.swarm.mark_disconnected(&peer.addr, now);
        if self.metadata_source == Some(uuid) {
            self.metadata_source = None;
            self.reassign_metadata_source(Some(uuid));
        }
        self.changes.push(StateChange::PeerDisconnected(peer.addr));
    }

    fn peer_idx(&self, uuid: Uuid) -> Option<usize> {
        self.peers.iter().position(|p| p.uuid == uuid)
    }

    // ------------------------------------------------------------------
    // download path

    fn handle_block(
        &mut self,
        idx: usize,
        index: u32,
        begin: u32,
        data: Bytes,
        now: Instant,
    ) -> anyhow::Result<()> {
        let piece_count = match &self.meta {
            Some(meta) => meta.bitfield.len(),
            None => anyhow::bail!("PIECE before metadata"),
        };
        anyhow::ensure!(
            (index as usize) < piece_count,
            "PIECE index {index} out of range"
        );
        anyhow::ensure!(begin % BLOCK_LENGTH == 0, "PIECE offset not block aligned");
        let block = begin / BLOCK_LENGTH;
        let piece_index = index as usize;

        let (uuid, addr) = {
            let peer = &mut self.peers[idx];
            peer.pending_blocks = peer.pending_blocks.saturating_sub(1);
            peer.downloaded += data.len() as u64;
            peer.last_data_received = Some(now);
            (peer.uuid, peer.addr)
        };
        self.bandwidth.record(
            TrafficCategory::PeerPayload,
            Direction::Down,
            data.len() as u64,
            now,
        );
        self.swarm.add_transfer(&addr, data.len() as u64, 0);
        self.total_downloaded += data.len() as u64;

        let cancels = {
            let TorrentMeta {
                pieces, endgame, ..
            } = self.meta.as_mut().unwrap();
            let Some(piece) = pieces.get_mut(piece_index) else {
                // late block for a piece we discarded; not a violation
                tracing::trace!(piece_index, "Dropping block for inactive piece");
                return Ok(());
            };
            match piece.add_block(block, &data, uuid, now) {
                BlockAdd::Accepted { losers } => {
                    endgame.cancels_for_block(piece, block, &losers)
                }
                BlockAdd::Duplicate => {
                    tracing::trace!(piece_index, block, "Duplicate block");
                    return Ok(());
                }
                BlockAdd::Malformed => anyhow::bail!("malformed PIECE payload"),
            }
        };
        for (loser, cancel) in cancels {
            if let Some(loser_idx) = self.peer_idx(loser) {
                let loser_peer = &mut self.peers[loser_idx];
                loser_peer.pending_blocks = loser_peer.pending_blocks.saturating_sub(1);
                loser_peer.queue(PeerMessage::cancel(cancel));
            }
        }

        // refill this peer before any storage round trip so fast peers
        // never drain their pipeline waiting on disk
        self.fill_pipeline(idx, now);

        let meta = self.meta.as_mut().unwrap();
        if meta
            .pieces
            .get(piece_index)
            .is_some_and(|p| p.is_complete())
        {
            self.finalize_piece(piece_index);
        } else {
            // the piece may have become fully requested again already
            meta.pieces.promote_to_fully_requested(piece_index);
        }
        Ok(())
    }

    fn finalize_piece(&mut self, piece_index: usize) {
        let meta = self.meta.as_mut().unwrap();
        meta.pieces.promote_to_fully_responded(piece_index);
        let Some(piece) = meta.pieces.get_mut(piece_index) else {
            return;
        };
        let bytes = piece.assemble();
        let hash = match meta.info.pieces.get_hash(piece_index) {
            Some(hash) => *hash,
            None => return,
        };
        // the storage actor hashes next to the writer; mismatch comes back
        // as feedback, not as an error
        if let Err(e) = self.storage.try_write_verified(piece_index, hash, bytes) {
            tracing::error!("Failed to hand piece {piece_index} to storage: {e}");
            self.fatal_storage_error(piece_index, &e.to_string());
        }
    }

    fn drain_storage_feedback(&mut self, now: Instant) {
        while let Ok(feedback) = self.storage_rx.try_recv() {
            self.handle_storage_feedback(feedback, now);
        }
    }

    fn handle_storage_feedback(&mut self, feedback: StorageFeedback, now: Instant) {
        match feedback {
            StorageFeedback::Written { piece, bytes } => self.on_piece_written(piece, bytes),
            StorageFeedback::HashMismatch { piece } => self.on_hash_mismatch(piece),
            StorageFeedback::Failed { piece, error } => self.fatal_storage_error(piece, &error),
            StorageFeedback::Data { piece, bytes } => {
                let peer_uploads = self.seeder.on_piece_data(piece, bytes);
                self.send_upload_blocks(peer_uploads, now);
            }
            StorageFeedback::ValidationProgress { piece, is_valid } => {
                self.on_validation_progress(piece, is_valid);
            }
        }
    }

    fn on_piece_written(&mut self, piece_index: usize, bytes: Bytes) {
        let complete = {
            let Some(meta) = &mut self.meta else {
                return;
            };
            if meta.pieces.remove_fully_responded(piece_index).is_none() {
                return;
            }
            meta.pieces.release_buffer(bytes);
            meta.bitfield.set(piece_index);
            meta.credit_files(piece_index);
            meta.availability.remove_piece_from_all_indices(piece_index);
            meta.bitfield.has_all()
        };
        self.changes.push(StateChange::FinishedPiece(piece_index));

        // verified first, then announced
        for idx in 0..self.peers.len() {
            self.peers[idx].queue(PeerMessage::Have {
                index: piece_index as u32,
            });
            self.update_interest(idx);
        }

        if complete {
            self.completed_at = Some(unix_now());
            self.set_state(TorrentState::Seeding);
        }
    }

    fn on_hash_mismatch(&mut self, piece_index: usize) {
        let Some(meta) = &mut self.meta else {
            return;
        };
        let Some(piece) = meta.pieces.remove_fully_responded(piece_index) else {
            return;
        };
        let contributors = piece.contributing_peers().clone();
        tracing::warn!(
            piece_index,
            contributors = contributors.len(),
            "Piece failed hash check, discarding"
        );
        self.changes.push(StateChange::DiscardedPiece(piece_index));
        for uuid in contributors {
            let Some(addr) = self.uuid_to_addr.get(&uuid).copied() else {
                continue;
            };
            let suspicion = self.suspicion.entry(addr).or_default();
            *suspicion += 1;
            if *suspicion >= SUSPICION_BAN_THRESHOLD {
                self.swarm.ban(&addr, BanReason::DataCorruption);
            }
        }
        // bitfield untouched; the requester re-activates the piece
    }

    fn fatal_storage_error(&mut self, piece: usize, error: &str) {
        tracing::error!(piece, "Fatal storage failure: {error}");
        self.set_state(TorrentState::Error(error.to_string()));
        self.teardown_network("storage error");
    }

    fn on_validation_progress(&mut self, piece: usize, is_valid: bool) {
        let (total, complete) = {
            let Some(meta) = &mut self.meta else {
                return;
            };
            if is_valid {
                meta.bitfield.set(piece);
            } else {
                meta.bitfield.clear(piece);
            }
            (meta.bitfield.len(), meta.bitfield.has_all())
        };
        let done = if let TorrentState::Validation { validated } = &mut self.state {
            *validated += 1;
            *validated >= total
        } else {
            tracing::warn!(state = %self.state, "Validation progress outside validation");
            false
        };
        if done {
            let next = match self.user_state {
                UserState::Active if complete => TorrentState::Seeding,
                UserState::Active => TorrentState::Pending,
                _ => TorrentState::Stopped,
            };
            tracing::info!("Data check finished");
            self.set_state(next);
        }
    }

    // ------------------------------------------------------------------
    // requests

    fn apply_cleared_requests(&mut self) {
        let Some(meta) = &mut self.meta else {
            return;
        };
        for (uuid, count) in meta.pieces.take_requests_cleared() {
            if let Some(idx) = self.peers.iter().position(|p| p.uuid == uuid) {
                let peer = &mut self.peers[idx];
                peer.pending_blocks = peer.pending_blocks.saturating_sub(count);
            }
        }
    }

    fn cancel_stale_requests(&mut self, now: Instant) {
        let Some(meta) = &mut self.meta else {
            return;
        };
        let stale = meta
            .pieces
            .stale_requests(self.config.block_request_timeout, now);
        for (piece, block, uuid) in stale {
            if !meta.pieces.cancel_request(piece, block, uuid) {
                continue;
            }
            let Some(idx) = self.peers.iter().position(|p| p.uuid == uuid) else {
                continue;
            };
            let peer = &mut self.peers[idx];
            peer.pending_blocks = peer.pending_blocks.saturating_sub(1);
            let offset = block * BLOCK_LENGTH;
            let block_len = (meta.layout.piece_len(piece) - offset).min(BLOCK_LENGTH);
            peer.queue(PeerMessage::Cancel {
                index: piece as u32,
                begin: offset,
                length: block_len,
            });
        }
    }

    fn abandon_stalled_pieces(&mut self, now: Instant) {
        let Some(meta) = &mut self.meta else {
            return;
        };
        let abandoned = meta.pieces.abandon_stale(
            self.config.piece_abandon_timeout,
            self.config.piece_abandon_min_progress,
            now,
        );
        for piece in abandoned {
            self.changes.push(StateChange::DiscardedPiece(piece));
        }
    }

    fn fill_all_pipelines(&mut self, now: Instant) {
        if let Some(retry_at) = self.request_retry_at {
            if now < retry_at {
                return;
            }
            self.request_retry_at = None;
        }
        for idx in 0..self.peers.len() {
            self.fill_pipeline(idx, now);
            if self.request_retry_at.is_some() {
                break;
            }
        }
    }

    fn fill_pipeline(&mut self, idx: usize, now: Instant) {
        if self.meta.is_none() {
            return;
        }
        let connected_peers = self.swarm.connected_count().max(self.peers.len());
        let meta = self.meta.as_mut().unwrap();
        let peer = &mut self.peers[idx];
        if peer.in_status.is_choked() || !peer.out_status.is_interested() {
            return;
        }
        let state = PeerRequestState {
            uuid: peer.uuid,
            bitfield: &peer.bitfield,
            pending: peer.pending_blocks,
            pipeline_depth: peer.pipeline_depth,
            download_rate: peer.download_rate(REQUEST_TICK),
        };
        let outcome = self.requester.fill(
            &state,
            &mut meta.pieces,
            &meta.availability,
            &meta.endgame,
            &meta.priorities,
            &meta.bitfield,
            meta.layout,
            self.download_bucket.as_mut(),
            connected_peers,
            now,
        );
        // choosing blocks and bumping the pending counter must stay in the
        // same slice, nothing may await in between
        peer.pending_blocks += outcome.requests.len();
        for request in outcome.requests {
            self.bandwidth.record(
                TrafficCategory::PeerProtocol,
                Direction::Up,
                17,
                now,
            );
            peer.queue(PeerMessage::request(request));
        }
        if let Some(retry_in) = outcome.retry_in {
            self.request_retry_at = Some(now + retry_in);
        }
    }

    fn reevaluate_endgame(&mut self) {
        let Some(meta) = &mut self.meta else {
            return;
        };
        meta.endgame.evaluate(
            meta.missing_pieces(),
            meta.pieces.active_count(),
            meta.pieces.any_unrequested_blocks(),
        );
    }

    // ------------------------------------------------------------------
    // choking and uploads

    fn run_choker(&mut self, now: Instant) {
        let views: Vec<_> = self
            .peers
            .iter()
            .map(|p| p.choke_view(REQUEST_TICK, now))
            .collect();
        let seeding = matches!(self.state, TorrentState::Seeding);
        let has_alternatives = self.swarm.eligible_count(now) > 0;
        let decisions = self.choker.evaluate(&views, seeding, has_alternatives, now);
        for action in decisions.actions {
            let Some(idx) = self.peer_idx(action.peer) else {
                continue;
            };
            let peer = &mut self.peers[idx];
            match action.action {
                ChokeActionKind::Choke => {
                    peer.out_status.set_choke(true, now);
                    peer.queue(PeerMessage::Choke);
                    let uuid = peer.uuid;
                    let addr = peer.addr;
                    // choking discards their queued requests (BEP 3)
                    self.seeder.discard_peer(uuid);
                    self.changes.push(StateChange::OutChoke { addr, choked: true });
                }
                ChokeActionKind::Unchoke => {
                    peer.out_status.set_choke(false, now);
                    peer.queue(PeerMessage::Unchoke);
                    let addr = peer.addr;
                    self.changes.push(StateChange::OutChoke {
                        addr,
                        choked: false,
                    });
                }
            }
        }
        for uuid in decisions.drops {
            if let Some(idx) = self.peer_idx(uuid) {
                tracing::debug!(addr = %self.peers[idx].addr, "Dropping slow peer");
                self.peers[idx].cancel();
            }
        }
    }

    fn drain_uploads(&mut self, now: Instant) {
        if let Some(retry_at) = self.upload_retry_at {
            if now < retry_at {
                return;
            }
            self.upload_retry_at = None;
        }
        let servable: std::collections::HashSet<Uuid> = self
            .peers
            .iter()
            .filter(|p| !p.out_status.is_choked())
            .map(|p| p.uuid)
            .collect();
        let outcome = self.seeder.drain(
            self.upload_bucket.as_mut(),
            |uuid| servable.contains(&uuid),
            now,
        );
        if let Some(retry_in) = outcome.retry_in {
            self.upload_retry_at = Some(now + retry_in);
        }
        self.send_upload_blocks(outcome.sends, now);
    }

    fn send_upload_blocks(&mut self, sends: Vec<(Uuid, Block, Bytes)>, now: Instant) {
        for (uuid, block, payload) in sends {
            let Some(idx) = self.peer_idx(uuid) else {
                continue;
            };
            let len = payload.len() as u64;
            let peer = &mut self.peers[idx];
            peer.uploaded += len;
            let addr = peer.addr;
            peer.queue(PeerMessage::Piece {
                index: block.piece,
                begin: block.offset,
                block: payload,
            });
            self.bandwidth
                .record(TrafficCategory::PeerPayload, Direction::Up, len, now);
            self.bandwidth.record(
                TrafficCategory::PeerProtocol,
                Direction::Up,
                len + 13,
                now,
            );
            self.swarm.add_transfer(&addr, 0, len);
            self.total_uploaded += len;
        }
    }

    /// Metadata became available: create the piece machinery and replay
    /// everything peers told us before we could understand it.
    pub fn init_piece_info(&mut self, info: Info) {
        if self.meta.is_some() {
            tracing::warn!("Ignoring duplicate metadata init");
            return;
        }
        tracing::info!(name = %info.name, pieces = info.pieces.len(), "Metadata resolved");
        let meta = TorrentMeta::new(info, None, &self.config);
        let piece_count = meta.bitfield.len();
        self.meta = Some(meta);
        self.changes.push(StateChange::MetadataResolved);

        for idx in 0..self.peers.len() {
            self.peers[idx].bitfield = BitField::empty(piece_count);
            let deferred = std::mem::take(&mut self.peers[idx].deferred_bits);
            for event in deferred {
                let result = match event {
                    DeferredBits::Bitfield(payload) => self.handle_bitfield(idx, payload),
                    DeferredBits::HaveAll => self.handle_have_all(idx),
                    DeferredBits::HaveNone => {
                        self.handle_have_none(idx);
                        Ok(())
                    }
                    DeferredBits::Have(index) => self.handle_have(idx, index),
                };
                if let Err(violation) = result {
                    tracing::warn!("Closing peer on deferred event: {violation}");
                    self.peers[idx].cancel();
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // maintenance and lifecycle

    fn run_maintenance(&mut self, now: Instant) {
        if self.paused() {
            return;
        }
        // desperate swarms get their recoverable bans back
        if self.swarm.connected_count() == 0
            && self.swarm.connecting_count() == 0
            && self.swarm.eligible_count(now) == 0
            && !self.swarm.is_empty()
        {
            let recovered = self.swarm.unban_recoverable();
            if recovered > 0 {
                tracing::info!(recovered, "Swarm exhausted, lifted recoverable bans");
            }
        }

        // our share of the engine-wide connection budget
        let global_room = self
            .session
            .connection_allowance(self.swarm.connected_count() + self.swarm.connecting_count());
        let slots = self
            .connector
            .available_slots(self.swarm.connected_count(), self.swarm.connecting_count())
            .min(global_room);
        if slots > 0 {
            for addr in PeerSelector::select(&self.swarm, now, slots) {
                if self.swarm.mark_connecting(&addr, now) {
                    self.connector.connect(addr, self.info_hash, self.our_id);
                }
            }
        }

        self.maintenance_interval = self.connector.maintenance_interval(
            self.swarm.connected_count(),
            self.maintenance_interval,
            self.config.maintenance_min_interval,
            self.config.maintenance_max_interval,
        );
        self.check_invariants();
    }

    fn check_invariants(&mut self) {
        let connected = self.swarm.connected_count();
        let connecting = self.swarm.connecting_count();
        let cap = self.connector.max_peers() + self.config.burst_connections;
        if connected + connecting > cap {
            let msg = format!(
                "connection counts exceed cap: {connected} connected + {connecting} connecting > {cap}"
            );
            tracing::error!("{msg}");
            self.changes.push(StateChange::InvariantViolation(msg));
        }
    }

    fn set_state(&mut self, new_state: TorrentState) {
        if new_state == self.state {
            return;
        }
        tracing::info!(%new_state, "Torrent state change");
        self.changes
            .push(StateChange::TorrentStateChange(new_state.clone()));
        self.state = new_state;
    }

    /// Abort dials, close peers, drop queued uploads, refuse new work.
    fn teardown_network(&mut self, reason: &str) {
        for addr in self.connector.abort_all() {
            self.swarm.mark_connect_failed(&addr, reason);
        }
        let uuids: Vec<Uuid> = self.peers.iter().map(|p| p.uuid).collect();
        let now = Instant::now();
        for uuid in uuids {
            self.remove_peer(uuid, now);
        }
        self.seeder.clear();
        self.request_retry_at = None;
        self.upload_retry_at = None;
    }

    fn recheck(&mut self) {
        if matches!(self.state, TorrentState::Validation { .. }) {
            tracing::warn!("Ignoring redundant recheck request");
            return;
        }
        if self.meta.is_none() {
            tracing::warn!("Cannot recheck without metadata");
            return;
        }
        self.set_state(TorrentState::Validation { validated: 0 });
        self.teardown_network("recheck");
        self.meta.as_mut().unwrap().bitfield.clear_all();
        if self
            .storage
            .message_tx
            .try_send(crate::storage::StorageMessage::Validate)
            .is_err()
        {
            self.fatal_storage_error(0, "storage unavailable for recheck");
        }
    }

    pub fn handle_command(&mut self, command: TorrentCommand) {
        match command {
            TorrentCommand::Start => {
                self.user_state = UserState::Active;
                if matches!(self.state, TorrentState::Stopped) {
                    let complete = self
                        .meta
                        .as_ref()
                        .is_some_and(|m| m.bitfield.has_all());
                    self.set_state(if complete {
                        TorrentState::Seeding
                    } else {
                        TorrentState::Pending
                    });
                }
            }
            TorrentCommand::Stop => {
                self.user_state = UserState::Stopped;
                self.set_state(TorrentState::Stopped);
                self.teardown_network("stopped");
            }
            TorrentCommand::SuspendNetwork => {
                if !self.network_suspended {
                    self.network_suspended = true;
                    self.teardown_network("suspended");
                }
            }
            TorrentCommand::ResumeNetwork => {
                self.network_suspended = false;
            }
            TorrentCommand::Recheck => self.recheck(),
            TorrentCommand::AddPeer(addr) => {
                self.swarm.add_peer(addr, PeerSource::Manual, Instant::now());
            }
            TorrentCommand::AddPeerHints(addrs, source) => {
                let now = Instant::now();
                for addr in addrs {
                    self.swarm.add_peer(addr, source, now);
                }
            }
            TorrentCommand::DisconnectPeer(addr) => {
                if let Some(idx) = self.peers.iter().position(|p| p.addr == addr) {
                    self.peers[idx].cancel();
                }
            }
            TorrentCommand::BanPeer(addr) => {
                // explicit host ban; closes the live connection, the task
                // join then cleans up the engine-side state
                self.swarm.ban(&addr, BanReason::Manual);
            }
            TorrentCommand::SetMaxPeers(max) => self.connector.set_max_peers(max),
            TorrentCommand::SetMaxUploadSlots(slots) => self.choker.set_max_upload_slots(slots),
            TorrentCommand::PostPeers(tx) => {
                let _ = tx.send(self.display_peers(Instant::now()));
            }
            TorrentCommand::PostPersisted(tx) => {
                let _ = tx.send(self.persisted_state());
            }
        }
    }

    pub fn display_peers(&self, _now: Instant) -> Vec<PeerSnapshot> {
        self.peers
            .iter()
            .map(|p| PeerSnapshot {
                addr: p.addr,
                client_name: p.client_name(),
                downloaded: p.downloaded,
                uploaded: p.uploaded,
                download_speed: p.download_rate(REQUEST_TICK),
                upload_speed: p.upload_rate(REQUEST_TICK),
                peer_choking: p.in_status.is_choked(),
                peer_interested: p.in_status.is_interested(),
                am_choking: p.out_status.is_choked(),
                am_interested: p.out_status.is_interested(),
                pending_blocks: p.pending_blocks,
            })
            .collect()
    }

    pub fn persisted_state(&self) -> PersistedTorrent {
        let completed_pieces = self
            .meta
            .as_ref()
            .map(|m| m.bitfield.pieces().map(|p| p as u32).collect())
            .unwrap_or_default();
        PersistedTorrent {
            magnet: self.magnet.clone(),
            torrent_file: self.torrent_file.clone(),
            info_dict: self.meta.as_ref().map(|m| m.info.as_bytes()),
            added_at: self.added_at,
            completed_at: self.completed_at,
            user_state: self.user_state,
            queue_position: self.queue_position,
            total_downloaded: self.total_downloaded,
            total_uploaded: self.total_uploaded,
            completed_pieces,
        }
    }

    fn dispatch_progress(&mut self, progress: &mut impl ProgressConsumer, now: Instant) {
        let update = ProgressUpdate {
            tick_num: self.tick_num,
            percent: self.meta.as_ref().map_or(0.0, TorrentMeta::percent),
            download_speed: self.bandwidth.rate(Direction::Down, RATE_WINDOW, now),
            upload_speed: self.bandwidth.rate(Direction::Up, RATE_WINDOW, now),
            peers: self.display_peers(now),
            changes: std::mem::take(&mut self.changes),
        };
        progress.consume_progress(update);
    }
}

fn bucket_capacity(rate: u64) -> u64 {
    rate.max(2 * BLOCK_LENGTH as u64)
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::time::Instant;

    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::bitfield::BitField;
    use crate::config::EngineConfig;
    use crate::persist::UserState;
    use crate::protocol::extension::Extension;
    use crate::protocol::peer::{ExtensionHandshake, HandShake, PeerId, PeerMessage};
    use crate::protocol::ut_metadata::UtMessage;
    use crate::protocol::Info;
    use crate::storage::{StorageFeedback, StorageHandle, StorageMessage};
    use crate::swarm::{PeerLink, PeerSource};
    use crate::utils::verify_sha1;

    use super::progress::StateChange;
    use super::{NewPeer, Torrent, TorrentCommand, TorrentParams, TorrentState, BLOCK_LENGTH};

    const PIECE_LEN: u32 = 4 * BLOCK_LENGTH;

    fn piece_payload(piece: usize, len: usize) -> Vec<u8> {
        vec![piece as u8 + 1; len]
    }

    /// Hand-built single-file info dict with deterministic piece contents.
    fn build_info(piece_count: usize) -> Info {
        use sha1::{Digest, Sha1};
        let total = PIECE_LEN as usize * piece_count;
        let mut hashes = Vec::with_capacity(piece_count * 20);
        for piece in 0..piece_count {
            let mut hasher = Sha1::new();
            hasher.update(piece_payload(piece, PIECE_LEN as usize));
            hashes.extend_from_slice(&hasher.finalize());
        }
        let mut bytes = Vec::new();
        bytes.extend_from_slice(
            format!(
                "d6:lengthi{total}e4:name4:data12:piece lengthi{PIECE_LEN}e6:pieces{}:",
                hashes.len()
            )
            .as_bytes(),
        );
        bytes.extend_from_slice(&hashes);
        bytes.push(b'e');
        Info::from_bytes(&bytes).unwrap()
    }

    struct Rig {
        torrent: Torrent,
        storage_rx: mpsc::Receiver<StorageMessage>,
        _new_peers_tx: mpsc::Sender<NewPeer>,
    }

    impl Rig {
        fn new(piece_count: usize) -> Self {
            Self::with_config(piece_count, EngineConfig::default())
        }

        fn with_config(piece_count: usize, config: EngineConfig) -> Self {
            let info = build_info(piece_count);
            let params = TorrentParams::new(info.hash(), Some(info));
            Self::from_params(params, config)
        }

        fn magnet(info_hash: [u8; 20]) -> Self {
            let mut params = TorrentParams::new(info_hash, None);
            params.magnet = Some("magnet:?xt=urn:btih:00".to_string());
            Self::from_params(params, EngineConfig::default())
        }

        fn from_params(params: TorrentParams, config: EngineConfig) -> Self {
            let (storage_tx, storage_rx) = mpsc::channel(256);
            let (_feedback_tx, feedback_rx) = mpsc::channel(1);
            let (new_peers_tx, new_peers_rx) = mpsc::channel(16);
            let session = std::sync::Arc::new(crate::session::SessionContext::new(
                config.max_connections,
            ));
            session.register_torrent();
            let torrent = Torrent::new(
                config,
                params,
                session,
                StorageHandle::new(storage_tx, CancellationToken::new()),
                feedback_rx,
                new_peers_rx,
                CancellationToken::new(),
            );
            Self {
                torrent,
                storage_rx,
                _new_peers_tx: new_peers_tx,
            }
        }

        /// Install a live peer without a socket and feed it a bitfield and
        /// an unchoke.
        fn connect_peer(&mut self, pieces: Option<&[usize]>) -> (Uuid, flume::Receiver<PeerMessage>) {
            let n = self.torrent.peers.len() + 1;
            let addr: SocketAddr = format!("10.1.0.{n}:6881").parse().unwrap();
            let uuid = Uuid::new_v4();
            let (wire_tx, wire_rx) = flume::bounded(4096);
            let (engine_tx, engine_rx) = flume::bounded(16);
            std::mem::forget(engine_tx);
            let token = CancellationToken::new();
            let now = Instant::now();
            self.torrent.swarm.add_peer(addr, PeerSource::Tracker, now);
            self.torrent.swarm.mark_connecting(&addr, now);
            self.torrent.swarm.mark_connected(
                &addr,
                PeerLink {
                    uuid,
                    cancel: token.clone(),
                },
                now,
            );
            self.torrent.install_peer(
                uuid,
                addr,
                HandShake::new(self.torrent.info_hash, PeerId::generate()),
                wire_tx,
                engine_rx,
                token,
                now,
            );
            let idx = self.torrent.peers.len() - 1;
            if let Some(pieces) = pieces {
                let total = self.torrent.meta.as_ref().unwrap().bitfield.len();
                let mut bf = BitField::empty(total);
                for piece in pieces {
                    bf.set(*piece);
                }
                self.torrent
                    .handle_peer_message(
                        idx,
                        PeerMessage::Bitfield {
                            payload: Bytes::copy_from_slice(bf.as_bytes()),
                        },
                        now,
                    )
                    .unwrap();
                self.torrent
                    .handle_peer_message(idx, PeerMessage::Unchoke, now)
                    .unwrap();
            }
            (uuid, wire_rx)
        }

        fn idx_of(&self, uuid: Uuid) -> usize {
            self.torrent.peer_idx(uuid).unwrap()
        }

        fn deliver_block(&mut self, uuid: Uuid, piece: usize, block: u32) {
            let idx = self.idx_of(uuid);
            let data = piece_payload(piece, BLOCK_LENGTH as usize);
            self.torrent
                .handle_peer_message(
                    idx,
                    PeerMessage::Piece {
                        index: piece as u32,
                        begin: block * BLOCK_LENGTH,
                        block: Bytes::from(data),
                    },
                    Instant::now(),
                )
                .unwrap();
        }

        /// Process any pending verified write like a storage actor would.
        fn run_storage(&mut self) {
            while let Ok(message) = self.storage_rx.try_recv() {
                if let StorageMessage::WriteVerified { piece, hash, bytes } = message {
                    if verify_sha1(hash, &bytes) {
                        self.torrent
                            .handle_storage_feedback(StorageFeedback::Written { piece, bytes }, Instant::now());
                    } else {
                        self.torrent.handle_storage_feedback(
                            StorageFeedback::HashMismatch { piece },
                            Instant::now(),
                        );
                    }
                }
            }
        }

        fn drain_wire(&mut self, wire_rx: &flume::Receiver<PeerMessage>) -> Vec<PeerMessage> {
            self.torrent.flush_peers();
            let mut out = Vec::new();
            while let Ok(message) = wire_rx.try_recv() {
                out.push(message);
            }
            out
        }
    }

    fn requests_of(messages: &[PeerMessage]) -> Vec<(u32, u32)> {
        messages
            .iter()
            .filter_map(|m| match m {
                PeerMessage::Request { index, begin, .. } => Some((*index, *begin)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_seed_completion() {
        let mut rig = Rig::new(4);
        let (seed, wire_rx) = rig.connect_peer(Some(&[0, 1, 2, 3]));
        let now = Instant::now();
        rig.torrent.fill_all_pipelines(now);
        let messages = rig.drain_wire(&wire_rx);
        // an empty bitfield plus interest go out before any request
        assert_eq!(messages.first(), Some(&PeerMessage::HaveNone));
        assert!(messages
            .iter()
            .position(|m| *m == PeerMessage::Interested)
            .unwrap()
            < messages
                .iter()
                .position(|m| matches!(m, PeerMessage::Request { .. }))
                .unwrap());
        let requests = requests_of(&messages);
        // 4 pieces x 4 blocks, fully pipelined
        assert_eq!(requests.len(), 16);
        assert_eq!(rig.torrent.peers[0].pending_blocks, 16);

        for piece in 0..4usize {
            for block in 0..4u32 {
                rig.deliver_block(seed, piece, block);
            }
            rig.run_storage();
        }

        assert_eq!(rig.torrent.state, TorrentState::Seeding);
        let meta = rig.torrent.meta.as_ref().unwrap();
        assert!(meta.bitfield.has_all());
        assert_eq!(meta.percent(), 100.0);
        assert_eq!(rig.torrent.peers[0].pending_blocks, 0);

        let persisted = rig.torrent.persisted_state();
        assert_eq!(persisted.completed_pieces, vec![0, 1, 2, 3]);
        assert!(persisted.completed_at.is_some());

        // every verified piece was announced
        let haves = rig
            .drain_wire(&wire_rx)
            .iter()
            .filter(|m| matches!(m, PeerMessage::Have { .. }))
            .count();
        assert_eq!(haves, 4);
    }

    #[test]
    fn peer_disconnect_frees_blocks_mid_piece() {
        let mut rig = Rig::new(4);
        let (a, _wire_a) = rig.connect_peer(Some(&[2]));
        let (b, wire_b) = rig.connect_peer(Some(&[2]));
        rig.torrent.peers[0].pipeline_depth = 2;
        rig.torrent.peers[1].pipeline_depth = 2;
        let now = Instant::now();
        rig.torrent.fill_all_pipelines(now);
        assert_eq!(rig.torrent.peers[0].pending_blocks, 2);
        assert_eq!(rig.torrent.peers[1].pending_blocks, 2);

        rig.deliver_block(a, 2, 0);
        rig.torrent.remove_peer(a, now);

        // b finishes its own blocks, then picks up a's freed block
        rig.deliver_block(b, 2, 2);
        rig.deliver_block(b, 2, 3);
        rig.torrent.fill_all_pipelines(now);
        let requests = requests_of(&rig.drain_wire(&wire_b));
        assert!(requests.contains(&(2, BLOCK_LENGTH)));

        rig.deliver_block(b, 2, 1);
        rig.run_storage();
        assert!(rig.torrent.meta.as_ref().unwrap().bitfield.has(2));
    }

    #[test]
    fn hash_mismatch_discards_and_records_contributors() {
        let mut rig = Rig::new(4);
        let (a, _wa) = rig.connect_peer(Some(&[0, 1, 2, 3]));
        let (b, _wb) = rig.connect_peer(Some(&[0, 1, 2, 3]));
        let (c, _wc) = rig.connect_peer(Some(&[0, 1, 2, 3]));
        rig.torrent.peers[0].pipeline_depth = 2;
        rig.torrent.peers[1].pipeline_depth = 1;
        rig.torrent.peers[2].pipeline_depth = 1;
        let now = Instant::now();
        rig.torrent.fill_all_pipelines(now);

        // a sends garbage for its two blocks
        let idx_a = rig.idx_of(a);
        for block in 0..2u32 {
            rig.torrent
                .handle_peer_message(
                    idx_a,
                    PeerMessage::Piece {
                        index: 0,
                        begin: block * BLOCK_LENGTH,
                        block: Bytes::from(vec![0xEE; BLOCK_LENGTH as usize]),
                    },
                    now,
                )
                .unwrap();
        }
        rig.deliver_block(b, 0, 2);
        rig.deliver_block(c, 0, 3);
        rig.run_storage();

        // piece discarded, bitfield untouched, everyone under suspicion
        let meta = rig.torrent.meta.as_ref().unwrap();
        assert!(!meta.bitfield.has(0));
        assert!(!meta.pieces.is_active(0));
        assert_eq!(rig.torrent.suspicion.len(), 3);
        assert!(rig
            .torrent
            .changes
            .contains(&StateChange::DiscardedPiece(0)));

        // the piece gets re-activated on the next fill
        rig.torrent.apply_cleared_requests();
        rig.torrent.fill_all_pipelines(now);
        assert!(rig.torrent.meta.as_ref().unwrap().pieces.is_active(0));
    }

    #[test]
    fn rate_limit_caps_outstanding_requests() {
        let mut config = EngineConfig::default();
        config.download_limit = 512 * 1024;
        let mut rig = Rig::with_config(40, config);
        let all: Vec<usize> = (0..40).collect();
        for _ in 0..10 {
            rig.connect_peer(Some(&all));
        }
        let now = Instant::now();
        rig.torrent.fill_all_pipelines(now);
        let total: usize = rig.torrent.peers.iter().map(|p| p.pending_blocks).sum();
        assert!(total <= 320, "outstanding {total} exceeds 32 per peer x 10");
        for peer in &rig.torrent.peers {
            assert!(peer.pending_blocks <= 32);
        }
        // the dry bucket scheduled a retry instead of spinning
        assert!(rig.torrent.request_retry_at.is_some());
    }

    #[test]
    fn endgame_cancels_losing_duplicate() {
        let mut rig = Rig::new(4);
        {
            let meta = rig.torrent.meta.as_mut().unwrap();
            meta.bitfield.set(0);
            meta.bitfield.set(1);
            meta.bitfield.set(2);
        }
        let (x, _wire_x) = rig.connect_peer(Some(&[0, 1, 2, 3]));
        let (y, wire_y) = rig.connect_peer(Some(&[0, 1, 2, 3]));
        let now = Instant::now();
        rig.torrent.fill_all_pipelines(now);
        // x holds all four requests of the last piece
        assert_eq!(rig.torrent.peers[rig.idx_of(x)].pending_blocks, 4);

        rig.torrent.reevaluate_endgame();
        assert!(rig.torrent.meta.as_ref().unwrap().endgame.is_active());
        rig.torrent.fill_all_pipelines(now);
        assert_eq!(rig.torrent.peers[rig.idx_of(y)].pending_blocks, 4);

        // x wins block 1; y must receive a CANCEL for it
        rig.deliver_block(x, 3, 1);
        let cancels: Vec<_> = rig
            .drain_wire(&wire_y)
            .into_iter()
            .filter_map(|m| match m {
                PeerMessage::Cancel { index, begin, length } => Some((index, begin, length)),
                _ => None,
            })
            .collect();
        assert_eq!(cancels, vec![(3, BLOCK_LENGTH, BLOCK_LENGTH)]);
        assert_eq!(rig.torrent.peers[rig.idx_of(y)].pending_blocks, 3);
    }

    #[test]
    fn choke_zeroes_pending_and_frees_requests() {
        let mut rig = Rig::new(4);
        let (a, _wire) = rig.connect_peer(Some(&[0, 1, 2, 3]));
        let now = Instant::now();
        rig.torrent.fill_all_pipelines(now);
        assert!(rig.torrent.peers[0].pending_blocks > 0);

        let idx = rig.idx_of(a);
        rig.torrent
            .handle_peer_message(idx, PeerMessage::Choke, now)
            .unwrap();
        assert_eq!(rig.torrent.peers[0].pending_blocks, 0);
        // no request anywhere still carries the peer
        let meta = rig.torrent.meta.as_ref().unwrap();
        assert!(meta
            .pieces
            .stale_requests(std::time::Duration::ZERO, now + std::time::Duration::from_secs(1))
            .is_empty());
    }

    #[test]
    fn stop_tears_down_network() {
        let mut rig = Rig::new(4);
        let (_a, _wire) = rig.connect_peer(Some(&[0, 1]));
        rig.torrent.handle_command(TorrentCommand::Stop);
        assert_eq!(rig.torrent.state, TorrentState::Stopped);
        assert!(rig.torrent.peers.is_empty());
        assert_eq!(rig.torrent.swarm.connected_count(), 0);
        assert_eq!(rig.torrent.seeder.queued(), 0);
        assert_eq!(rig.torrent.user_state, UserState::Stopped);

        rig.torrent.handle_command(TorrentCommand::Start);
        assert_eq!(rig.torrent.state, TorrentState::Pending);
    }

    #[test]
    fn recheck_suspends_and_rebuilds_bitfield() {
        let mut rig = Rig::new(4);
        {
            let meta = rig.torrent.meta.as_mut().unwrap();
            meta.bitfield.set(0);
            meta.bitfield.set(1);
        }
        let (_a, _wire) = rig.connect_peer(Some(&[0, 1, 2, 3]));
        rig.torrent.handle_command(TorrentCommand::Recheck);
        assert_eq!(rig.torrent.state, TorrentState::Validation { validated: 0 });
        assert!(rig.torrent.peers.is_empty());
        assert_eq!(rig.torrent.meta.as_ref().unwrap().bitfield.count(), 0);
        assert!(matches!(
            rig.storage_rx.try_recv().unwrap(),
            StorageMessage::Validate
        ));
        // reentrant recheck is ignored
        rig.torrent.handle_command(TorrentCommand::Recheck);
        assert!(rig.storage_rx.try_recv().is_err());

        let now = Instant::now();
        for piece in 0..4 {
            rig.torrent.handle_storage_feedback(
                StorageFeedback::ValidationProgress {
                    piece,
                    is_valid: piece < 2,
                },
                now,
            );
        }
        assert_eq!(rig.torrent.state, TorrentState::Pending);
        assert_eq!(rig.torrent.meta.as_ref().unwrap().bitfield.count(), 2);
    }

    #[test]
    fn upload_path_serves_unchoked_peers() {
        let mut rig = Rig::new(4);
        {
            let meta = rig.torrent.meta.as_mut().unwrap();
            meta.bitfield.set(1);
        }
        let (a, wire) = rig.connect_peer(Some(&[0]));
        let idx = rig.idx_of(a);
        let now = Instant::now();
        rig.torrent.peers[idx].out_status.set_choke(false, now);
        rig.torrent
            .handle_peer_message(
                idx,
                PeerMessage::Request {
                    index: 1,
                    begin: 0,
                    length: BLOCK_LENGTH,
                },
                now,
            )
            .unwrap();
        rig.torrent.drain_uploads(now);
        // storage read requested, data comes back, PIECE goes out
        assert!(matches!(
            rig.storage_rx.try_recv().unwrap(),
            StorageMessage::Read { piece: 1 }
        ));
        rig.torrent.handle_storage_feedback(
            StorageFeedback::Data {
                piece: 1,
                bytes: Some(Bytes::from(piece_payload(1, PIECE_LEN as usize))),
            },
            now,
        );
        let pieces: Vec<_> = rig
            .drain_wire(&wire)
            .into_iter()
            .filter(|m| matches!(m, PeerMessage::Piece { .. }))
            .collect();
        assert_eq!(pieces.len(), 1);
        assert_eq!(rig.torrent.peers[idx].uploaded, BLOCK_LENGTH as u64);
        assert_eq!(rig.torrent.total_uploaded, BLOCK_LENGTH as u64);

        // requests for pieces we miss close the peer
        let result = rig.torrent.handle_peer_message(
            idx,
            PeerMessage::Request {
                index: 2,
                begin: 0,
                length: BLOCK_LENGTH,
            },
            now,
        );
        assert!(result.is_err());
    }

    #[test]
    fn storage_write_failure_is_fatal() {
        let mut rig = Rig::new(4);
        let (_a, _wire) = rig.connect_peer(Some(&[0, 1, 2, 3]));
        rig.torrent.handle_storage_feedback(
            StorageFeedback::Failed {
                piece: 0,
                error: "disk full".to_string(),
            },
            Instant::now(),
        );
        assert!(matches!(rig.torrent.state, TorrentState::Error(_)));
        assert!(rig.torrent.peers.is_empty());
    }

    #[test]
    fn metadata_fetch_via_ut_metadata() {
        let info = build_info(4);
        let info_hash = info.hash();
        let raw = info.as_bytes();
        let mut rig = Rig::magnet(info_hash);
        let (_peer, wire) = rig.connect_peer(None);
        let now = Instant::now();

        // piece events before metadata are deferred
        rig.torrent
            .handle_peer_message(0, PeerMessage::HaveAll, now)
            .unwrap();

        let mut handshake = ExtensionHandshake::ours(500);
        handshake.dict.insert("ut_metadata".to_string(), 3);
        handshake.fields.insert(
            "metadata_size".to_string(),
            serde_bencode::value::Value::Int(raw.len() as i64),
        );
        rig.torrent
            .handle_peer_message(
                0,
                PeerMessage::ExtensionHandshake {
                    payload: Box::new(handshake),
                },
                now,
            )
            .unwrap();

        // the fetch asks peer with the id the peer chose
        let outgoing = rig.drain_wire(&wire);
        let request = outgoing
            .iter()
            .find_map(|m| match m {
                PeerMessage::Extension {
                    extension_id: 3,
                    payload,
                } => Some(UtMessage::from_bytes(payload).unwrap()),
                _ => None,
            })
            .expect("metadata request sent");
        assert_eq!(request, UtMessage::Request { piece: 0 });

        // answer with the single metadata block
        let mut payload = UtMessage::Data {
            piece: 0,
            total_size: raw.len(),
        }
        .as_bytes();
        payload.extend_from_slice(&raw);
        rig.torrent
            .handle_peer_message(
                0,
                PeerMessage::Extension {
                    extension_id: UtMessage::CLIENT_ID,
                    payload: payload.into(),
                },
                now,
            )
            .unwrap();

        assert!(rig.torrent.meta.is_some());
        assert!(rig
            .torrent
            .changes
            .contains(&StateChange::MetadataResolved));
        // the deferred HAVE_ALL was replayed
        assert!(rig.torrent.peers[0].bitfield.has_all());
        assert_eq!(
            rig.torrent.meta.as_ref().unwrap().availability.seed_count(),
            1
        );
    }

    #[test]
    fn manual_ban_closes_connection() {
        use crate::swarm::{BanReason, PeerState};
        let mut rig = Rig::new(4);
        let (a, _wire) = rig.connect_peer(Some(&[0]));
        let addr = rig.torrent.peers[0].addr;
        rig.torrent.handle_command(TorrentCommand::BanPeer(addr));
        // the live link was cancelled and the swarm slot is gone
        assert!(rig.torrent.peers[rig.idx_of(a)]
            .cancellation_token
            .is_cancelled());
        assert_eq!(rig.torrent.swarm.connected_count(), 0);
        let peer = rig.torrent.swarm.get(&addr).unwrap();
        assert_eq!(peer.state(), PeerState::Banned);
        assert_eq!(peer.ban_reason, Some(BanReason::Manual));
        // a manual ban is recoverable when the swarm dries up
        assert_eq!(rig.torrent.swarm.unban_recoverable(), 1);
        assert_eq!(
            rig.torrent.swarm.get(&addr).unwrap().state(),
            PeerState::Idle
        );
    }

    #[test]
    fn incoming_peers_rejected_while_stopped() {
        let mut rig = Rig::new(4);
        rig.torrent.handle_command(TorrentCommand::Stop);
        let addr: SocketAddr = "10.1.0.9:6881".parse().unwrap();
        let now = Instant::now();
        rig.torrent.swarm.add_peer(addr, PeerSource::Incoming, now);
        rig.torrent.swarm.record_rejection(&addr);
        assert_eq!(rig.torrent.swarm.get(&addr).unwrap().rejection_count, 1);
        assert_eq!(rig.torrent.swarm.connected_count(), 0);
    }
}
