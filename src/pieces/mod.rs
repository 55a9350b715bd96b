use std::collections::HashMap;
use std::fmt::Display;
use std::ops::Range;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use uuid::Uuid;

use crate::availability::PieceAvailability;

pub mod active_piece;
pub mod buffer_pool;

pub use active_piece::{ActivePiece, BlockAdd, BlockRequest};
pub use buffer_pool::PieceBufferPool;

pub const BLOCK_LENGTH: u32 = 1 << 14;

/// One wire-request worth of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Block {
    pub fn range(&self) -> Range<usize> {
        let offset = self.offset as usize;
        offset..offset + self.length as usize
    }

    pub fn index(&self) -> u32 {
        self.offset / BLOCK_LENGTH
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block in piece {} with offset {} and length {}",
            self.piece, self.offset, self.length
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum Priority {
    Disabled = 0,
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
}

impl Priority {
    pub fn is_disabled(&self) -> bool {
        *self == Priority::Disabled
    }
}

impl TryFrom<usize> for Priority {
    type Error = anyhow::Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        let priority = match value {
            0 => Self::Disabled,
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => anyhow::bail!("expected value in range 0..4, got {value}"),
        };
        Ok(priority)
    }
}

/// Piece geometry of a torrent.
#[derive(Debug, Clone, Copy)]
pub struct PieceLayout {
    pub piece_length: u32,
    pub total_length: u64,
}

impl PieceLayout {
    pub fn piece_count(&self) -> usize {
        self.total_length.div_ceil(self.piece_length as u64) as usize
    }

    pub fn piece_len(&self, piece: usize) -> u32 {
        crate::utils::piece_size(piece, self.piece_length, self.total_length)
    }

    pub fn blocks_in_piece(&self, piece: usize) -> u32 {
        self.piece_len(piece).div_ceil(BLOCK_LENGTH)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceBucket {
    /// Has blocks nobody asked for yet. Only source of fresh requests.
    Partial,
    /// Every block requested, not all received.
    FullyRequested,
    /// Every block received, awaiting hash/write.
    FullyResponded,
}

/// Three-bucket index of in-progress pieces with capacity gating.
///
/// A piece lives in exactly one bucket at a time. Bulk cancellations
/// (eviction, abandonment, peer clears) accumulate a per-peer cleared-count
/// map the owner drains once per tick to fix up pipeline counters.
#[derive(Debug)]
pub struct ActivePieceManager {
    partial: HashMap<usize, ActivePiece>,
    fully_requested: HashMap<usize, ActivePiece>,
    fully_responded: HashMap<usize, ActivePiece>,
    pool: PieceBufferPool,
    standard_piece_length: u32,
    blocks_per_piece: u32,
    max_active: usize,
    max_buffered_bytes: u64,
    buffered_bytes: u64,
    request_timeout: Duration,
    cleared: HashMap<Uuid, usize>,
}

impl ActivePieceManager {
    pub fn new(
        standard_piece_length: u32,
        max_active: usize,
        max_buffered_bytes: u64,
        max_pool_buffers: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            partial: HashMap::new(),
            fully_requested: HashMap::new(),
            fully_responded: HashMap::new(),
            pool: PieceBufferPool::new(standard_piece_length as usize, max_pool_buffers),
            standard_piece_length,
            blocks_per_piece: standard_piece_length.div_ceil(BLOCK_LENGTH),
            max_active,
            max_buffered_bytes,
            buffered_bytes: 0,
            request_timeout,
            cleared: HashMap::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.partial.len() + self.fully_requested.len() + self.fully_responded.len()
    }

    pub fn partial_count(&self) -> usize {
        self.partial.len()
    }

    pub fn fully_requested_count(&self) -> usize {
        self.fully_requested.len()
    }

    pub fn fully_responded_count(&self) -> usize {
        self.fully_responded.len()
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    pub fn bucket_of(&self, index: usize) -> Option<PieceBucket> {
        if self.partial.contains_key(&index) {
            Some(PieceBucket::Partial)
        } else if self.fully_requested.contains_key(&index) {
            Some(PieceBucket::FullyRequested)
        } else if self.fully_responded.contains_key(&index) {
            Some(PieceBucket::FullyResponded)
        } else {
            None
        }
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.bucket_of(index).is_some()
    }

    pub fn get(&self, index: usize) -> Option<&ActivePiece> {
        self.partial
            .get(&index)
            .or_else(|| self.fully_requested.get(&index))
            .or_else(|| self.fully_responded.get(&index))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ActivePiece> {
        if let Some(piece) = self.partial.get_mut(&index) {
            return Some(piece);
        }
        if let Some(piece) = self.fully_requested.get_mut(&index) {
            return Some(piece);
        }
        self.fully_responded.get_mut(&index)
    }

    /// Borrowed walk over the Partial bucket, no per-iteration allocation.
    pub fn partial_pieces(&self) -> impl Iterator<Item = &ActivePiece> {
        self.partial.values()
    }

    /// Fetch an existing Partial piece or activate a new one. `None` means
    /// capacity back-pressure (or the piece is already past Partial): the
    /// requester must stop activating.
    pub fn get_or_create(
        &mut self,
        index: usize,
        length: u32,
        now: Instant,
    ) -> Option<&mut ActivePiece> {
        if self.fully_requested.contains_key(&index) || self.fully_responded.contains_key(&index) {
            return None;
        }
        if self.partial.contains_key(&index) {
            return self.partial.get_mut(&index);
        }
        if self.at_capacity(length) {
            self.cleanup_stale(now);
            if self.at_capacity(length) {
                tracing::debug!(
                    active = self.active_count(),
                    buffered = self.buffered_bytes,
                    "Refusing to activate piece {index}, at capacity"
                );
                return None;
            }
        }
        let pooled = length == self.standard_piece_length;
        let buffer = if pooled {
            self.pool
                .acquire()
                .unwrap_or_else(|| BytesMut::with_capacity(length as usize))
        } else {
            BytesMut::with_capacity(length as usize)
        };
        self.buffered_bytes += length as u64;
        let piece = ActivePiece::new(index, length, buffer, pooled, now);
        Some(self.partial.entry(index).or_insert(piece))
    }

    fn at_capacity(&self, incoming_length: u32) -> bool {
        self.active_count() >= self.max_active
            || self.buffered_bytes + incoming_length as u64 > self.max_buffered_bytes
    }

    /// Evict Partial pieces that made no progress for twice the request
    /// timeout and either hold no data or have nothing in flight. Never
    /// touches a piece that has every block.
    pub fn cleanup_stale(&mut self, now: Instant) -> usize {
        let threshold = self.request_timeout * 2;
        let stale: Vec<usize> = self
            .partial
            .iter()
            .filter(|(_, piece)| {
                !piece.is_complete()
                    && now.saturating_duration_since(piece.last_activity()) > threshold
                    && (piece.received_count() == 0 || !piece.has_outstanding_requests())
            })
            .map(|(index, _)| *index)
            .collect();
        for index in &stale {
            tracing::debug!("Evicting stale partial piece {index}");
            let piece = self.partial.remove(index).unwrap();
            self.discard(piece);
        }
        stale.len()
    }

    fn discard(&mut self, piece: ActivePiece) {
        for (peer, count) in piece.requesting_peers() {
            *self.cleared.entry(peer).or_default() += count;
        }
        self.buffered_bytes = self.buffered_bytes.saturating_sub(piece.length() as u64);
        let pooled = piece.is_pooled();
        let buffer = piece.into_buffer();
        if pooled {
            self.pool.release(buffer.freeze());
        }
    }

    /// Partial -> FullyRequested once nothing is left to hand out.
    pub fn promote_to_fully_requested(&mut self, index: usize) -> bool {
        let Some(piece) = self.partial.get(&index) else {
            return false;
        };
        if piece.has_unrequested_blocks() || piece.is_complete() {
            return false;
        }
        let piece = self.partial.remove(&index).unwrap();
        self.fully_requested.insert(index, piece);
        true
    }

    /// FullyRequested -> Partial after a disconnect/timeout freed blocks.
    pub fn demote_to_partial(&mut self, index: usize) -> bool {
        let Some(piece) = self.fully_requested.get(&index) else {
            return false;
        };
        if !piece.has_unrequested_blocks() {
            return false;
        }
        let piece = self.fully_requested.remove(&index).unwrap();
        self.partial.insert(index, piece);
        true
    }

    /// Any bucket -> FullyResponded once every block arrived.
    pub fn promote_to_fully_responded(&mut self, index: usize) -> bool {
        let source = if self.partial.get(&index).is_some_and(ActivePiece::is_complete) {
            self.partial.remove(&index)
        } else if self
            .fully_requested
            .get(&index)
            .is_some_and(ActivePiece::is_complete)
        {
            self.fully_requested.remove(&index)
        } else {
            None
        };
        match source {
            Some(piece) => {
                self.fully_responded.insert(index, piece);
                true
            }
            None => false,
        }
    }

    /// Remove a verified (or corrupt) piece after finalization.
    pub fn remove_fully_responded(&mut self, index: usize) -> Option<ActivePiece> {
        let piece = self.fully_responded.remove(&index)?;
        self.buffered_bytes = self.buffered_bytes.saturating_sub(piece.length() as u64);
        self.cleared_from(&piece);
        Some(piece)
    }

    fn cleared_from(&mut self, piece: &ActivePiece) {
        for (peer, count) in piece.requesting_peers() {
            *self.cleared.entry(peer).or_default() += count;
        }
    }

    /// Hand a written-out piece buffer back to the pool.
    pub fn release_buffer(&mut self, bytes: bytes::Bytes) {
        self.pool.release(bytes);
    }

    /// Drop every request the peer owned; FullyRequested pieces that gained
    /// unrequested blocks fall back to Partial. Returns the total dropped.
    pub fn clear_requests_for_peer(&mut self, peer: Uuid) -> usize {
        let mut cleared = 0;
        for piece in self.partial.values_mut() {
            cleared += piece.clear_requests_for_peer(peer);
        }
        let mut demote = Vec::new();
        for (index, piece) in self.fully_requested.iter_mut() {
            let dropped = piece.clear_requests_for_peer(peer);
            if dropped > 0 && piece.has_unrequested_blocks() {
                demote.push(*index);
            }
            cleared += dropped;
        }
        for index in demote {
            self.demote_to_partial(index);
        }
        if cleared > 0 {
            *self.cleared.entry(peer).or_default() += cleared;
        }
        cleared
    }

    /// Per-peer counts of requests dropped by bulk cancellations since the
    /// last drain. The owner decrements pipeline counters from this.
    pub fn take_requests_cleared(&mut self) -> HashMap<Uuid, usize> {
        std::mem::take(&mut self.cleared)
    }

    /// Requests older than `timeout` across Partial and FullyRequested.
    pub fn stale_requests(&self, timeout: Duration, now: Instant) -> Vec<(usize, u32, Uuid)> {
        let mut stale = Vec::new();
        for piece in self.partial.values().chain(self.fully_requested.values()) {
            for (block, peer) in piece.stale_requests(timeout, now) {
                stale.push((piece.index(), block, peer));
            }
        }
        stale
    }

    /// Cancel one request (ownership checked). Demotes the piece when that
    /// freed its last fully-requested state.
    pub fn cancel_request(&mut self, index: usize, block: u32, peer: Uuid) -> bool {
        let Some(piece) = self.get_mut(index) else {
            return false;
        };
        let cancelled = piece.cancel_request(block, peer);
        if cancelled {
            self.demote_to_partial(index);
        }
        cancelled
    }

    /// Throw away pieces idle past `timeout` with progress under
    /// `min_progress`. Returns the discarded indices.
    pub fn abandon_stale(
        &mut self,
        timeout: Duration,
        min_progress: f64,
        now: Instant,
    ) -> Vec<usize> {
        let mut abandoned = Vec::new();
        for bucket in [&self.partial, &self.fully_requested] {
            for (index, piece) in bucket.iter() {
                if piece.should_abandon(timeout, min_progress, now) {
                    abandoned.push(*index);
                }
            }
        }
        for index in &abandoned {
            let piece = self
                .partial
                .remove(index)
                .or_else(|| self.fully_requested.remove(index))
                .unwrap();
            tracing::debug!(
                progress = piece.progress(),
                "Abandoning stalled piece {index}"
            );
            self.discard(piece);
        }
        abandoned
    }

    /// Indices still being downloaded (Partial + FullyRequested), for the
    /// endgame duplication pass.
    pub fn active_download_indices(&self) -> Vec<usize> {
        self.partial
            .keys()
            .chain(self.fully_requested.keys())
            .copied()
            .collect()
    }

    pub fn any_unrequested_blocks(&self) -> bool {
        self.partial.values().any(ActivePiece::has_unrequested_blocks)
    }

    /// Fragmentation guard: how many Partial pieces the swarm size can
    /// justify keeping open at once.
    pub fn max_partials(&self, peers: usize) -> usize {
        let by_peers = (peers as f64 * 1.5).floor() as usize;
        let by_blocks = (2048 / self.blocks_per_piece.max(1)) as usize;
        by_peers.min(by_blocks).max(1)
    }

    pub fn should_prioritize_partials(&self, peers: usize) -> bool {
        self.partial.len() > self.max_partials(peers)
    }

    /// Partial piece indices ordered by the rarest-first key: disabled
    /// priority sorts last by index; everything else by
    /// `availability * (8 - priority) * 3` ascending, then completion
    /// descending, then index.
    pub fn partials_rarest_first(
        &self,
        availability: &PieceAvailability,
        priorities: &[Priority],
    ) -> Vec<usize> {
        let mut indices: Vec<usize> = self.partial.keys().copied().collect();
        indices.sort_by_key(|index| Self::sort_key(*index, self.partial.get(index), availability, priorities));
        indices
    }

    fn sort_key(
        index: usize,
        piece: Option<&ActivePiece>,
        availability: &PieceAvailability,
        priorities: &[Priority],
    ) -> (u64, u32, usize) {
        let priority = priorities.get(index).copied().unwrap_or_default();
        if priority.is_disabled() {
            return (u64::MAX, 0, index);
        }
        let key = availability.availability(index) as u64 * (8 - priority as u64) * 3;
        // completion stored inverted so higher progress sorts first
        let completion = piece.map_or(u32::MAX, |p| {
            u32::MAX - (p.received_count() * 1000 / p.blocks_needed())
        });
        (key, completion, index)
    }

    /// Order arbitrary candidate pieces (activation phase) by the same key.
    pub fn sort_candidates(
        &self,
        candidates: &mut Vec<usize>,
        availability: &PieceAvailability,
        priorities: &[Priority],
    ) {
        candidates.retain(|index| {
            !priorities
                .get(*index)
                .copied()
                .unwrap_or_default()
                .is_disabled()
        });
        candidates
            .sort_by_key(|index| Self::sort_key(*index, self.partial.get(index), availability, priorities));
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use uuid::Uuid;

    use crate::availability::PieceAvailability;

    use super::{ActivePieceManager, PieceBucket, Priority, BLOCK_LENGTH};

    const PIECE_LEN: u32 = 4 * BLOCK_LENGTH;

    fn manager() -> ActivePieceManager {
        ActivePieceManager::new(PIECE_LEN, 64, 64 * 1024 * 1024, 8, Duration::from_secs(30))
    }

    fn fill_block(manager: &mut ActivePieceManager, index: usize, block: u32, peer: Uuid) {
        let now = Instant::now();
        let piece = manager.get_mut(index).unwrap();
        let len = piece.block_length(block) as usize;
        piece.add_block(block, &vec![0; len], peer, now);
    }

    #[test]
    fn buckets_stay_disjoint() {
        let mut manager = manager();
        let peer = Uuid::new_v4();
        let now = Instant::now();
        let piece = manager.get_or_create(0, PIECE_LEN, now).unwrap();
        for block in 0..4 {
            piece.add_request(block, peer, now, false);
        }
        assert_eq!(manager.bucket_of(0), Some(PieceBucket::Partial));
        assert!(manager.promote_to_fully_requested(0));
        assert_eq!(manager.bucket_of(0), Some(PieceBucket::FullyRequested));
        for block in 0..4 {
            fill_block(&mut manager, 0, block, peer);
        }
        assert!(manager.promote_to_fully_responded(0));
        assert_eq!(manager.bucket_of(0), Some(PieceBucket::FullyResponded));
        assert_eq!(manager.active_count(), 1);
        assert!(manager.remove_fully_responded(0).is_some());
        assert!(!manager.is_active(0));
        assert_eq!(manager.buffered_bytes(), 0);
    }

    #[test]
    fn premature_promotions_are_refused() {
        let mut manager = manager();
        let peer = Uuid::new_v4();
        let now = Instant::now();
        let piece = manager.get_or_create(3, PIECE_LEN, now).unwrap();
        piece.add_request(0, peer, now, false);
        // still has unrequested blocks
        assert!(!manager.promote_to_fully_requested(3));
        assert!(!manager.promote_to_fully_responded(3));
        assert!(manager.remove_fully_responded(3).is_none());
    }

    #[test]
    fn capacity_gate_and_stale_eviction() {
        let mut manager =
            ActivePieceManager::new(PIECE_LEN, 2, u64::MAX, 8, Duration::from_secs(10));
        let t0 = Instant::now();
        manager.get_or_create(0, PIECE_LEN, t0).unwrap();
        manager.get_or_create(1, PIECE_LEN, t0).unwrap();
        // both fresh, nothing to evict
        assert!(manager.get_or_create(2, PIECE_LEN, t0).is_none());
        // after 2x request timeout the idle empties are fair game
        let later = t0 + Duration::from_secs(21);
        assert!(manager.get_or_create(2, PIECE_LEN, later).is_some());
        assert!(!manager.is_active(0));
        assert!(!manager.is_active(1));
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn eviction_spares_progressing_pieces() {
        let mut manager =
            ActivePieceManager::new(PIECE_LEN, 8, u64::MAX, 8, Duration::from_secs(10));
        let peer = Uuid::new_v4();
        let t0 = Instant::now();
        manager.get_or_create(0, PIECE_LEN, t0).unwrap();
        // piece 0 has data and an in-flight request
        let piece = manager.get_mut(0).unwrap();
        piece.add_request(1, peer, t0, false);
        fill_block(&mut manager, 0, 0, peer);
        manager.get_or_create(1, PIECE_LEN, t0).unwrap();
        let later = t0 + Duration::from_secs(25);
        assert_eq!(manager.cleanup_stale(later), 1);
        assert!(manager.is_active(0));
        assert!(!manager.is_active(1));
    }

    #[test]
    fn buffered_bytes_gate() {
        let mut manager = ActivePieceManager::new(
            PIECE_LEN,
            64,
            PIECE_LEN as u64 + 10,
            8,
            Duration::from_secs(30),
        );
        let now = Instant::now();
        assert!(manager.get_or_create(0, PIECE_LEN, now).is_some());
        assert!(manager.get_or_create(1, PIECE_LEN, now).is_none());
    }

    #[test]
    fn clear_requests_demotes_fully_requested() {
        let mut manager = manager();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let now = Instant::now();
        let piece = manager.get_or_create(7, PIECE_LEN, now).unwrap();
        piece.add_request(0, a, now, false);
        piece.add_request(1, a, now, false);
        piece.add_request(2, b, now, false);
        piece.add_request(3, b, now, false);
        assert!(manager.promote_to_fully_requested(7));
        assert_eq!(manager.clear_requests_for_peer(a), 2);
        // freed blocks put the piece back into partial
        assert_eq!(manager.bucket_of(7), Some(PieceBucket::Partial));
        let cleared = manager.take_requests_cleared();
        assert_eq!(cleared.get(&a), Some(&2));
        // no request anywhere still carries peer a
        assert!(manager
            .stale_requests(Duration::ZERO, now + Duration::from_secs(1))
            .iter()
            .all(|(_, _, peer)| *peer != a));
    }

    #[test]
    fn partial_cap_matches_swarm_size() {
        // 16 blocks per piece
        let manager = ActivePieceManager::new(
            16 * BLOCK_LENGTH,
            64,
            u64::MAX,
            8,
            Duration::from_secs(30),
        );
        assert_eq!(manager.max_partials(2), 3);
        assert_eq!(manager.max_partials(0), 1);
        assert_eq!(manager.max_partials(1000), 128);
    }

    #[test]
    fn rarest_first_ordering() {
        let mut manager = manager();
        let now = Instant::now();
        for index in 0..4 {
            manager.get_or_create(index, PIECE_LEN, now).unwrap();
        }
        let mut availability = PieceAvailability::new(4);
        let a = Uuid::new_v4();
        // piece availabilities: 0 -> 3, 1 -> 1, 2 -> 2, 3 -> 1
        for pieces in [&[0][..], &[0, 2], &[0, 2], &[1, 3]] {
            let mut bf = crate::bitfield::BitField::empty(4);
            for piece in pieces {
                bf.set(*piece);
            }
            availability.on_bitfield(&bf);
        }
        let priorities = vec![Priority::Medium; 4];
        let order = manager.partials_rarest_first(&availability, &priorities);
        assert_eq!(order, vec![1, 3, 2, 0]);
        // progress on 3 wins the tie against 1
        manager.get_mut(3).unwrap().add_block(
            0,
            &vec![0; BLOCK_LENGTH as usize],
            a,
            now,
        );
        let order = manager.partials_rarest_first(&availability, &priorities);
        assert_eq!(order, vec![3, 1, 2, 0]);
        // disabled priority pushes a piece to the very end
        let mut priorities = vec![Priority::Medium; 4];
        priorities[1] = Priority::Disabled;
        let order = manager.partials_rarest_first(&availability, &priorities);
        assert_eq!(order, vec![3, 2, 0, 1]);
        // high priority shrinks the key
        priorities[1] = Priority::Medium;
        priorities[0] = Priority::High;
        let order = manager.partials_rarest_first(&availability, &priorities);
        // piece 0: 3 * 5 * 3 = 45 vs piece 2: 2 * 6 * 3 = 36
        assert_eq!(order, vec![3, 1, 2, 0]);
    }
}
