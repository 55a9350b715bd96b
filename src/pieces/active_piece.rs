use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use super::BLOCK_LENGTH;

#[derive(Debug, Clone, Copy)]
pub struct BlockRequest {
    pub peer: Uuid,
    pub requested_at: Instant,
}

/// Outcome of feeding a block into a piece.
#[derive(Debug)]
pub enum BlockAdd {
    /// Block accepted; carries every other peer that still had an
    /// outstanding request for it (endgame CANCEL targets).
    Accepted { losers: Vec<Uuid> },
    /// We already had this block.
    Duplicate,
    /// Offset/length did not line up with the piece geometry.
    Malformed,
}

impl BlockAdd {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BlockAdd::Accepted { .. })
    }
}

/// Per-piece block state for a piece currently being downloaded.
///
/// The payload accumulates in one contiguous buffer (pooled for
/// standard-length pieces). Request ownership is tracked per block: in
/// normal mode at most one peer owns a block, in endgame the same block may
/// additionally be requested from several peers.
#[derive(Debug)]
pub struct ActivePiece {
    index: usize,
    length: u32,
    blocks_needed: u32,
    buffer: BytesMut,
    pooled: bool,
    received: Box<[bool]>,
    received_count: u32,
    requests: HashMap<u32, BlockRequest>,
    endgame_requests: HashMap<u32, Vec<Uuid>>,
    contributors: HashSet<Uuid>,
    exclusive_peer: Option<Uuid>,
    last_activity: Instant,
}

impl ActivePiece {
    pub fn new(index: usize, length: u32, mut buffer: BytesMut, pooled: bool, now: Instant) -> Self {
        let blocks_needed = length.div_ceil(BLOCK_LENGTH);
        buffer.clear();
        buffer.resize(length as usize, 0);
        Self {
            index,
            length,
            blocks_needed,
            buffer,
            pooled,
            received: vec![false; blocks_needed as usize].into_boxed_slice(),
            received_count: 0,
            requests: HashMap::new(),
            endgame_requests: HashMap::new(),
            contributors: HashSet::new(),
            exclusive_peer: None,
            last_activity: now,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn blocks_needed(&self) -> u32 {
        self.blocks_needed
    }

    pub fn block_offset(&self, block: u32) -> u32 {
        block * BLOCK_LENGTH
    }

    pub fn block_length(&self, block: u32) -> u32 {
        BLOCK_LENGTH.min(self.length - block * BLOCK_LENGTH)
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.blocks_needed
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn progress(&self) -> f64 {
        self.received_count as f64 / self.blocks_needed as f64
    }

    /// Cheap check backing the Partial <-> FullyRequested transitions.
    pub fn has_unrequested_blocks(&self) -> bool {
        if self.endgame_requests.is_empty() {
            return (self.received_count as usize) + self.requests.len()
                < self.blocks_needed as usize;
        }
        (0..self.blocks_needed).any(|b| {
            !self.received[b as usize]
                && !self.requests.contains_key(&b)
                && !self.endgame_requests.contains_key(&b)
        })
    }

    /// Store a block. Duplicates are rejected; the submitter is still
    /// recorded as a contributor so corruption can be attributed later.
    pub fn add_block(&mut self, block: u32, data: &[u8], peer: Uuid, now: Instant) -> BlockAdd {
        if block >= self.blocks_needed || data.len() != self.block_length(block) as usize {
            return BlockAdd::Malformed;
        }
        if self.received[block as usize] {
            self.contributors.insert(peer);
            return BlockAdd::Duplicate;
        }
        let offset = self.block_offset(block) as usize;
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        self.received[block as usize] = true;
        self.received_count += 1;
        self.contributors.insert(peer);
        self.last_activity = now;

        let mut losers: Vec<Uuid> = self
            .requests
            .remove(&block)
            .map(|r| r.peer)
            .into_iter()
            .chain(self.endgame_requests.remove(&block).into_iter().flatten())
            .filter(|id| *id != peer)
            .collect();
        losers.dedup();
        BlockAdd::Accepted { losers }
    }

    pub fn add_request(&mut self, block: u32, peer: Uuid, now: Instant, endgame: bool) {
        debug_assert!(block < self.blocks_needed);
        debug_assert!(!self.received[block as usize]);
        if endgame && self.requests.contains_key(&block) {
            self.endgame_requests.entry(block).or_default().push(peer);
        } else {
            self.requests.insert(
                block,
                BlockRequest {
                    peer,
                    requested_at: now,
                },
            );
        }
        self.last_activity = now;
    }

    /// Blocks to request next, ordered by index: skips received blocks and
    /// blocks already requested from anyone.
    pub fn needed_blocks(&self, limit: usize) -> Vec<u32> {
        (0..self.blocks_needed)
            .filter(|b| !self.received[*b as usize] && !self.requests.contains_key(b))
            .take(limit)
            .collect()
    }

    /// Endgame variant: only received blocks and blocks this same peer
    /// already asked for are skipped.
    pub fn needed_blocks_endgame(&self, peer: Uuid, limit: usize) -> Vec<u32> {
        (0..self.blocks_needed)
            .filter(|b| {
                if self.received[*b as usize] {
                    return false;
                }
                if self.requests.get(b).is_some_and(|r| r.peer == peer) {
                    return false;
                }
                !self
                    .endgame_requests
                    .get(b)
                    .is_some_and(|peers| peers.contains(&peer))
            })
            .take(limit)
            .collect()
    }

    pub fn stale_requests(&self, timeout: Duration, now: Instant) -> Vec<(u32, Uuid)> {
        self.requests
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.requested_at) > timeout)
            .map(|(block, r)| (*block, r.peer))
            .collect()
    }

    /// Drop a request iff it belongs to that peer.
    pub fn cancel_request(&mut self, block: u32, peer: Uuid) -> bool {
        if let Some(request) = self.requests.get(&block) {
            if request.peer == peer {
                self.requests.remove(&block);
                return true;
            }
        }
        if let Some(peers) = self.endgame_requests.get_mut(&block) {
            if let Some(position) = peers.iter().position(|id| *id == peer) {
                peers.swap_remove(position);
                if peers.is_empty() {
                    self.endgame_requests.remove(&block);
                }
                return true;
            }
        }
        false
    }

    /// Remove every request owned by the peer. Returns how many were
    /// dropped; the exclusive claim is released when it was theirs.
    pub fn clear_requests_for_peer(&mut self, peer: Uuid) -> usize {
        let before = self.requests.len();
        self.requests.retain(|_, r| r.peer != peer);
        let mut cleared = before - self.requests.len();
        self.endgame_requests.retain(|_, peers| {
            let len = peers.len();
            peers.retain(|id| *id != peer);
            cleared += len - peers.len();
            !peers.is_empty()
        });
        if self.exclusive_peer == Some(peer) {
            self.exclusive_peer = None;
        }
        cleared
    }

    /// All request owners, deduplicated. Used when a piece is thrown away.
    pub fn requesting_peers(&self) -> HashMap<Uuid, usize> {
        let mut owners: HashMap<Uuid, usize> = HashMap::new();
        for request in self.requests.values() {
            *owners.entry(request.peer).or_default() += 1;
        }
        for peers in self.endgame_requests.values() {
            for peer in peers {
                *owners.entry(*peer).or_default() += 1;
            }
        }
        owners
    }

    pub fn has_outstanding_requests(&self) -> bool {
        !self.requests.is_empty() || !self.endgame_requests.is_empty()
    }

    pub fn claim_exclusive(&mut self, peer: Uuid) {
        if self.exclusive_peer.is_none() {
            self.exclusive_peer = Some(peer);
        }
    }

    pub fn exclusive_peer(&self) -> Option<Uuid> {
        self.exclusive_peer
    }

    /// A claimed piece only accepts new requests from the claimant or from
    /// another fast peer; unclaimed pieces accept anyone.
    pub fn can_request_from(&self, peer: Uuid, peer_is_fast: bool) -> bool {
        match self.exclusive_peer {
            None => true,
            Some(owner) => owner == peer || peer_is_fast,
        }
    }

    pub fn should_abandon(&self, timeout: Duration, min_progress: f64, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
            && self.progress() < min_progress
    }

    /// Full piece payload. Only valid once every block arrived.
    pub fn assemble(&mut self) -> Bytes {
        debug_assert!(self.is_complete());
        self.buffer.split().freeze()
    }

    pub fn contributing_peers(&self) -> &HashSet<Uuid> {
        &self.contributors
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// Give up the backing buffer (pool return on eviction).
    pub fn into_buffer(self) -> BytesMut {
        self.buffer
    }
}
