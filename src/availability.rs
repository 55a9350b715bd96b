use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::bitfield::BitField;

/// Swarm-wide piece availability: a per-piece count of non-seed holders
/// plus a single seed count, and a per-peer index of pieces the peer has
/// that we still need (the requester's candidate source for non-seeds).
///
/// True availability of piece `i` is `counts[i] + seeds`; seeds never touch
/// the per-piece array, which keeps HAVE_ALL O(1).
#[derive(Debug)]
pub struct PieceAvailability {
    counts: Vec<u16>,
    seeds: usize,
    peer_index: HashMap<Uuid, HashSet<usize>>,
}

impl PieceAvailability {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            counts: vec![0; num_pieces],
            seeds: 0,
            peer_index: HashMap::new(),
        }
    }

    pub fn availability(&self, piece: usize) -> u32 {
        self.counts.get(piece).copied().unwrap_or(0) as u32 + self.seeds as u32
    }

    pub fn non_seed_count(&self, piece: usize) -> u16 {
        self.counts.get(piece).copied().unwrap_or(0)
    }

    pub fn seed_count(&self) -> usize {
        self.seeds
    }

    pub fn on_bitfield(&mut self, bf: &BitField) {
        if bf.has_all() {
            self.seeds += 1;
            return;
        }
        for piece in bf.pieces() {
            if let Some(count) = self.counts.get_mut(piece) {
                *count += 1;
            }
        }
    }

    pub fn on_have_all(&mut self) {
        self.seeds += 1;
    }

    pub fn on_have_none(&mut self) {}

    /// Register a HAVE. `peer_bitfield` must already include the new piece.
    /// When the HAVE completes the peer we fold their per-piece
    /// contributions into the seed count and drop their index.
    pub fn on_have(&mut self, peer: Uuid, piece: usize, peer_bitfield: &BitField) {
        if peer_bitfield.has_all() {
            for held in peer_bitfield.pieces() {
                if held == piece {
                    continue;
                }
                if let Some(count) = self.counts.get_mut(held) {
                    *count = count.saturating_sub(1);
                }
            }
            self.seeds += 1;
            self.peer_index.remove(&peer);
            return;
        }
        if let Some(count) = self.counts.get_mut(piece) {
            *count += 1;
        }
    }

    pub fn on_peer_disconnected(&mut self, peer: Uuid, was_seed: bool, peer_bitfield: &BitField) {
        if was_seed {
            self.seeds = self.seeds.saturating_sub(1);
        } else {
            for piece in peer_bitfield.pieces() {
                if let Some(count) = self.counts.get_mut(piece) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        self.peer_index.remove(&peer);
    }

    /// Fill the per-peer index with pieces the peer has and we still want.
    pub fn build_peer_index(
        &mut self,
        peer: Uuid,
        bf: &BitField,
        mut should_include: impl FnMut(usize) -> bool,
    ) {
        let pieces: HashSet<usize> = bf.pieces().filter(|piece| should_include(*piece)).collect();
        self.peer_index.insert(peer, pieces);
    }

    pub fn add_piece_to_index(&mut self, peer: Uuid, piece: usize) {
        if let Some(index) = self.peer_index.get_mut(&peer) {
            index.insert(piece);
        }
    }

    /// A piece we finished (or disabled) is no longer interesting anywhere.
    pub fn remove_piece_from_all_indices(&mut self, piece: usize) {
        for index in self.peer_index.values_mut() {
            index.remove(&piece);
        }
    }

    pub fn remove_peer_from_index(&mut self, peer: Uuid) {
        self.peer_index.remove(&peer);
    }

    pub fn peer_index(&self, peer: Uuid) -> Option<&HashSet<usize>> {
        self.peer_index.get(&peer)
    }
}
