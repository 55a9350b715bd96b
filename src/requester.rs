use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::availability::PieceAvailability;
use crate::bandwidth::TokenBucket;
use crate::bitfield::BitField;
use crate::endgame::EndgameManager;
use crate::pieces::{ActivePieceManager, Block, PieceLayout, Priority, BLOCK_LENGTH};

/// Cap on how many fresh candidates a single fill considers when scanning
/// for a seed (seeds have everything, the scan would otherwise be O(pieces)).
const SEED_CANDIDATE_CAP: usize = 64;

/// Per-peer view the requester fills against.
#[derive(Debug)]
pub struct PeerRequestState<'a> {
    pub uuid: Uuid,
    pub bitfield: &'a BitField,
    /// Requests currently in flight to this peer.
    pub pending: usize,
    /// The peer's advertised request queue depth (`reqq`).
    pub pipeline_depth: usize,
    pub download_rate: u64,
}

#[derive(Debug, Default)]
pub struct FillOutcome {
    /// Batch to flush in one transport call, in issue order.
    pub requests: Vec<Block>,
    /// Set when the download bucket ran dry mid-fill.
    pub retry_in: Option<Duration>,
}

/// The per-peer pipeline-filling algorithm: drain existing partials in
/// rarest-first order, then activate new pieces unless the partial cap or
/// piece capacity pushes back, then duplicate remaining blocks in endgame.
#[derive(Debug)]
pub struct PieceRequester {
    max_pipeline_depth: usize,
    fast_peer_speed: u64,
}

impl PieceRequester {
    pub fn new(max_pipeline_depth: usize, fast_peer_speed: u64) -> Self {
        Self {
            max_pipeline_depth,
            fast_peer_speed,
        }
    }

    /// Effective pipeline cap for one peer. A rate limit caps it further so
    /// one fast peer cannot monopolize the whole allowance.
    pub fn pipeline_limit(&self, peer_depth: usize, rate_limit: u64) -> usize {
        let mut limit = peer_depth.min(self.max_pipeline_depth);
        if rate_limit > 0 {
            limit = limit.min(((rate_limit / BLOCK_LENGTH as u64) as usize).max(1));
        }
        limit
    }

    pub fn is_fast(&self, download_rate: u64) -> bool {
        download_rate >= self.fast_peer_speed
    }

    #[allow(clippy::too_many_arguments)]
    pub fn fill(
        &self,
        peer: &PeerRequestState,
        pieces: &mut ActivePieceManager,
        availability: &PieceAvailability,
        endgame: &EndgameManager,
        priorities: &[Priority],
        our_bitfield: &BitField,
        layout: PieceLayout,
        mut bucket: Option<&mut TokenBucket>,
        connected_peers: usize,
        now: Instant,
    ) -> FillOutcome {
        let mut out = FillOutcome::default();
        let rate_limit = bucket.as_ref().map_or(0, |b| b.rate());
        let limit = self.pipeline_limit(peer.pipeline_depth, rate_limit);
        let mut budget = limit.saturating_sub(peer.pending);
        if budget == 0 {
            return out;
        }
        let is_fast = self.is_fast(peer.download_rate);

        // Phase 1: existing partials, rarest first
        for index in pieces.partials_rarest_first(availability, priorities) {
            if budget == 0 || out.retry_in.is_some() {
                break;
            }
            if !peer.bitfield.has(index) {
                continue;
            }
            let Some(piece) = pieces.get_mut(index) else {
                continue;
            };
            if !piece.can_request_from(peer.uuid, is_fast) {
                continue;
            }
            for block in piece.needed_blocks(budget) {
                if !consume(&mut bucket, now, &mut out) {
                    break;
                }
                piece.add_request(block, peer.uuid, now, false);
                out.requests.push(Block {
                    piece: index as u32,
                    offset: piece.block_offset(block),
                    length: piece.block_length(block),
                });
                budget -= 1;
            }
            pieces.promote_to_fully_requested(index);
        }

        // Phase 2: activate new pieces, unless partials need draining first
        let partials_full = pieces.partial_count() >= pieces.max_partials(connected_peers);
        if budget > 0 && out.retry_in.is_none() && !partials_full {
            let candidates =
                self.candidates(peer, pieces, availability, priorities, our_bitfield, budget);
            for index in candidates {
                if budget == 0 || out.retry_in.is_some() {
                    break;
                }
                let Some(piece) = pieces.get_or_create(index, layout.piece_len(index), now) else {
                    // capacity back-pressure, stop activating entirely
                    break;
                };
                if is_fast {
                    piece.claim_exclusive(peer.uuid);
                }
                for block in piece.needed_blocks(budget) {
                    if !consume(&mut bucket, now, &mut out) {
                        break;
                    }
                    piece.add_request(block, peer.uuid, now, false);
                    out.requests.push(Block {
                        piece: index as u32,
                        offset: piece.block_offset(block),
                        length: piece.block_length(block),
                    });
                    budget -= 1;
                }
                pieces.promote_to_fully_requested(index);
                if pieces.partial_count() >= pieces.max_partials(connected_peers) {
                    break;
                }
            }
        }

        // Phase 3: endgame duplication of blocks still in flight elsewhere
        if endgame.is_active() && budget > 0 && out.retry_in.is_none() {
            for index in pieces.active_download_indices() {
                if budget == 0 || out.retry_in.is_some() {
                    break;
                }
                if !peer.bitfield.has(index) {
                    continue;
                }
                let Some(piece) = pieces.get_mut(index) else {
                    continue;
                };
                for block in piece.needed_blocks_endgame(peer.uuid, budget) {
                    if !consume(&mut bucket, now, &mut out) {
                        break;
                    }
                    piece.add_request(block, peer.uuid, now, true);
                    out.requests.push(Block {
                        piece: index as u32,
                        offset: piece.block_offset(block),
                        length: piece.block_length(block),
                    });
                    budget -= 1;
                }
            }
        }

        out
    }

    /// Candidate pieces for activation. Non-seeds use the per-peer index
    /// (O(pieces the peer has)); seeds get a bounded linear scan from the
    /// first piece we miss.
    fn candidates(
        &self,
        peer: &PeerRequestState,
        pieces: &ActivePieceManager,
        availability: &PieceAvailability,
        priorities: &[Priority],
        our_bitfield: &BitField,
        budget: usize,
    ) -> Vec<usize> {
        let mut candidates: Vec<usize> = if peer.bitfield.has_all() {
            our_bitfield
                .missing_pieces()
                .filter(|index| !pieces.is_active(*index))
                .take(SEED_CANDIDATE_CAP.max(budget))
                .collect()
        } else {
            match availability.peer_index(peer.uuid) {
                Some(index) => index
                    .iter()
                    .copied()
                    .filter(|index| !pieces.is_active(*index) && !our_bitfield.has(*index))
                    .collect(),
                None => Vec::new(),
            }
        };
        pieces.sort_candidates(&mut candidates, availability, priorities);
        candidates
    }
}

fn consume(bucket: &mut Option<&mut TokenBucket>, now: Instant, out: &mut FillOutcome) -> bool {
    let Some(bucket) = bucket else {
        return true;
    };
    if bucket.try_consume(BLOCK_LENGTH as u64, now) {
        return true;
    }
    out.retry_in = Some(Duration::from_millis(
        bucket.ms_until_available(BLOCK_LENGTH as u64, now),
    ));
    false
}
