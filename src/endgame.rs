use uuid::Uuid;

use crate::pieces::{ActivePiece, Block};

/// Terminal download phase: once every missing block is already requested
/// somewhere, duplicate the remaining requests across peers so a single
/// stalled peer cannot hold the last blocks hostage.
#[derive(Debug, Default)]
pub struct EndgameManager {
    active: bool,
}

impl EndgameManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Re-check the endgame condition. Returns the new state on a
    /// transition, `None` when nothing changed.
    pub fn evaluate(
        &mut self,
        missing_pieces: usize,
        active_pieces: usize,
        any_unrequested_blocks: bool,
    ) -> Option<bool> {
        let should_be_active =
            missing_pieces > 0 && missing_pieces <= active_pieces && !any_unrequested_blocks;
        if should_be_active == self.active {
            return None;
        }
        self.active = should_be_active;
        if self.active {
            tracing::info!(missing_pieces, "Entering endgame mode");
        } else {
            tracing::debug!("Leaving endgame mode");
        }
        Some(self.active)
    }

    /// CANCEL messages owed after a block completed: one per losing peer
    /// that still had the same block in flight.
    pub fn cancels_for_block(
        &self,
        piece: &ActivePiece,
        block: u32,
        losers: &[Uuid],
    ) -> Vec<(Uuid, Block)> {
        let cancel = Block {
            piece: piece.index() as u32,
            offset: piece.block_offset(block),
            length: piece.block_length(block),
        };
        losers.iter().map(|peer| (*peer, cancel)).collect()
    }
}
