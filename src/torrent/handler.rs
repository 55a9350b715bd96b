//! Wire-event dispatch: every message a peer task forwards lands here and
//! fans out into the bitfield/availability/piece machinery. Block receipt
//! itself (`handle_block`) stays with the orchestrator since it drives
//! finalization.

use std::time::Instant;

use bytes::Bytes;
use uuid::Uuid;

use crate::bandwidth::{Direction, TrafficCategory};
use crate::bitfield::BitField;
use crate::pieces::Block;
use crate::protocol::peer::PeerMessage;
use crate::protocol::ut_metadata::{UtMessage, UtMetadata};

use super::active_peer::{ActivePeer, DeferredBits};
use super::progress::StateChange;
use super::{Torrent, TorrentMeta, MAX_REQUEST_LENGTH};

impl Torrent {
    pub(super) fn drain_peer_messages(&mut self, idx: usize, now: Instant) {
        loop {
            let Some(peer) = self.peers.get(idx) else {
                return;
            };
            let Ok(message) = peer.message_rx.try_recv() else {
                return;
            };
            self.bandwidth.record(
                TrafficCategory::PeerProtocol,
                Direction::Down,
                message.frame_len() as u64,
                now,
            );
            if let Err(violation) = self.handle_peer_message(idx, message, now) {
                let peer = &self.peers[idx];
                tracing::warn!(addr = %peer.addr, "Closing peer: {violation}");
                peer.cancel();
                return;
            }
        }
    }

    /// Returns `Err` on a protocol violation; the peer gets closed, never
    /// banned.
    pub(super) fn handle_peer_message(
        &mut self,
        idx: usize,
        message: PeerMessage,
        now: Instant,
    ) -> anyhow::Result<()> {
        match message {
            PeerMessage::HeartBeat => {}
            PeerMessage::Choke => {
                let peer = &mut self.peers[idx];
                peer.in_status.set_choke(true, now);
                let uuid = peer.uuid;
                let addr = peer.addr;
                // pending counter is ground truth: zero it and free blocks
                peer.pending_blocks = 0;
                if let Some(meta) = &mut self.meta {
                    meta.pieces.clear_requests_for_peer(uuid);
                }
                self.changes.push(StateChange::InChoke { addr, choked: true });
            }
            PeerMessage::Unchoke => {
                let peer = &mut self.peers[idx];
                peer.in_status.set_choke(false, now);
                let addr = peer.addr;
                self.changes.push(StateChange::InChoke {
                    addr,
                    choked: false,
                });
            }
            PeerMessage::Interested => {
                // the choker is authoritative, no inline unchoke
                self.peers[idx].in_status.set_interest(true);
            }
            PeerMessage::NotInterested => {
                self.peers[idx].in_status.set_interest(false);
            }
            PeerMessage::Have { index } => self.handle_have(idx, index)?,
            PeerMessage::Bitfield { payload } => self.handle_bitfield(idx, payload)?,
            PeerMessage::HaveAll => self.handle_have_all(idx)?,
            PeerMessage::HaveNone => self.handle_have_none(idx),
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => self.handle_block(idx, index, begin, block, now)?,
            PeerMessage::Request {
                index,
                begin,
                length,
            } => self.handle_request(idx, index, begin, length)?,
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => {
                let peer = &self.peers[idx];
                self.seeder.cancel(
                    peer.uuid,
                    Block {
                        piece: index,
                        offset: begin,
                        length,
                    },
                );
            }
            PeerMessage::ExtensionHandshake { payload } => {
                let peer = &mut self.peers[idx];
                peer.apply_extension_handshake(payload);
                let client_name = peer.client_name();
                let peer_id = peer.handshake.peer_id.0;
                let addr = peer.addr;
                self.swarm.set_identity(&addr, peer_id, Some(client_name));
                self.maybe_start_metadata_fetch(idx);
            }
            PeerMessage::Extension {
                extension_id,
                payload,
            } => self.handle_extension(idx, extension_id, payload)?,
        }
        Ok(())
    }

    pub(super) fn handle_have(&mut self, idx: usize, index: u32) -> anyhow::Result<()> {
        let peer = &mut self.peers[idx];
        let Some(meta) = &mut self.meta else {
            peer.deferred_bits.push(DeferredBits::Have(index));
            return Ok(());
        };
        anyhow::ensure!(
            (index as usize) < meta.bitfield.len(),
            "HAVE index {index} out of range"
        );
        let piece = index as usize;
        if !peer.bitfield.set(piece) {
            return Ok(());
        }
        meta.availability.on_have(peer.uuid, piece, &peer.bitfield);
        if !meta.bitfield.has(piece) && !peer.bitfield.has_all() {
            meta.availability.add_piece_to_index(peer.uuid, piece);
        }
        self.update_interest(idx);
        Ok(())
    }

    pub(super) fn handle_bitfield(&mut self, idx: usize, payload: Bytes) -> anyhow::Result<()> {
        let peer = &mut self.peers[idx];
        let Some(meta) = &mut self.meta else {
            peer.deferred_bits.push(DeferredBits::Bitfield(payload));
            return Ok(());
        };
        let bitfield = BitField::from_bytes(&payload, meta.bitfield.len())?;
        peer.bitfield = bitfield;
        Self::index_peer_pieces(meta, peer);
        self.update_interest(idx);
        Ok(())
    }

    pub(super) fn handle_have_all(&mut self, idx: usize) -> anyhow::Result<()> {
        let peer = &mut self.peers[idx];
        anyhow::ensure!(
            peer.handshake.supports_fast(),
            "HAVE_ALL without fast extension"
        );
        let Some(meta) = &mut self.meta else {
            peer.deferred_bits.push(DeferredBits::HaveAll);
            return Ok(());
        };
        peer.bitfield = BitField::full(meta.bitfield.len());
        meta.availability.on_have_all();
        self.update_interest(idx);
        Ok(())
    }

    pub(super) fn handle_have_none(&mut self, idx: usize) {
        let peer = &mut self.peers[idx];
        if self.meta.is_none() {
            peer.deferred_bits.push(DeferredBits::HaveNone);
        }
    }

    fn index_peer_pieces(meta: &mut TorrentMeta, peer: &ActivePeer) {
        let TorrentMeta {
            availability,
            bitfield,
            priorities,
            ..
        } = meta;
        availability.on_bitfield(&peer.bitfield);
        if peer.bitfield.has_all() {
            return;
        }
        availability.build_peer_index(peer.uuid, &peer.bitfield, |piece| {
            !bitfield.has(piece)
                && priorities
                    .get(piece)
                    .is_some_and(|priority| !priority.is_disabled())
        });
    }

    /// Recompute whether we want anything this peer has, announcing flips.
    pub(super) fn update_interest(&mut self, idx: usize) {
        let Some(meta) = &self.meta else {
            return;
        };
        let peer = &mut self.peers[idx];
        let interesting = if peer.bitfield.has_all() {
            !meta.bitfield.has_all()
        } else {
            meta.bitfield
                .missing_pieces()
                .any(|piece| peer.bitfield.has(piece))
        };
        if interesting && !peer.out_status.is_interested() {
            peer.out_status.set_interest(true);
            peer.queue(PeerMessage::Interested);
        } else if !interesting && peer.out_status.is_interested() {
            peer.out_status.set_interest(false);
            peer.queue(PeerMessage::NotInterested);
        }
    }

    fn handle_request(
        &mut self,
        idx: usize,
        index: u32,
        begin: u32,
        length: u32,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(length <= MAX_REQUEST_LENGTH, "REQUEST length overflow");
        let Some(meta) = &self.meta else {
            anyhow::bail!("REQUEST before metadata");
        };
        anyhow::ensure!(
            (index as usize) < meta.bitfield.len(),
            "REQUEST piece index out of range"
        );
        let piece_len = meta.layout.piece_len(index as usize);
        anyhow::ensure!(
            begin.checked_add(length).is_some_and(|end| end <= piece_len),
            "REQUEST range outside piece"
        );
        let peer = &self.peers[idx];
        if peer.out_status.is_choked() {
            // stale request racing our choke, drop silently
            return Ok(());
        }
        if !meta.bitfield.has(index as usize) {
            anyhow::bail!("REQUEST for piece we do not have");
        }
        self.seeder.enqueue(
            peer.uuid,
            Block {
                piece: index,
                offset: begin,
                length,
            },
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // metadata fetch (BEP 9)

    fn maybe_start_metadata_fetch(&mut self, idx: usize) {
        if self.meta.is_some() || self.metadata_fetch.is_some() {
            return;
        }
        let peer = &self.peers[idx];
        let Some(handshake) = peer.extension_handshake.as_deref() else {
            return;
        };
        let Some(fetch) = UtMetadata::from_handshake(handshake) else {
            return;
        };
        tracing::info!(size = fetch.size(), "Starting metadata fetch");
        self.metadata_fetch = Some(fetch);
        self.metadata_source = Some(peer.uuid);
        self.request_next_metadata_block(idx);
    }

    fn request_next_metadata_block(&mut self, idx: usize) {
        let Some(fetch) = &self.metadata_fetch else {
            return;
        };
        let Some(request) = fetch.next_request() else {
            return;
        };
        let peer = &mut self.peers[idx];
        // each peer picks its own id for ut_metadata in its handshake
        let Some(remote_id) = peer
            .extension_handshake
            .as_deref()
            .and_then(|h| h.ut_metadata_id())
        else {
            return;
        };
        peer.queue(PeerMessage::Extension {
            extension_id: remote_id,
            payload: request.as_bytes().into(),
        });
    }

    /// The current metadata source is gone or refused; pick another peer
    /// that can serve the info dictionary.
    pub(super) fn reassign_metadata_source(&mut self, exclude: Option<Uuid>) {
        if self.meta.is_some() || self.metadata_fetch.is_none() {
            return;
        }
        let candidate = self.peers.iter().position(|p| {
            Some(p.uuid) != exclude
                && p.extension_handshake
                    .as_deref()
                    .and_then(|h| h.ut_metadata_id())
                    .is_some()
        });
        match candidate {
            Some(idx) => {
                self.metadata_source = Some(self.peers[idx].uuid);
                self.request_next_metadata_block(idx);
            }
            None => self.metadata_source = None,
        }
    }

    fn handle_extension(&mut self, idx: usize, extension_id: u8, payload: Bytes) -> anyhow::Result<()> {
        use crate::protocol::extension::Extension;
        if extension_id == UtMessage::CLIENT_ID {
            self.handle_ut_metadata(idx, payload)?;
        } else {
            tracing::trace!(extension_id, "Ignoring unknown extension message");
        }
        Ok(())
    }

    fn handle_ut_metadata(&mut self, idx: usize, payload: Bytes) -> anyhow::Result<()> {
        let message = UtMessage::from_bytes(&payload)?;
        match message {
            UtMessage::Request { piece } => Ok(self.serve_metadata_block(idx, piece)),
            UtMessage::Data { piece, total_size } => {
                let Some(fetch) = &mut self.metadata_fetch else {
                    return Ok(());
                };
                anyhow::ensure!(total_size == fetch.size(), "metadata size changed mid-fetch");
                let header_len = UtMessage::Data { piece, total_size }.as_bytes().len();
                fetch.save_block(piece, payload.slice(header_len..))?;
                match fetch.verify(self.info_hash) {
                    Ok(Some(info)) => {
                        self.metadata_fetch = None;
                        self.init_piece_info(info);
                    }
                    Ok(None) => self.request_next_metadata_block(idx),
                    Err(e) => {
                        tracing::warn!("Metadata verification failed, restarting fetch: {e}");
                        self.request_next_metadata_block(idx);
                    }
                }
                Ok(())
            }
            UtMessage::Reject { piece } => {
                tracing::debug!(piece, "Peer rejected metadata request");
                let uuid = self.peers[idx].uuid;
                self.reassign_metadata_source(Some(uuid));
                Ok(())
            }
        }
    }

    fn serve_metadata_block(&mut self, idx: usize, piece: usize) {
        let peer = &mut self.peers[idx];
        let Some(remote_id) = peer
            .extension_handshake
            .as_deref()
            .and_then(|h| h.ut_metadata_id())
        else {
            return;
        };
        let response = match &self.meta {
            Some(meta) => {
                let raw = meta.info.as_bytes();
                let start = piece * UtMetadata::BLOCK_SIZE;
                if start >= raw.len() {
                    UtMessage::Reject { piece }.as_bytes()
                } else {
                    let end = (start + UtMetadata::BLOCK_SIZE).min(raw.len());
                    let mut bytes = UtMessage::Data {
                        piece,
                        total_size: raw.len(),
                    }
                    .as_bytes();
                    bytes.extend_from_slice(&raw[start..end]);
                    bytes
                }
            }
            None => UtMessage::Reject { piece }.as_bytes(),
        };
        peer.queue(PeerMessage::Extension {
            extension_id: remote_id,
            payload: response.into(),
        });
    }
}
