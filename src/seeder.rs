use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use uuid::Uuid;

use crate::bandwidth::TokenBucket;
use crate::pieces::Block;
use crate::storage::StorageHandle;

const PIECE_CACHE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedRequest {
    pub peer: Uuid,
    pub block: Block,
}

#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// PIECE payloads ready to go out right now (cache hits).
    pub sends: Vec<(Uuid, Block, Bytes)>,
    /// The upload bucket refused; retry after this long.
    pub retry_in: Option<Duration>,
}

/// Per-torrent upload pipeline: a FIFO of peer REQUESTs, drained through
/// the upload token bucket. Piece reads go to the storage actor; recently
/// read pieces are kept in a small cache since peers request blocks of the
/// same piece back to back.
#[derive(Debug)]
pub struct Seeder {
    queue: VecDeque<QueuedRequest>,
    pending_reads: HashMap<usize, Vec<QueuedRequest>>,
    cache: lru::LruCache<usize, Bytes>,
    storage: StorageHandle,
}

impl Seeder {
    pub fn new(storage: StorageHandle) -> Self {
        Self {
            queue: VecDeque::new(),
            pending_reads: HashMap::new(),
            cache: lru::LruCache::new(NonZeroUsize::new(PIECE_CACHE_SIZE).unwrap()),
            storage,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue(&mut self, peer: Uuid, block: Block) {
        self.queue.push_back(QueuedRequest { peer, block });
    }

    /// Drop everything queued for a peer (BEP 3: a choke discards all
    /// pending requests). Also used on disconnect.
    pub fn discard_peer(&mut self, peer: Uuid) {
        self.queue.retain(|entry| entry.peer != peer);
        for waiters in self.pending_reads.values_mut() {
            waiters.retain(|entry| entry.peer != peer);
        }
    }

    /// Drop everything (torrent stop); queued entries are simply discarded.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending_reads.clear();
    }

    /// Honor a CANCEL for a not-yet-sent block.
    pub fn cancel(&mut self, peer: Uuid, block: Block) {
        self.queue
            .retain(|entry| !(entry.peer == peer && entry.block == block));
        if let Some(waiters) = self.pending_reads.get_mut(&(block.piece as usize)) {
            waiters.retain(|entry| !(entry.peer == peer && entry.block == block));
        }
    }

    /// Pop queued requests while bandwidth allows. Entries for peers that
    /// disappeared or got re-choked are skipped without consuming tokens.
    pub fn drain(
        &mut self,
        mut bucket: Option<&mut TokenBucket>,
        mut peer_is_servable: impl FnMut(Uuid) -> bool,
        now: Instant,
    ) -> DrainOutcome {
        let mut out = DrainOutcome::default();
        while let Some(entry) = self.queue.pop_front() {
            if !peer_is_servable(entry.peer) {
                continue;
            }
            if let Some(bucket) = bucket.as_deref_mut() {
                if !bucket.try_consume(entry.block.length as u64, now) {
                    let wait = bucket.ms_until_available(entry.block.length as u64, now);
                    out.retry_in = Some(Duration::from_millis(wait));
                    self.queue.push_front(entry);
                    break;
                }
            }
            let piece = entry.block.piece as usize;
            if let Some(bytes) = self.cache.get(&piece) {
                out.sends
                    .push((entry.peer, entry.block, bytes.slice(entry.block.range())));
                continue;
            }
            let waiters = self.pending_reads.entry(piece).or_default();
            if waiters.is_empty() {
                if let Err(e) = self.storage.try_read(piece) {
                    tracing::warn!("Skipping upload request, storage unavailable: {e}");
                    self.pending_reads.remove(&piece);
                    continue;
                }
            }
            waiters.push(entry);
        }
        out
    }

    /// Storage answered a read. `None` is a transient failure: log and
    /// drop the waiting requests for that piece.
    pub fn on_piece_data(&mut self, piece: usize, bytes: Option<Bytes>) -> Vec<(Uuid, Block, Bytes)> {
        let waiters = self.pending_reads.remove(&piece).unwrap_or_default();
        let Some(bytes) = bytes else {
            tracing::warn!(piece, "Piece read failed, dropping {} queued uploads", waiters.len());
            return Vec::new();
        };
        self.cache.put(piece, bytes.clone());
        waiters
            .into_iter()
            .map(|entry| {
                let payload = bytes.slice(entry.block.range());
                (entry.peer, entry.block, payload)
            })
            .collect()
    }
}
