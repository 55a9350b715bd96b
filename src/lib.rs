//! BitTorrent engine core: piece scheduling, swarm management, choking and
//! bandwidth arbitration for one or more torrents.
//!
//! The crate deliberately stops at the engine boundary. Trackers, DHT and
//! local discovery feed peer addresses in through [`TorrentHandle`] and the
//! incoming-peer channel; content I/O and hashing live behind the
//! [`storage`] channel contract; presentation reads the
//! [`torrent::progress`] stream. Everything per-torrent runs on a single
//! task driven by a 100 ms tick, so the components compose without locks.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub mod availability;
pub mod bandwidth;
pub mod bitfield;
pub mod choke;
pub mod config;
pub mod connection;
pub mod endgame;
pub mod peers;
pub mod persist;
pub mod pieces;
pub mod protocol;
pub mod requester;
pub mod seeder;
pub mod session;
pub mod storage;
pub mod swarm;
pub mod torrent;
mod utils;

pub use bandwidth::{BandwidthTracker, Direction, TokenBucket, TrafficCategory};
pub use bitfield::BitField;
pub use config::EngineConfig;
pub use persist::{PersistedTorrent, UserState};
pub use pieces::{Block, Priority, BLOCK_LENGTH};
pub use protocol::Info;
pub use session::SessionContext;
pub use storage::{StorageFeedback, StorageHandle, StorageMessage};
pub use swarm::PeerSource;
pub use torrent::progress::{PeerSnapshot, ProgressConsumer, ProgressUpdate, StateChange};
pub use torrent::{NewPeer, Torrent, TorrentHandle, TorrentParams, TorrentState};

pub const CLIENT_NAME: &str = "torrent-engine 0.1";

/// Engine entry point: shared connection budget, task supervision and a
/// root cancellation token for every torrent opened through it.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    session: Arc<SessionContext>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            session: Arc::new(SessionContext::new(config.max_connections)),
            config,
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> Arc<SessionContext> {
        self.session.clone()
    }

    /// Open a torrent. The host supplies the storage actor's channels and
    /// the channel its listener pushes accepted peers into.
    pub fn open(
        &self,
        params: TorrentParams,
        storage: StorageHandle,
        storage_rx: mpsc::Receiver<StorageFeedback>,
        new_peers: mpsc::Receiver<NewPeer>,
        progress: impl ProgressConsumer,
    ) -> TorrentHandle {
        self.session.register_torrent();
        let torrent = Torrent::new(
            self.config.clone(),
            params,
            self.session.clone(),
            storage,
            storage_rx,
            new_peers,
            self.cancellation_token.child_token(),
        );
        torrent.start(progress, &self.task_tracker)
    }

    /// Cancel every torrent and wait for their tasks to drain.
    pub async fn shutdown(&self) {
        self.task_tracker.close();
        self.cancellation_token.cancel();
        self.task_tracker.wait().await
    }
}
