use std::net::SocketAddr;

use super::TorrentState;

/// Discrete events since the previous progress dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
    InChoke { addr: SocketAddr, choked: bool },
    OutChoke { addr: SocketAddr, choked: bool },
    FinishedPiece(usize),
    DiscardedPiece(usize),
    MetadataResolved,
    TorrentStateChange(TorrentState),
    /// A should-never-happen condition was observed and logged; the engine
    /// keeps running.
    InvariantViolation(String),
}

#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    pub client_name: String,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub am_choking: bool,
    pub am_interested: bool,
    pub pending_blocks: usize,
}

/// One per-tick progress frame.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub tick_num: usize,
    pub percent: f32,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub peers: Vec<PeerSnapshot>,
    pub changes: Vec<StateChange>,
}

pub trait ProgressConsumer: Send + 'static {
    fn consume_progress(&mut self, progress: ProgressUpdate);
}

impl<F> ProgressConsumer for F
where
    F: FnMut(ProgressUpdate) + Send + 'static,
{
    fn consume_progress(&mut self, progress: ProgressUpdate) {
        self(progress);
    }
}

impl ProgressConsumer for tokio::sync::mpsc::Sender<ProgressUpdate> {
    fn consume_progress(&mut self, progress: ProgressUpdate) {
        let _ = self.try_send(progress);
    }
}

impl ProgressConsumer for tokio::sync::watch::Sender<ProgressUpdate> {
    fn consume_progress(&mut self, progress: ProgressUpdate) {
        let _ = self.send(progress);
    }
}

impl ProgressConsumer for flume::Sender<ProgressUpdate> {
    fn consume_progress(&mut self, progress: ProgressUpdate) {
        let _ = self.try_send(progress);
    }
}

impl ProgressConsumer for () {
    fn consume_progress(&mut self, _progress: ProgressUpdate) {}
}
